//! Fixed-width hex identifiers shared by the cluster and migration model.

use std::fmt;
use std::str::FromStr;

/// Number of hex characters (20 raw bytes) in a [`NodeId`] or
/// [`MigrationJobName`].
pub const NODE_ID_LEN: usize = 40;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IdParseError {
    #[error("expected {NODE_ID_LEN} hex characters, got {0}")]
    WrongLength(usize),
    #[error("not valid hex: {0}")]
    NotHex(String),
}

macro_rules! hex_id {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name([u8; NODE_ID_LEN / 2]);

        impl $name {
            /// Generates a value from 20 random bytes. Callers needing a
            /// cryptographically random export job name should supply bytes
            /// from their own RNG; this helper exists for tests and simple
            /// callers.
            #[must_use]
            pub fn from_bytes(bytes: [u8; NODE_ID_LEN / 2]) -> Self {
                Self(bytes)
            }

            #[must_use]
            pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN / 2] {
                &self.0
            }
        }

        impl FromStr for $name {
            type Err = IdParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if s.len() != NODE_ID_LEN {
                    return Err(IdParseError::WrongLength(s.len()));
                }
                let mut bytes = [0u8; NODE_ID_LEN / 2];
                for (i, chunk) in bytes.iter_mut().enumerate() {
                    let byte_str = &s[i * 2..i * 2 + 2];
                    *chunk = u8::from_str_radix(byte_str, 16)
                        .map_err(|_| IdParseError::NotHex(s.to_string()))?;
                }
                Ok(Self(bytes))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for b in &self.0 {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }
    };
}

hex_id!(NodeId, "A cluster node's fixed-width opaque identifier.");
hex_id!(
    MigrationJobName,
    "A migration job's fixed-width identifier: random for exports, copied from `ESTABLISH` for imports."
);
