//! A time bucket: the set of entries whose expiry falls in `[.., bucket_ts)`.

use super::tagged::{AddOutcome, Expiring, SimpleRepr, Tag};
use super::vector::EntryVec;

/// Smallest bucket window width, in milliseconds.
pub const GRAN_MIN: i64 = 16;
/// Largest bucket window width, in milliseconds.
pub const GRAN_MAX: i64 = 8192;

/// Smallest fine-grained window boundary strictly greater than `expiry`.
#[must_use]
pub(crate) fn bucket_ts(expiry: i64) -> i64 {
    (expiry & !(GRAN_MIN - 1)) + GRAN_MIN
}

/// Largest tolerated window end for `expiry` — the bucket keyed at this
/// timestamp or smaller is still allowed to hold `expiry`.
#[must_use]
pub(crate) fn max_bucket_ts(expiry: i64) -> i64 {
    (expiry & !(GRAN_MAX - 1)) + GRAN_MAX
}

/// A RAX leaf: a window `[.., bucket_ts)` holding entries with
/// `expiry(e) < bucket_ts`, represented as `Single`, `Vector`, or
/// `Hashtable` (never `Rax` — nesting buckets inside buckets is not part of
/// the promotion algebra).
pub(crate) struct TimeBucket<E> {
    pub(crate) bucket_ts: i64,
    pub(crate) body: SimpleRepr<E>,
}

impl<E: Expiring> TimeBucket<E> {
    pub(crate) fn new(bucket_ts: i64, entry: E) -> Self {
        debug_assert!(entry.expiry() < bucket_ts);
        Self {
            bucket_ts,
            body: SimpleRepr::single(entry),
        }
    }

    pub(crate) fn from_vector(bucket_ts: i64, vector: EntryVec<E>) -> Self {
        Self {
            bucket_ts,
            body: SimpleRepr::Vector(vector),
        }
    }

    pub(crate) fn tag(&self) -> Tag {
        self.body.tag()
    }

    pub(crate) fn len(&self) -> usize {
        self.body.len()
    }

    pub(crate) fn add(&mut self, entry: E) -> AddOutcome<E> {
        debug_assert!(entry.expiry() < self.bucket_ts);
        self.body.add(entry)
    }

    pub(crate) fn remove(&mut self, target: &E) -> (bool, bool)
    where
        E: PartialEq,
    {
        self.body.remove(target)
    }

    pub(crate) fn min_expiry(&self) -> i64 {
        self.body.min_expiry()
    }

    pub(crate) fn iter(&self) -> Box<dyn Iterator<Item = &E> + '_> {
        self.body.iter()
    }

    pub(crate) fn mem_usage(&self) -> usize {
        self.body.mem_usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_ts_is_next_fine_boundary() {
        assert_eq!(bucket_ts(0), 16);
        assert_eq!(bucket_ts(15), 16);
        assert_eq!(bucket_ts(16), 32);
        assert_eq!(bucket_ts(17), 32);
    }

    #[test]
    fn max_bucket_ts_is_coarse_boundary() {
        assert_eq!(max_bucket_ts(0), 8192);
        assert_eq!(max_bucket_ts(8191), 8192);
        assert_eq!(max_bucket_ts(8192), 16384);
    }

    #[test]
    fn max_bucket_ts_is_always_gte_bucket_ts() {
        for e in (0..20_000).step_by(37) {
            assert!(max_bucket_ts(e) >= bucket_ts(e));
        }
    }
}
