//! The tagged representation a VSET (or one of its time buckets) can hold.
//!
//! The C implementation this module's behaviour is modelled on discriminates
//! `{NONE, SINGLE, VECTOR, HASHTABLE, RAX}` by stealing the low three bits of
//! a tagged pointer so the whole thing fits in one machine word. Safe Rust has
//! no use for that trick — the workspace forbids `unsafe` outright — so the
//! "tag" here is simply the enum discriminant of [`Tag`] / [`SimpleRepr`];
//! niche optimisation gives single-entry and empty sets the same one-word
//! footprint the original got from pointer tagging.

use super::vector::EntryVec;

/// An entry's absolute expiration timestamp, in milliseconds. Implementors
/// are the caller-owned entry types a [`crate::vset::VSet`] is generic over;
/// this plays the role the thread-local expiry-getter callback played in the
/// original, as an ordinary trait bound instead of a callback threaded
/// through every call site.
pub trait Expiring {
    fn expiry(&self) -> i64;
}

/// Which of the four non-empty representations a bucket currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    None,
    Single,
    Vector,
    Hashtable,
    Rax,
}

/// The maximum length a `Vector` bucket may reach before it must split or
/// promote to `Hashtable`.
pub const VECTOR_MAX: usize = 127;

/// A non-empty, non-RAX representation: what a time bucket holds, and what a
/// [`crate::vset::VSet`] holds before it ever needs a RAX of buckets.
pub(crate) enum SimpleRepr<E> {
    Single(E),
    Vector(EntryVec<E>),
    Hashtable(Vec<E>),
}

/// Outcome of adding an entry to a [`SimpleRepr`].
pub(crate) enum AddOutcome<E> {
    /// Inserted in place; no further action needed.
    Done,
    /// The vector was already at [`VECTOR_MAX`]; `entry` was handed back
    /// unconsumed because the caller (which has the bucket's `bucket_ts`
    /// and RAX context) must decide whether to split the now-128-strong
    /// set across two buckets or promote it to `Hashtable`.
    VectorFull(E),
}

impl<E> SimpleRepr<E> {
    pub(crate) fn tag(&self) -> Tag {
        match self {
            SimpleRepr::Single(_) => Tag::Single,
            SimpleRepr::Vector(_) => Tag::Vector,
            SimpleRepr::Hashtable(_) => Tag::Hashtable,
        }
    }

    pub(crate) fn len(&self) -> usize {
        match self {
            SimpleRepr::Single(_) => 1,
            SimpleRepr::Vector(v) => v.len(),
            SimpleRepr::Hashtable(v) => v.len(),
        }
    }
}

impl<E: Expiring> SimpleRepr<E> {
    pub(crate) fn single(entry: E) -> Self {
        SimpleRepr::Single(entry)
    }

    /// Adds `entry`. Promotes `Single` to a two-element sorted `Vector`
    /// immediately; grows `Vector` in sorted position while it has room;
    /// once `Vector` is already at [`VECTOR_MAX`], leaves it untouched and
    /// reports [`AddOutcome::VectorFull`] with `entry` handed back so the
    /// caller can run the split/promote decision over all 128 entries;
    /// appends unconditionally to `Hashtable`.
    pub(crate) fn add(&mut self, entry: E) -> AddOutcome<E> {
        match self {
            SimpleRepr::Single(_) => {
                let SimpleRepr::Single(existing) = std::mem::replace(self, SimpleRepr::Hashtable(Vec::new())) else {
                    unreachable!()
                };
                let mut vec = EntryVec::new();
                vec.insert_sorted(existing);
                vec.insert_sorted(entry);
                *self = SimpleRepr::Vector(vec);
                AddOutcome::Done
            }
            SimpleRepr::Vector(v) => {
                if v.len() >= VECTOR_MAX {
                    return AddOutcome::VectorFull(entry);
                }
                v.insert_sorted(entry);
                AddOutcome::Done
            }
            SimpleRepr::Hashtable(v) => {
                v.push(entry);
                AddOutcome::Done
            }
        }
    }

    /// Removes the first entry equal to `target`. Demotes `Vector`/
    /// `Hashtable` down to `Single` when exactly one entry remains. Returns
    /// `(removed, now_empty)`; `now_empty` can only be true after removing
    /// from what was already a `Single`, signalling the caller should drop
    /// this bucket entirely.
    pub(crate) fn remove(&mut self, target: &E) -> (bool, bool)
    where
        E: PartialEq,
    {
        match self {
            SimpleRepr::Single(existing) => {
                if existing == target {
                    (true, true)
                } else {
                    (false, false)
                }
            }
            SimpleRepr::Vector(v) => {
                let Some(removed) = v.remove_matching(target) else {
                    return (false, false);
                };
                let _ = removed;
                if v.len() == 1 {
                    let last = v.pop().expect("length checked above");
                    *self = SimpleRepr::Single(last);
                }
                (true, false)
            }
            SimpleRepr::Hashtable(v) => {
                let Some(idx) = v.iter().position(|e| e == target) else {
                    return (false, false);
                };
                v.swap_remove(idx);
                if v.len() == 1 {
                    let last = v.pop().expect("length checked above");
                    *self = SimpleRepr::Single(last);
                }
                (true, false)
            }
        }
    }

    pub(crate) fn min_expiry(&self) -> i64 {
        match self {
            SimpleRepr::Single(e) => e.expiry(),
            SimpleRepr::Vector(v) => v.first().map_or(i64::MAX, Expiring::expiry),
            SimpleRepr::Hashtable(v) => v.iter().map(Expiring::expiry).min().unwrap_or(i64::MAX),
        }
    }

    pub(crate) fn max_expiry(&self) -> i64 {
        match self {
            SimpleRepr::Single(e) => e.expiry(),
            SimpleRepr::Vector(v) => v.last().map_or(i64::MIN, Expiring::expiry),
            SimpleRepr::Hashtable(v) => v.iter().map(Expiring::expiry).max().unwrap_or(i64::MIN),
        }
    }

    pub(crate) fn iter(&self) -> Box<dyn Iterator<Item = &E> + '_> {
        match self {
            SimpleRepr::Single(e) => Box::new(std::iter::once(e)),
            SimpleRepr::Vector(v) => Box::new(v.iter()),
            SimpleRepr::Hashtable(v) => Box::new(v.iter()),
        }
    }

    pub(crate) fn mem_usage(&self) -> usize {
        std::mem::size_of::<E>()
            * match self {
                SimpleRepr::Single(_) => 1,
                SimpleRepr::Vector(v) => v.capacity(),
                SimpleRepr::Hashtable(v) => v.capacity(),
            }
    }
}
