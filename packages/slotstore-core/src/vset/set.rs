//! `VSet<E>`: the top-level container, owning the promotion/demotion
//! algebra across `NONE`, `Simple` (`Single`/`Vector`/`Hashtable`), and `Rax`
//! (a `BTreeMap` of time buckets).

use std::collections::BTreeMap;
use std::ops::Bound;

use super::bucket::{bucket_ts, max_bucket_ts, TimeBucket};
use super::tagged::{AddOutcome, Expiring, SimpleRepr, Tag, VECTOR_MAX};
use super::vector::EntryVec;

enum Repr<E> {
    None,
    Simple(SimpleRepr<E>),
    /// Keys are a bucket's `bucket_ts`; see the module doc for the ordering
    /// invariant this relies on.
    Rax(BTreeMap<i64, TimeBucket<E>>),
}

/// An adaptive set of entries carrying absolute expiration timestamps.
///
/// Generic over the entry type and its [`Expiring`] implementation rather
/// than over a thread-local comparator callback — the container is
/// parameterised on the comparator through the trait bound instead.
/// Entries are owned by the caller in the sense that `VSet` never looks
/// inside them beyond `expiry()`; nothing here reaches back into a key
/// space or allocator.
pub struct VSet<E> {
    repr: Repr<E>,
    len: usize,
}

impl<E> Default for VSet<E> {
    fn default() -> Self {
        Self {
            repr: Repr::None,
            len: 0,
        }
    }
}

/// Outcome of splitting a full (128-entry) vector, per the §4.1 split
/// policy.
enum SplitOutcome<E> {
    /// The key implied by the vector's own contents is tighter than the key
    /// it was filed under; move the whole vector under the new key instead
    /// of splitting it.
    Relocate { new_key: i64, vector: EntryVec<E> },
    /// The vector spans more than one fine-grained window; split at the
    /// boundary closest to the median.
    Split {
        low_key: i64,
        low: EntryVec<E>,
        high_key: i64,
        high: EntryVec<E>,
    },
    /// Every entry shares one fine-grained window; promote to `Hashtable`.
    Hashtable(Vec<E>),
}

fn split_full_vector<E: Expiring>(vector: EntryVec<E>, bucket_key: i64) -> SplitOutcome<E> {
    let min_expiry = vector.first().expect("full vector is never empty").expiry();
    let max_expiry = vector.last().expect("full vector is never empty").expiry();

    if bucket_ts(max_expiry) < bucket_key {
        return SplitOutcome::Relocate {
            new_key: bucket_ts(max_expiry),
            vector,
        };
    }

    if bucket_ts(min_expiry) != bucket_ts(max_expiry) {
        let entries = vector.into_vec();
        let median = entries.len() / 2;
        let mut best: Option<(usize, usize)> = None; // (index, distance from median)
        for i in 1..entries.len() {
            if bucket_ts(entries[i - 1].expiry()) < bucket_ts(entries[i].expiry()) {
                let dist = (i as isize - median as isize).unsigned_abs();
                if best.map_or(true, |(_, best_dist)| dist < best_dist) {
                    best = Some((i, dist));
                }
            }
        }
        let (split_at, _) = best.expect("bucket_ts(min) != bucket_ts(max) implies a boundary exists");
        let low_key = bucket_ts(entries[split_at - 1].expiry());
        let mut entries = entries;
        let high = entries.split_off(split_at);
        return SplitOutcome::Split {
            low_key,
            low: EntryVec::from_vec_sorted(entries),
            high_key: bucket_key,
            high: EntryVec::from_vec_sorted(high),
        };
    }

    SplitOutcome::Hashtable(vector.into_vec())
}

fn install_split_outcome<E: Expiring>(outcome: SplitOutcome<E>, map: &mut BTreeMap<i64, TimeBucket<E>>, original_key: i64) {
    match outcome {
        SplitOutcome::Hashtable(vec) => {
            tracing::trace!(bucket = original_key, len = vec.len(), "bucket promoted to hashtable");
            map.insert(
                original_key,
                TimeBucket {
                    bucket_ts: original_key,
                    body: SimpleRepr::Hashtable(vec),
                },
            );
        }
        SplitOutcome::Relocate { new_key, vector } => {
            tracing::trace!(from = original_key, to = new_key, "bucket relocated to tighter key");
            map.insert(new_key, TimeBucket::from_vector(new_key, vector));
        }
        SplitOutcome::Split {
            low_key,
            low,
            high_key,
            high,
        } => {
            tracing::trace!(from = original_key, low_key, high_key, "bucket split at median boundary");
            map.insert(low_key, TimeBucket::from_vector(low_key, low));
            map.insert(high_key, TimeBucket::from_vector(high_key, high));
        }
    }
}

fn normalize_simple<E>(simple: SimpleRepr<E>) -> Repr<E> {
    match simple.len() {
        0 => Repr::None,
        1 => match simple {
            SimpleRepr::Single(_) => Repr::Simple(simple),
            SimpleRepr::Vector(mut v) => Repr::Simple(SimpleRepr::Single(v.pop().expect("len == 1"))),
            SimpleRepr::Hashtable(mut v) => Repr::Simple(SimpleRepr::Single(v.pop().expect("len == 1"))),
        },
        _ => Repr::Simple(simple),
    }
}

impl<E: Expiring> VSet<E> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn tag(&self) -> Tag {
        match &self.repr {
            Repr::None => Tag::None,
            Repr::Simple(simple) => simple.tag(),
            Repr::Rax(_) => Tag::Rax,
        }
    }

    /// Inserts `entry`. Never fails. Returns whether the top-level
    /// representation tag changed (a promotion occurred).
    pub fn add(&mut self, entry: E) -> bool {
        let repr = std::mem::replace(&mut self.repr, Repr::None);
        let (new_repr, changed) = match repr {
            Repr::None => (Repr::Simple(SimpleRepr::single(entry)), true),
            Repr::Simple(mut simple) => {
                let tag_before = simple.tag();
                match simple.add(entry) {
                    AddOutcome::Done => {
                        let changed = simple.tag() != tag_before;
                        (Repr::Simple(simple), changed)
                    }
                    AddOutcome::VectorFull(entry) => {
                        let SimpleRepr::Vector(mut vector) = simple else {
                            unreachable!("VectorFull only returned from a Vector")
                        };
                        vector.insert_sorted(entry);
                        let key = bucket_ts(vector.last().expect("128 entries present").expiry());
                        let mut map = BTreeMap::new();
                        install_split_outcome(split_full_vector(vector, key), &mut map, key);
                        if map.len() == 1 && matches!(map.values().next().unwrap().tag(), Tag::Hashtable) {
                            let (_, bucket) = map.into_iter().next().unwrap();
                            (Repr::Simple(bucket.body), true)
                        } else {
                            (Repr::Rax(map), true)
                        }
                    }
                }
            }
            Repr::Rax(mut map) => {
                rax_add(&mut map, entry);
                (Repr::Rax(map), false)
            }
        };
        self.repr = new_repr;
        self.len += 1;
        changed
    }

    /// Removes the first entry equal to `entry`. Idempotent: returns `false`
    /// if no matching entry was present.
    pub fn remove(&mut self, entry: &E) -> bool
    where
        E: PartialEq,
    {
        let mut repr = std::mem::replace(&mut self.repr, Repr::None);
        let removed = match &mut repr {
            Repr::None => false,
            Repr::Simple(simple) => {
                let (removed, now_empty) = simple.remove(entry);
                if removed && now_empty {
                    repr = Repr::None;
                }
                removed
            }
            Repr::Rax(map) => remove_from_rax(map, entry),
        };
        if removed {
            self.len -= 1;
        }
        self.repr = collapse_singleton_rax(repr);
        removed
    }

    /// Updates an entry's identity/expiry. The caller must pass the old
    /// expiry explicitly since `old` may already be a stale copy by the
    /// time this is called (its container may have moved it).
    ///
    /// Implemented as remove-then-add: the C original short-circuits when
    /// `old_expiry`/`new_expiry` land in the same bucket to swap in place,
    /// an allocator-level optimisation with no observable effect on content
    /// or final tag — safe Rust has no pointer identity to preserve here,
    /// so remove+add is behaviourally identical and avoids a second copy of
    /// the promotion algebra.
    pub fn update(&mut self, old: &E, new: E, old_expiry: i64, new_expiry: i64) -> bool
    where
        E: PartialEq,
    {
        let _ = (old_expiry, new_expiry);
        let removed = self.remove(old);
        self.add(new);
        removed
    }

    /// Removes up to `max` entries with `expiry < now`, visiting buckets in
    /// ascending `bucket_ts` order and, within a bucket, visiting a
    /// `Vector` in sorted order; `f` is invoked once per removed entry, in
    /// removal order.
    pub fn remove_expired(&mut self, now: i64, max: usize, mut f: impl FnMut(E)) -> usize {
        if max == 0 {
            return 0;
        }
        let mut repr = std::mem::replace(&mut self.repr, Repr::None);
        let mut removed = 0;
        match &mut repr {
            Repr::None => {}
            Repr::Simple(simple) => {
                removed += drain_simple_expired(simple, now, max, &mut f);
            }
            Repr::Rax(map) => {
                let keys: Vec<i64> = map.range(..=now).map(|(k, _)| *k).collect();
                for k in keys {
                    if removed >= max {
                        break;
                    }
                    let bucket = map.get_mut(&k).expect("key just read from this map");
                    let budget = max - removed;
                    removed += drain_simple_expired(&mut bucket.body, now, budget, &mut f);
                    if bucket.body.len() == 0 {
                        map.remove(&k);
                    }
                }
            }
        }
        self.len -= removed;
        repr = match repr {
            Repr::None => Repr::None,
            Repr::Simple(simple) => normalize_simple(simple),
            Repr::Rax(map) => Repr::Rax(map),
        };
        self.repr = collapse_singleton_rax(repr);
        removed
    }

    /// Upper bound on the smallest expiry currently in the set; exact for
    /// `Single`/`Vector`, an upper bound for `Rax` (the bucket key, not the
    /// true minimum inside it). `-1` when empty.
    #[must_use]
    pub fn estimated_earliest_expiry(&self) -> i64 {
        match &self.repr {
            Repr::None => -1,
            Repr::Simple(simple) => simple.min_expiry(),
            Repr::Rax(map) => map.keys().next().copied().unwrap_or(-1),
        }
    }

    /// Yields every entry exactly once, roughly ordered by expiry: `Rax`
    /// buckets in ascending `bucket_ts`, `Vector` in sorted order,
    /// `Hashtable` in unspecified order.
    pub fn iter(&self) -> Box<dyn Iterator<Item = &E> + '_> {
        match &self.repr {
            Repr::None => Box::new(std::iter::empty()),
            Repr::Simple(simple) => simple.iter(),
            Repr::Rax(map) => Box::new(map.values().flat_map(TimeBucket::iter)),
        }
    }

    #[must_use]
    pub fn mem_usage(&self) -> usize {
        match &self.repr {
            Repr::None => 0,
            Repr::Simple(simple) => simple.mem_usage(),
            Repr::Rax(map) => {
                map.values().map(TimeBucket::mem_usage).sum::<usize>()
                    + map.len() * std::mem::size_of::<(i64, usize)>()
            }
        }
    }

    /// Incremental defragmentation. `relocate` is offered every entry and
    /// may return a replacement (e.g. after a caller-side reallocation);
    /// returning `None` leaves the entry untouched. Internal vectors are
    /// shrunk to fit. Returns an opaque cursor; `0` means the pass
    /// completed. Each call processes one `Rax` bucket (in ascending key
    /// order starting after `cursor`) or the whole set if it isn't `Rax`.
    pub fn defrag(&mut self, cursor: i64, mut relocate: impl FnMut(&E) -> Option<E>) -> i64 {
        match &mut self.repr {
            Repr::None => 0,
            Repr::Simple(simple) => {
                defrag_simple(simple, &mut relocate);
                0
            }
            Repr::Rax(map) => {
                let next_key = map
                    .range((Bound::Excluded(cursor), Bound::Unbounded))
                    .next()
                    .map(|(k, _)| *k);
                let Some(k) = next_key else { return 0 };
                let bucket = map.get_mut(&k).expect("key just read from this map");
                defrag_simple(&mut bucket.body, &mut relocate);
                let has_more = map.range((Bound::Excluded(k), Bound::Unbounded)).next().is_some();
                if has_more {
                    k
                } else {
                    0
                }
            }
        }
    }
}

fn rax_add<E: Expiring>(map: &mut BTreeMap<i64, TimeBucket<E>>, entry: E) {
    let expiry = entry.expiry();
    let ceiling = max_bucket_ts(expiry);
    let found_key = map
        .range((Bound::Excluded(expiry), Bound::Unbounded))
        .next()
        .map(|(k, _)| *k)
        .filter(|k| *k <= ceiling);

    match found_key {
        Some(k) => {
            let mut bucket = map.remove(&k).expect("key from range query exists");
            match bucket.add(entry) {
                AddOutcome::Done => {
                    map.insert(k, bucket);
                }
                AddOutcome::VectorFull(entry) => {
                    let SimpleRepr::Vector(mut vector) =
                        std::mem::replace(&mut bucket.body, SimpleRepr::Hashtable(Vec::new()))
                    else {
                        unreachable!("VectorFull only returned from a Vector")
                    };
                    vector.insert_sorted(entry);
                    install_split_outcome(split_full_vector(vector, bucket.bucket_ts), map, bucket.bucket_ts);
                }
            }
        }
        None => {
            map.insert(ceiling, TimeBucket::new(ceiling, entry));
        }
    }
}

fn remove_from_rax<E: Expiring + PartialEq>(map: &mut BTreeMap<i64, TimeBucket<E>>, entry: &E) -> bool {
    let expiry = entry.expiry();
    let ceiling = max_bucket_ts(expiry);
    let found_key = map
        .range((Bound::Excluded(expiry), Bound::Unbounded))
        .next()
        .map(|(k, _)| *k)
        .filter(|k| *k <= ceiling);

    let Some(k) = found_key else { return false };
    let bucket = map.get_mut(&k).expect("key from range query exists");
    let (removed, now_empty) = bucket.remove(entry);
    if removed && now_empty {
        map.remove(&k);
    }
    removed
}

/// `RAX + removal that leaves exactly one SINGLE or non-full VECTOR bucket
/// -> collapse RAX into that bucket (sort vector on collapse)`.
fn collapse_singleton_rax<E>(repr: Repr<E>) -> Repr<E> {
    let Repr::Rax(mut map) = repr else { return repr };
    if map.len() != 1 {
        return Repr::Rax(map);
    }
    let only = map.values().next().expect("len == 1");
    let collapsible = matches!(only.tag(), Tag::Single) || (matches!(only.tag(), Tag::Vector) && only.len() < VECTOR_MAX);
    if !collapsible {
        return Repr::Rax(map);
    }
    let (_, bucket) = map.pop_first().expect("len == 1");
    Repr::Simple(bucket.body)
}

fn drain_simple_expired<E: Expiring>(simple: &mut SimpleRepr<E>, now: i64, budget: usize, f: &mut impl FnMut(E)) -> usize {
    match simple {
        SimpleRepr::Single(e) => {
            if e.expiry() < now {
                let SimpleRepr::Single(e) = std::mem::replace(simple, SimpleRepr::Hashtable(Vec::new())) else {
                    unreachable!()
                };
                f(e);
                1
            } else {
                0
            }
        }
        SimpleRepr::Vector(v) => {
            let mut count = 0;
            while count < budget {
                match v.first() {
                    Some(e) if e.expiry() < now => {
                        let e = v.remove_first().expect("just peeked Some");
                        f(e);
                        count += 1;
                    }
                    _ => break,
                }
            }
            count
        }
        SimpleRepr::Hashtable(v) => {
            let mut count = 0;
            let mut i = 0;
            while i < v.len() && count < budget {
                if v[i].expiry() < now {
                    let e = v.swap_remove(i);
                    f(e);
                    count += 1;
                } else {
                    i += 1;
                }
            }
            count
        }
    }
}

fn defrag_simple<E>(simple: &mut SimpleRepr<E>, relocate: &mut impl FnMut(&E) -> Option<E>) {
    match simple {
        SimpleRepr::Single(e) => {
            if let Some(new) = relocate(e) {
                *e = new;
            }
        }
        SimpleRepr::Vector(v) => {
            v.relocate_each(relocate);
            v.shrink_to_fit();
        }
        SimpleRepr::Hashtable(v) => {
            for e in v.iter_mut() {
                if let Some(new) = relocate(e) {
                    *e = new;
                }
            }
            v.shrink_to_fit();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, PartialEq, Debug)]
    struct E(i64);
    impl Expiring for E {
        fn expiry(&self) -> i64 {
            self.0
        }
    }

    fn collect_expiries(set: &VSet<E>) -> Vec<i64> {
        let mut v: Vec<i64> = set.iter().map(|e| e.0).collect();
        v.sort_unstable();
        v
    }

    #[test]
    fn empty_set_is_none() {
        let set: VSet<E> = VSet::new();
        assert_eq!(set.tag(), Tag::None);
        assert_eq!(set.estimated_earliest_expiry(), -1);
        assert!(set.is_empty());
    }

    #[test]
    fn single_then_vector_promotion() {
        let mut set = VSet::new();
        assert!(set.add(E(1000)));
        assert_eq!(set.tag(), Tag::Single);
        assert!(set.add(E(500)));
        assert_eq!(set.tag(), Tag::Vector);
        assert_eq!(set.estimated_earliest_expiry(), 500);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn promotion_chain_scenario() {
        // Matches the promotion-chain scenario: empty -> SINGLE -> VECTOR ->
        // VECTOR of 127 -> RAX with two buckets.
        let mut set = VSet::new();
        set.add(E(1000));
        assert_eq!(set.tag(), Tag::Single);
        set.add(E(500));
        assert_eq!(set.tag(), Tag::Vector);

        for expiry in 2000..2125 {
            set.add(E(expiry));
        }
        assert_eq!(set.tag(), Tag::Vector);
        assert_eq!(set.len(), 127);

        set.add(E(3000));
        assert_eq!(set.tag(), Tag::Rax);
        assert_eq!(set.len(), 128);
        assert!(set.estimated_earliest_expiry() <= 512);
    }

    #[test]
    fn add_remove_returns_to_prior_tag_and_length() {
        let mut set = VSet::new();
        set.add(E(10));
        set.add(E(20));
        set.add(E(30));
        let tag_before = set.tag();
        let len_before = set.len();
        set.add(E(40));
        set.remove(&E(40));
        assert_eq!(set.tag(), tag_before);
        assert_eq!(set.len(), len_before);
    }

    #[test]
    fn add_order_independence() {
        let mut a = VSet::new();
        a.add(E(1));
        a.add(E(2));

        let mut b = VSet::new();
        b.add(E(2));
        b.add(E(1));

        assert_eq!(collect_expiries(&a), collect_expiries(&b));
    }

    #[test]
    fn expired_removal_scenario() {
        let mut set = VSet::new();
        for e in [10, 20, 30, 40] {
            set.add(E(e));
        }
        let mut collected = Vec::new();
        let removed = set.remove_expired(25, 10, |e| collected.push(e.0));
        assert_eq!(removed, 2);
        assert_eq!(collected, vec![10, 20]);
        assert_eq!(collect_expiries(&set), vec![30, 40]);
    }

    #[test]
    fn remove_expired_respects_quota() {
        let mut set = VSet::new();
        for e in 0..10 {
            set.add(E(e));
        }
        let mut collected = Vec::new();
        let removed = set.remove_expired(100, 3, |e| collected.push(e.0));
        assert_eq!(removed, 3);
        assert_eq!(collected, vec![0, 1, 2]);
    }

    #[test]
    fn demotes_back_to_single_and_none() {
        let mut set = VSet::new();
        set.add(E(1));
        set.add(E(2));
        assert_eq!(set.tag(), Tag::Vector);
        set.remove(&E(1));
        assert_eq!(set.tag(), Tag::Single);
        set.remove(&E(2));
        assert_eq!(set.tag(), Tag::None);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut set = VSet::new();
        set.add(E(1));
        assert!(set.remove(&E(1)));
        assert!(!set.remove(&E(1)));
    }

    #[test]
    fn rax_collapses_to_single_bucket() {
        let mut set = VSet::new();
        for expiry in 0..127 {
            set.add(E(expiry));
        }
        set.add(E(100_000)); // forces RAX: far outside the first bucket's window
        assert_eq!(set.tag(), Tag::Rax);

        // Remove everything from the far bucket; only the near bucket
        // remains and should collapse back out of RAX.
        set.remove(&E(100_000));
        assert_eq!(set.tag(), Tag::Vector);
    }

    #[test]
    fn iterator_yields_every_entry_once() {
        let mut set = VSet::new();
        let mut expected: Vec<i64> = Vec::new();
        for expiry in 0..300 {
            set.add(E(expiry));
            expected.push(expiry);
        }
        expected.sort_unstable();
        assert_eq!(collect_expiries(&set), expected);
    }

    #[test]
    fn defrag_reaches_zero_cursor() {
        let mut set = VSet::new();
        for expiry in 0..300 {
            set.add(E(expiry));
        }
        let mut cursor = 0;
        let mut steps = 0;
        loop {
            cursor = set.defrag(cursor, |_| None);
            steps += 1;
            if cursor == 0 {
                break;
            }
            assert!(steps < 10_000, "defrag did not converge");
        }
        assert_eq!(collect_expiries(&set).len(), 300);
    }

    #[test]
    fn update_moves_entry() {
        let mut set = VSet::new();
        set.add(E(10));
        set.add(E(20));
        assert!(set.update(&E(10), E(15), 10, 15));
        assert_eq!(collect_expiries(&set), vec![15, 20]);
    }
}
