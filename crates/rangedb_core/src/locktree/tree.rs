//! The granted ranges of one dictionary.

use super::range::{KeyComparator, KeyRange};
use crate::types::{LockMode, TxnId};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;

/// A granted range lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeLock {
    /// Locked keys.
    pub range: KeyRange,
    /// Lock mode.
    pub mode: LockMode,
    /// Root of the owning transaction family.
    pub owner: TxnId,
    /// Transaction the lock was granted to (the owner or a descendant).
    pub holder: TxnId,
}

/// Sorted set of granted ranges for one dictionary.
///
/// Not synchronized; the lock manager guards each tree with its own mutex.
#[derive(Debug)]
pub struct LockTree {
    comparator: Arc<dyn KeyComparator>,
    ranges: Vec<RangeLock>,
}

impl LockTree {
    /// Creates an empty tree ordered by `comparator`.
    pub fn new(comparator: Arc<dyn KeyComparator>) -> Self {
        Self {
            comparator,
            ranges: Vec::new(),
        }
    }

    /// Returns the dictionary's comparator.
    pub fn comparator(&self) -> &Arc<dyn KeyComparator> {
        &self.comparator
    }

    /// Number of granted ranges.
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    /// Returns true if nothing is locked.
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Granted ranges ordered by lower bound.
    pub fn ranges(&self) -> &[RangeLock] {
        &self.ranges
    }

    /// Whether a held lock in mode `held` lets another family take `requested`.
    pub fn compatible(held: LockMode, requested: LockMode, shared_reads: bool) -> bool {
        shared_reads && held == LockMode::Read && requested == LockMode::Read
    }

    /// Roots of the other families holding overlapping incompatible ranges.
    pub fn conflicting_owners(
        &self,
        range: &KeyRange,
        mode: LockMode,
        owner: TxnId,
        shared_reads: bool,
    ) -> Vec<TxnId> {
        let cmp = self.comparator.as_ref();
        let blockers: BTreeSet<TxnId> = self
            .ranges
            .iter()
            .take_while(|lock| lock.range.low.compare(&range.high, cmp) != Ordering::Greater)
            .filter(|lock| lock.owner != owner)
            .filter(|lock| !Self::compatible(lock.mode, mode, shared_reads))
            .filter(|lock| lock.range.overlaps(range, cmp))
            .map(|lock| lock.owner)
            .collect();
        blockers.into_iter().collect()
    }

    /// Returns true if `lineage` (the requester followed by its ancestors)
    /// already holds a lock containing `range` in at least `mode`.
    pub fn is_covered(&self, range: &KeyRange, mode: LockMode, lineage: &[TxnId]) -> bool {
        let cmp = self.comparator.as_ref();
        self.ranges.iter().any(|lock| {
            lock.mode >= mode
                && lineage.contains(&lock.holder)
                && lock.range.contains(range, cmp)
        })
    }

    /// Inserts a granted range, keeping lower-bound order.
    pub fn grant(&mut self, lock: RangeLock) {
        let cmp = self.comparator.as_ref();
        let at = self
            .ranges
            .partition_point(|held| held.range.low.compare(&lock.range.low, cmp) != Ordering::Greater);
        self.ranges.insert(at, lock);
    }

    /// Removes every range granted to `holder`.
    pub fn release_holder(&mut self, holder: TxnId) -> usize {
        let before = self.ranges.len();
        self.ranges.retain(|lock| lock.holder != holder);
        before - self.ranges.len()
    }

    /// Removes every range owned by the family rooted at `owner`.
    pub fn release_owner(&mut self, owner: TxnId) -> usize {
        let before = self.ranges.len();
        self.ranges.retain(|lock| lock.owner != owner);
        before - self.ranges.len()
    }

    /// Hands every range held by `from` to `to` (child commit).
    pub fn transfer(&mut self, from: TxnId, to: TxnId) -> usize {
        let mut moved = 0;
        for lock in self.ranges.iter_mut().filter(|lock| lock.holder == from) {
            lock.holder = to;
            moved += 1;
        }
        moved
    }

    /// Merges neighbouring ranges of the same holder and mode.
    ///
    /// Two ranges are merged only if no range of another family overlaps
    /// the merged span, so no granted lock starts to conflict. Ranges of
    /// different holders are never merged, so a child abort still releases
    /// exactly its own ranges. Returns the number of ranges removed.
    pub fn escalate(&mut self) -> usize {
        let cmp = Arc::clone(&self.comparator);
        let cmp = cmp.as_ref();
        let before = self.ranges.len();

        let groups: BTreeSet<(TxnId, TxnId, LockMode)> = self
            .ranges
            .iter()
            .map(|lock| (lock.owner, lock.holder, lock.mode))
            .collect();

        for (owner, holder, mode) in groups {
            let (mine, rest): (Vec<RangeLock>, Vec<RangeLock>) = std::mem::take(&mut self.ranges)
                .into_iter()
                .partition(|lock| lock.holder == holder && lock.mode == mode);

            let mut merged: Vec<RangeLock> = Vec::with_capacity(mine.len());
            for lock in mine {
                if let Some(last) = merged.last_mut() {
                    let span = last.range.union(&lock.range, cmp);
                    let blocked = rest
                        .iter()
                        .any(|other| other.owner != owner && other.range.overlaps(&span, cmp));
                    if !blocked {
                        last.range = span;
                        continue;
                    }
                }
                merged.push(lock);
            }

            self.ranges = rest;
            for lock in merged {
                self.grant(lock);
            }
        }

        before - self.ranges.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locktree::range::{BytewiseComparator, KeyBound};

    fn tree() -> LockTree {
        LockTree::new(Arc::new(BytewiseComparator))
    }

    fn lock(low: &str, high: &str, mode: LockMode, owner: u64) -> RangeLock {
        RangeLock {
            range: KeyRange::span(
                KeyBound::Key(low.as_bytes().to_vec()),
                KeyBound::Key(high.as_bytes().to_vec()),
            ),
            mode,
            owner: TxnId(owner),
            holder: TxnId(owner),
        }
    }

    #[test]
    fn write_conflicts_with_other_families_only() {
        let mut t = tree();
        t.grant(lock("b", "d", LockMode::Write, 1));

        let point = KeyRange::point(b"c");
        assert_eq!(
            t.conflicting_owners(&point, LockMode::Read, TxnId(2), true),
            vec![TxnId(1)]
        );
        assert!(t
            .conflicting_owners(&point, LockMode::Write, TxnId(1), true)
            .is_empty());
        assert!(t
            .conflicting_owners(&KeyRange::point(b"e"), LockMode::Write, TxnId(2), true)
            .is_empty());
    }

    #[test]
    fn shared_reads_policy() {
        let mut t = tree();
        t.grant(lock("a", "z", LockMode::Read, 1));
        let point = KeyRange::point(b"m");
        assert!(t
            .conflicting_owners(&point, LockMode::Read, TxnId(2), true)
            .is_empty());
        assert_eq!(
            t.conflicting_owners(&point, LockMode::Read, TxnId(2), false),
            vec![TxnId(1)]
        );
    }

    #[test]
    fn coverage_follows_lineage() {
        let mut t = tree();
        t.grant(lock("a", "f", LockMode::Write, 1));
        let point = KeyRange::point(b"c");
        assert!(t.is_covered(&point, LockMode::Read, &[TxnId(5), TxnId(1)]));
        assert!(t.is_covered(&point, LockMode::Write, &[TxnId(1)]));
        assert!(!t.is_covered(&point, LockMode::Write, &[TxnId(2)]));
    }

    #[test]
    fn release_and_transfer() {
        let mut t = tree();
        let mut child = lock("a", "b", LockMode::Write, 1);
        child.holder = TxnId(2);
        t.grant(child);
        t.grant(lock("c", "d", LockMode::Write, 1));

        assert_eq!(t.transfer(TxnId(2), TxnId(1)), 1);
        assert_eq!(t.release_holder(TxnId(2)), 0);
        assert_eq!(t.release_owner(TxnId(1)), 2);
        assert!(t.is_empty());
    }

    #[test]
    fn escalation_never_swallows_other_families() {
        let mut t = tree();
        t.grant(lock("a", "a", LockMode::Write, 1));
        t.grant(lock("b", "b", LockMode::Write, 1));
        t.grant(lock("d", "d", LockMode::Write, 2));
        t.grant(lock("e", "e", LockMode::Write, 1));
        t.grant(lock("f", "f", LockMode::Write, 1));

        assert_eq!(t.escalate(), 2);
        let mine: Vec<_> = t
            .ranges()
            .iter()
            .filter(|l| l.owner == TxnId(1))
            .map(|l| l.range.to_string())
            .collect();
        assert_eq!(mine, vec!["[61, 62]", "[65, 66]"]);
        assert!(t
            .conflicting_owners(&KeyRange::point(b"d"), LockMode::Write, TxnId(2), true)
            .is_empty());
    }

    #[test]
    fn escalation_keeps_child_ranges_apart() {
        let mut t = tree();
        t.grant(lock("a", "a", LockMode::Write, 1));
        t.grant(lock("b", "b", LockMode::Write, 1));
        let mut child = lock("c", "c", LockMode::Write, 1);
        child.holder = TxnId(4);
        t.grant(child);

        assert_eq!(t.escalate(), 1);
        assert_eq!(t.release_holder(TxnId(4)), 1);
        assert!(t
            .conflicting_owners(&KeyRange::point(b"c"), LockMode::Write, TxnId(2), true)
            .is_empty());
        assert_eq!(t.len(), 1);
    }
}
