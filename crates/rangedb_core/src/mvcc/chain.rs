//! Per-key version chains and snapshot visibility.

use crate::types::{IsolationLevel, Lsn, TxnId};
use serde::{Deserialize, Serialize};

/// Commit status of a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VersionState {
    /// Written by a transaction that has not committed yet.
    Provisional,
    /// Written by a transaction whose root committed at `commit_lsn`.
    Committed {
        /// LSN of the root's `Commit` record.
        commit_lsn: Lsn,
    },
}

/// One version of a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    /// The value, or `None` for a tombstone.
    pub value: Option<Vec<u8>>,
    /// Transaction that wrote the version.
    pub writer: TxnId,
    /// LSN of the log record that wrote it; unique per version.
    pub lsn: Lsn,
    /// Commit status.
    pub state: VersionState,
}

impl Version {
    /// Returns the commit LSN of a committed version.
    #[must_use]
    pub fn commit_lsn(&self) -> Option<Lsn> {
        match self.state {
            VersionState::Committed { commit_lsn } => Some(commit_lsn),
            VersionState::Provisional => None,
        }
    }

    /// Returns true for a tombstone.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// What the transaction table knows about a writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterStatus {
    /// Still running; `owner` is the transaction whose rollback log now
    /// holds the write (a committed child resolves to its parent).
    Active {
        /// Effective owner.
        owner: TxnId,
    },
    /// Root committed at `commit_lsn`; the flip to committed is pending.
    Committed {
        /// LSN of the commit record.
        commit_lsn: Lsn,
    },
    /// Aborted; the version is about to be removed.
    Aborted,
}

/// Resolves writers of provisional versions.
pub trait WriterResolver {
    /// Returns the status of `writer`.
    fn status(&self, writer: TxnId) -> WriterStatus;
}

/// The reader side of a visibility check.
#[derive(Debug, Clone, Copy)]
pub struct ReadView<'a> {
    /// Reader isolation level.
    pub isolation: IsolationLevel,
    /// Versions committed at LSNs below this are visible.
    pub snapshot: Lsn,
    /// Reader followed by its ancestors.
    pub family: &'a [TxnId],
}

/// Versions of one key, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionChain {
    // Stored oldest first so writes are pushes.
    versions: Vec<Version>,
}

impl VersionChain {
    /// Creates an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a chain from versions given newest first.
    #[must_use]
    pub fn from_newest_first(mut versions: Vec<Version>) -> Self {
        versions.reverse();
        Self { versions }
    }

    /// Returns the versions, newest first.
    pub fn iter(&self) -> impl Iterator<Item = &Version> {
        self.versions.iter().rev()
    }

    /// Number of versions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    /// Returns true if no versions remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Returns the newest version.
    #[must_use]
    pub fn newest(&self) -> Option<&Version> {
        self.versions.last()
    }

    /// Prepends a new version.
    pub fn push(&mut self, version: Version) {
        self.versions.push(version);
    }

    /// Inserts a version at its LSN position; an existing version with the
    /// same LSN is replaced. Used by recovery, where it makes redo
    /// idempotent.
    pub fn install(&mut self, version: Version) {
        match self.versions.binary_search_by_key(&version.lsn, |v| v.lsn) {
            Ok(at) => self.versions[at] = version,
            Err(at) => self.versions.insert(at, version),
        }
    }

    /// Removes the version written at `lsn`.
    pub fn remove_lsn(&mut self, lsn: Lsn) -> Option<Version> {
        let at = self.versions.iter().rposition(|v| v.lsn == lsn)?;
        Some(self.versions.remove(at))
    }

    /// Marks the version written at `lsn` committed.
    pub fn commit_lsn(&mut self, lsn: Lsn, commit_lsn: Lsn) -> bool {
        match self.versions.iter_mut().rev().find(|v| v.lsn == lsn) {
            Some(version) => {
                version.state = VersionState::Committed { commit_lsn };
                true
            }
            None => false,
        }
    }

    /// Returns the version `view` sees, tombstones included.
    pub fn visible(&self, view: &ReadView<'_>, resolver: &dyn WriterResolver) -> Option<&Version> {
        self.iter().find(|version| is_visible(version, view, resolver))
    }

    /// Drops versions no snapshot at or after `oldest_snapshot` can see.
    ///
    /// The newest committed version below the boundary is kept along with
    /// everything newer; older committed versions go. Provisional versions
    /// are never touched. A chain left holding only an old committed
    /// tombstone is emptied. Returns the removed versions.
    pub fn collect_garbage(&mut self, oldest_snapshot: Lsn) -> Vec<Version> {
        let boundary = self.versions.iter().rposition(|v| {
            v.commit_lsn()
                .is_some_and(|commit_lsn| commit_lsn < oldest_snapshot)
        });
        let Some(boundary) = boundary else {
            return Vec::new();
        };

        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.versions.len() - boundary);
        for (i, version) in std::mem::take(&mut self.versions).into_iter().enumerate() {
            if i < boundary && version.commit_lsn().is_some() {
                removed.push(version);
            } else {
                kept.push(version);
            }
        }
        self.versions = kept;

        if self.versions.len() == 1 && self.versions[0].is_tombstone() {
            removed.extend(self.versions.drain(..));
        }
        removed
    }
}

fn is_visible(version: &Version, view: &ReadView<'_>, resolver: &dyn WriterResolver) -> bool {
    if let VersionState::Committed { commit_lsn } = version.state {
        return view.isolation == IsolationLevel::ReadUncommitted || commit_lsn < view.snapshot;
    }
    match resolver.status(version.writer) {
        WriterStatus::Aborted => false,
        _ if view.isolation == IsolationLevel::ReadUncommitted => true,
        WriterStatus::Active { owner } => view.family.contains(&owner),
        WriterStatus::Committed { commit_lsn } => commit_lsn < view.snapshot,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Table(HashMap<TxnId, WriterStatus>);

    impl WriterResolver for Table {
        fn status(&self, writer: TxnId) -> WriterStatus {
            self.0
                .get(&writer)
                .copied()
                .unwrap_or(WriterStatus::Active { owner: writer })
        }
    }

    fn committed(value: &str, lsn: u64, commit: u64) -> Version {
        Version {
            value: Some(value.as_bytes().to_vec()),
            writer: TxnId(lsn),
            lsn: Lsn(lsn),
            state: VersionState::Committed {
                commit_lsn: Lsn(commit),
            },
        }
    }

    fn provisional(value: &str, writer: u64, lsn: u64) -> Version {
        Version {
            value: Some(value.as_bytes().to_vec()),
            writer: TxnId(writer),
            lsn: Lsn(lsn),
            state: VersionState::Provisional,
        }
    }

    fn view(isolation: IsolationLevel, snapshot: u64, family: &[TxnId]) -> ReadView<'_> {
        ReadView {
            isolation,
            snapshot: Lsn(snapshot),
            family,
        }
    }

    fn seen(chain: &VersionChain, view: &ReadView<'_>, table: &Table) -> Option<String> {
        chain
            .visible(view, table)
            .and_then(|v| v.value.clone())
            .map(|v| String::from_utf8(v).unwrap())
    }

    #[test]
    fn snapshot_sees_commits_before_it() {
        let mut chain = VersionChain::new();
        chain.push(committed("v1", 1, 2));
        chain.push(committed("v2", 5, 6));
        let table = Table::default();

        assert_eq!(seen(&chain, &view(IsolationLevel::SnapshotRepeatableRead, 3, &[]), &table), Some("v1".into()));
        assert_eq!(seen(&chain, &view(IsolationLevel::SnapshotRepeatableRead, 7, &[]), &table), Some("v2".into()));
        assert_eq!(seen(&chain, &view(IsolationLevel::Serializable, 2, &[]), &table), None);
    }

    #[test]
    fn provisional_visible_to_family_and_dirty_readers() {
        let mut chain = VersionChain::new();
        chain.push(committed("base", 1, 2));
        chain.push(provisional("mine", 9, 10));
        let table = Table::default();

        let me = [TxnId(9)];
        let child = [TxnId(12), TxnId(9)];
        let other = [TxnId(3)];
        assert_eq!(seen(&chain, &view(IsolationLevel::Serializable, 5, &me), &table), Some("mine".into()));
        assert_eq!(seen(&chain, &view(IsolationLevel::Serializable, 5, &child), &table), Some("mine".into()));
        assert_eq!(seen(&chain, &view(IsolationLevel::ReadCommitted, 50, &other), &table), Some("base".into()));
        assert_eq!(seen(&chain, &view(IsolationLevel::ReadUncommitted, 0, &other), &table), Some("mine".into()));
    }

    #[test]
    fn resolver_decides_pending_versions() {
        let mut chain = VersionChain::new();
        chain.push(committed("base", 1, 2));
        chain.push(provisional("merged", 20, 21));
        chain.push(provisional("gone", 30, 31));
        let mut table = Table::default();
        table.0.insert(TxnId(20), WriterStatus::Committed { commit_lsn: Lsn(25) });
        table.0.insert(TxnId(30), WriterStatus::Aborted);

        assert_eq!(seen(&chain, &view(IsolationLevel::ReadCommitted, 26, &[]), &table), Some("merged".into()));
        assert_eq!(seen(&chain, &view(IsolationLevel::ReadCommitted, 25, &[]), &table), Some("base".into()));
        assert_eq!(seen(&chain, &view(IsolationLevel::ReadUncommitted, 0, &[]), &table), Some("merged".into()));
    }

    #[test]
    fn commit_and_remove_by_lsn() {
        let mut chain = VersionChain::new();
        chain.push(provisional("a", 1, 4));
        chain.push(provisional("b", 1, 6));
        assert!(chain.commit_lsn(Lsn(4), Lsn(8)));
        assert!(!chain.commit_lsn(Lsn(5), Lsn(8)));
        assert_eq!(chain.remove_lsn(Lsn(6)).unwrap().lsn, Lsn(6));
        assert_eq!(chain.newest().unwrap().commit_lsn(), Some(Lsn(8)));
    }

    #[test]
    fn install_is_idempotent_and_ordered() {
        let mut chain = VersionChain::new();
        chain.install(committed("late", 9, 10));
        chain.install(committed("early", 3, 4));
        chain.install(committed("late", 9, 10));
        let lsns: Vec<_> = chain.iter().map(|v| v.lsn.0).collect();
        assert_eq!(lsns, vec![9, 3]);
    }

    #[test]
    fn garbage_collection_keeps_what_snapshots_need() {
        let mut chain = VersionChain::new();
        chain.push(committed("v1", 1, 2));
        chain.push(committed("v2", 3, 4));
        chain.push(committed("v3", 5, 6));
        chain.push(provisional("p", 7, 8));

        let removed = chain.collect_garbage(Lsn(5));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].lsn, Lsn(1));
        let lsns: Vec<_> = chain.iter().map(|v| v.lsn.0).collect();
        assert_eq!(lsns, vec![7, 5, 3]);

        assert!(chain.collect_garbage(Lsn(1)).is_empty());
    }

    #[test]
    fn old_tombstone_chain_disappears() {
        let mut chain = VersionChain::new();
        chain.push(committed("v1", 1, 2));
        chain.push(Version {
            value: None,
            writer: TxnId(3),
            lsn: Lsn(3),
            state: VersionState::Committed { commit_lsn: Lsn(4) },
        });
        let removed = chain.collect_garbage(Lsn(10));
        assert_eq!(removed.len(), 2);
        assert!(chain.is_empty());
    }
}
