//! Transaction records.

use crate::error::{CoreError, CoreResult};
use crate::rollback::RollbackLog;
use crate::types::{DictId, IsolationLevel, Lsn, TxnId, TxnState};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

const STATE_ACTIVE: u8 = 0;
const STATE_PREPARING: u8 = 1;
const STATE_COMMITTED: u8 = 2;
const STATE_ABORTED: u8 = 3;

fn encode_state(state: TxnState) -> u8 {
    match state {
        TxnState::Active => STATE_ACTIVE,
        TxnState::Preparing => STATE_PREPARING,
        TxnState::Committed => STATE_COMMITTED,
        TxnState::Aborted => STATE_ABORTED,
    }
}

fn decode_state(raw: u8) -> TxnState {
    match raw {
        STATE_ACTIVE => TxnState::Active,
        STATE_PREPARING => TxnState::Preparing,
        STATE_COMMITTED => TxnState::Committed,
        _ => TxnState::Aborted,
    }
}

/// Mutable parts of a transaction that only its own operations touch.
#[derive(Debug)]
pub(crate) struct TxnInner {
    /// Children that are still active.
    pub children: Vec<TxnId>,
    /// Committed descendants whose records live until this family ends.
    pub merged: Vec<TxnId>,
    /// Undo entries; taken out when commit or abort starts.
    pub rollback: Option<RollbackLog>,
    /// Dictionaries where this transaction was granted locks.
    pub lock_dicts: BTreeSet<DictId>,
    /// Dictionaries this transaction holds a whole-table write lock on.
    pub table_locks: BTreeSet<DictId>,
}

/// One transaction in the arena.
///
/// Fields read by visibility checks (state, commit LSN, merge target,
/// snapshot) are atomics so readers never take the record's mutex while
/// holding a chain latch.
#[derive(Debug)]
pub struct TxnRecord {
    /// Transaction id.
    pub id: TxnId,
    /// Parent, for nested transactions.
    pub parent: Option<TxnId>,
    /// This transaction followed by its ancestors; the root is last.
    pub lineage: Vec<TxnId>,
    /// Isolation level.
    pub isolation: IsolationLevel,
    /// LSN of the `Begin` record.
    pub begin_lsn: Lsn,
    state: AtomicU8,
    snapshot: AtomicU64,
    commit_lsn: AtomicU64,
    merged_into: AtomicU64,
    pub(crate) inner: Mutex<TxnInner>,
}

impl TxnRecord {
    pub(crate) fn new(
        id: TxnId,
        parent: Option<TxnId>,
        lineage: Vec<TxnId>,
        isolation: IsolationLevel,
        begin_lsn: Lsn,
        snapshot: Lsn,
        rollback: RollbackLog,
    ) -> Self {
        Self {
            id,
            parent,
            lineage,
            isolation,
            begin_lsn,
            state: AtomicU8::new(STATE_ACTIVE),
            snapshot: AtomicU64::new(snapshot.0),
            commit_lsn: AtomicU64::new(0),
            merged_into: AtomicU64::new(0),
            inner: Mutex::new(TxnInner {
                children: Vec::new(),
                merged: Vec::new(),
                rollback: Some(rollback),
                lock_dicts: BTreeSet::new(),
                table_locks: BTreeSet::new(),
            }),
        }
    }

    /// Root of the family.
    #[must_use]
    pub fn root(&self) -> TxnId {
        self.lineage.last().copied().unwrap_or(self.id)
    }

    /// Returns true for a top-level transaction.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TxnState {
        decode_state(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: TxnState) {
        self.state.store(encode_state(state), Ordering::Release);
    }

    /// Current read snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Lsn {
        Lsn(self.snapshot.load(Ordering::Acquire))
    }

    pub(crate) fn set_snapshot(&self, snapshot: Lsn) {
        self.snapshot.store(snapshot.0, Ordering::Release);
    }

    /// LSN of the root commit record, once written.
    #[must_use]
    pub fn commit_lsn(&self) -> Option<Lsn> {
        match self.commit_lsn.load(Ordering::Acquire) {
            0 => None,
            lsn => Some(Lsn(lsn)),
        }
    }

    pub(crate) fn set_commit_lsn(&self, lsn: Lsn) {
        self.commit_lsn.store(lsn.0, Ordering::Release);
    }

    /// The parent this committed child merged into.
    #[must_use]
    pub fn merged_into(&self) -> Option<TxnId> {
        match self.merged_into.load(Ordering::Acquire) {
            0 => None,
            id => Some(TxnId(id)),
        }
    }

    pub(crate) fn set_merged_into(&self, parent: TxnId) {
        self.merged_into.store(parent.0, Ordering::Release);
    }

    /// Fails unless the transaction accepts operations.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if the transaction is not
    /// active or has an active child.
    pub(crate) fn check_operable(&self, inner: &TxnInner) -> CoreResult<()> {
        let state = self.state();
        if state != TxnState::Active {
            return Err(CoreError::invalid_operation(format!(
                "{} is {state:?}",
                self.id
            )));
        }
        if !inner.children.is_empty() {
            return Err(CoreError::invalid_operation(format!(
                "{} has active child transactions",
                self.id
            )));
        }
        Ok(())
    }
}

/// Public description of a live transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxnInfo {
    /// Transaction id.
    pub id: TxnId,
    /// Parent, for nested transactions.
    pub parent: Option<TxnId>,
    /// Active children.
    pub children: Vec<TxnId>,
    /// Current state.
    pub state: TxnState,
    /// Isolation level.
    pub isolation: IsolationLevel,
    /// LSN of the `Begin` record.
    pub begin_lsn: Lsn,
    /// Current read snapshot.
    pub snapshot: Lsn,
    /// Entries in the rollback log.
    pub rollback_entries: u64,
}

/// Progress of a commit or abort walking its rollback log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnProgress {
    /// Entries handled so far.
    pub entries_processed: u64,
    /// Entries in the log.
    pub entries_total: u64,
    /// True for commit, false for abort.
    pub is_commit: bool,
    /// True while the commit waits for a checkpoint's latch.
    pub stalled_on_checkpoint: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rangedb_storage::MemoryProvider;
    use std::sync::Arc;

    fn record() -> TxnRecord {
        TxnRecord::new(
            TxnId(4),
            Some(TxnId(2)),
            vec![TxnId(4), TxnId(2)],
            IsolationLevel::Serializable,
            Lsn(10),
            Lsn(11),
            RollbackLog::new(TxnId(4), Arc::new(MemoryProvider::new()), 1024),
        )
    }

    #[test]
    fn atomics_roundtrip() {
        let rec = record();
        assert_eq!(rec.root(), TxnId(2));
        assert!(!rec.is_root());
        assert_eq!(rec.state(), TxnState::Active);
        assert_eq!(rec.commit_lsn(), None);
        assert_eq!(rec.merged_into(), None);

        rec.set_state(TxnState::Preparing);
        rec.set_commit_lsn(Lsn(40));
        rec.set_merged_into(TxnId(2));
        rec.set_snapshot(Lsn(41));
        assert_eq!(rec.state(), TxnState::Preparing);
        assert_eq!(rec.commit_lsn(), Some(Lsn(40)));
        assert_eq!(rec.merged_into(), Some(TxnId(2)));
        assert_eq!(rec.snapshot(), Lsn(41));
    }

    #[test]
    fn operable_only_when_active_and_childless() {
        let rec = record();
        {
            let mut inner = rec.inner.lock();
            assert!(rec.check_operable(&inner).is_ok());
            inner.children.push(TxnId(9));
            assert!(rec.check_operable(&inner).is_err());
            inner.children.clear();
        }
        rec.set_state(TxnState::Aborted);
        assert!(rec.check_operable(&rec.inner.lock()).is_err());
    }
}
