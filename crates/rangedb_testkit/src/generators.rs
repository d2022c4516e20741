//! Property-based test generators using proptest.
//!
//! Provides strategies for keys, values, isolation levels and scripted
//! transaction workloads.

use proptest::prelude::*;
use rangedb_core::{Db, IsolationLevel, KeyBound, KeyRange, LockMode, TxnId};
use std::collections::BTreeMap;

/// Strategy for short keys drawn from a small alphabet, so workloads
/// collide on the same keys often.
pub fn key_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(b'a'..=b'f', 1..4)
}

/// Strategy for values (arbitrary bytes).
pub fn value_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..64)
}

/// Strategy for isolation levels.
pub fn isolation_strategy() -> impl Strategy<Value = IsolationLevel> {
    prop_oneof![
        Just(IsolationLevel::Serializable),
        Just(IsolationLevel::SnapshotRepeatableRead),
        Just(IsolationLevel::ReadCommitted),
        Just(IsolationLevel::ReadUncommitted),
    ]
}

/// Strategy for lock modes.
pub fn lock_mode_strategy() -> impl Strategy<Value = LockMode> {
    prop_oneof![Just(LockMode::Read), Just(LockMode::Write)]
}

/// Strategy for non-empty key ranges over [`key_strategy`] keys.
pub fn key_range_strategy() -> impl Strategy<Value = KeyRange> {
    (key_strategy(), key_strategy()).prop_map(|(a, b)| {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        KeyRange::span(KeyBound::Key(low), KeyBound::Key(high))
    })
}

/// One step of a scripted transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Write a value.
    Put(Vec<u8>, Vec<u8>),
    /// Delete a key if present.
    Delete(Vec<u8>),
}

/// Strategy for one operation.
pub fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (key_strategy(), value_strategy()).prop_map(|(k, v)| Op::Put(k, v)),
        1 => key_strategy().prop_map(Op::Delete),
    ]
}

/// A scripted transaction: its operations and whether it commits.
#[derive(Debug, Clone)]
pub struct ScriptedTxn {
    /// Operations, in order.
    pub ops: Vec<Op>,
    /// Commit if true, abort otherwise.
    pub commit: bool,
}

/// Strategy for a sequence of scripted transactions.
pub fn workload_strategy(max_txns: usize) -> impl Strategy<Value = Vec<ScriptedTxn>> {
    prop::collection::vec(
        (prop::collection::vec(op_strategy(), 1..8), prop::bool::weighted(0.7))
            .prop_map(|(ops, commit)| ScriptedTxn { ops, commit }),
        1..max_txns.max(2),
    )
}

/// Applies `ops` to `db` inside `txn`. Deletes of missing keys are skipped.
///
/// # Errors
///
/// Any error other than a missing key.
pub fn apply_ops(db: &Db, txn: TxnId, ops: &[Op]) -> rangedb_core::CoreResult<()> {
    for op in ops {
        match op {
            Op::Put(key, value) => db.put(txn, key, value)?,
            Op::Delete(key) => match db.delete(txn, key) {
                Ok(()) | Err(rangedb_core::CoreError::KeyNotFound { .. }) => {}
                Err(err) => return Err(err),
            },
        }
    }
    Ok(())
}

/// The state a workload leaves behind: the effects of committed
/// transactions only.
pub fn expected_state(workload: &[ScriptedTxn]) -> BTreeMap<Vec<u8>, Vec<u8>> {
    let mut state = BTreeMap::new();
    for txn in workload.iter().filter(|txn| txn.commit) {
        for op in &txn.ops {
            match op {
                Op::Put(key, value) => {
                    state.insert(key.clone(), value.clone());
                }
                Op::Delete(key) => {
                    state.remove(key);
                }
            }
        }
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn generated_ranges_are_ordered(range in key_range_strategy()) {
            let cmp = rangedb_core::BytewiseComparator;
            prop_assert!(range.is_valid(&cmp));
        }

        #[test]
        fn aborted_transactions_leave_no_trace(workload in workload_strategy(6)) {
            let committed: Vec<ScriptedTxn> =
                workload.iter().filter(|t| t.commit).cloned().collect();
            prop_assert_eq!(expected_state(&workload), expected_state(&committed));
        }
    }
}
