//! Engine statistics.
//!
//! Counters are atomic and can be read while operations are in progress.
//!
//! ```rust,ignore
//! let env = Environment::open_in_memory()?;
//! // ... run transactions ...
//! let stats = env.stats();
//! println!("commits: {}", stats.txns_committed);
//! println!("deadlocks: {}", stats.deadlocks);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Engine counters.
///
/// All values increase monotonically.
#[derive(Debug, Default)]
pub struct EngineStats {
    // Log
    log_records: AtomicU64,
    log_bytes: AtomicU64,
    log_syncs: AtomicU64,

    // Transactions
    txns_begun: AtomicU64,
    txns_committed: AtomicU64,
    txns_aborted: AtomicU64,
    rollback_spills: AtomicU64,

    // Locks
    lock_waits: AtomicU64,
    deadlocks: AtomicU64,
    lock_timeouts: AtomicU64,
    escalations: AtomicU64,

    // Maintenance
    checkpoints: AtomicU64,
    versions_collected: AtomicU64,
    log_files_archived: AtomicU64,
}

impl EngineStats {
    /// Creates a new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_log_append(&self, bytes: u64) {
        self.log_records.fetch_add(1, Ordering::Relaxed);
        self.log_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_log_sync(&self) {
        self.log_syncs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_begin(&self) {
        self.txns_begun.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self) {
        self.txns_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_abort(&self) {
        self.txns_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rollback_spill(&self) {
        self.rollback_spills.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_lock_wait(&self) {
        self.lock_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_deadlock(&self) {
        self.deadlocks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_lock_timeout(&self) {
        self.lock_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_escalation(&self) {
        self.escalations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_checkpoint(&self) {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_versions_collected(&self, count: u64) {
        self.versions_collected.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_log_files_archived(&self, count: u64) {
        self.log_files_archived.fetch_add(count, Ordering::Relaxed);
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            log_records: load(&self.log_records),
            log_bytes: load(&self.log_bytes),
            log_syncs: load(&self.log_syncs),
            txns_begun: load(&self.txns_begun),
            txns_committed: load(&self.txns_committed),
            txns_aborted: load(&self.txns_aborted),
            rollback_spills: load(&self.rollback_spills),
            lock_waits: load(&self.lock_waits),
            deadlocks: load(&self.deadlocks),
            lock_timeouts: load(&self.lock_timeouts),
            escalations: load(&self.escalations),
            checkpoints: load(&self.checkpoints),
            versions_collected: load(&self.versions_collected),
            log_files_archived: load(&self.log_files_archived),
        }
    }
}

/// A point-in-time copy of [`EngineStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Log records appended.
    pub log_records: u64,
    /// Bytes appended to the log, envelopes included.
    pub log_bytes: u64,
    /// Durable log flushes.
    pub log_syncs: u64,
    /// Transactions begun (nested ones included).
    pub txns_begun: u64,
    /// Transactions committed.
    pub txns_committed: u64,
    /// Transactions aborted.
    pub txns_aborted: u64,
    /// Rollback log blocks spilled to side files.
    pub rollback_spills: u64,
    /// Lock requests that had to wait.
    pub lock_waits: u64,
    /// Deadlock victims chosen.
    pub deadlocks: u64,
    /// Lock waits that timed out.
    pub lock_timeouts: u64,
    /// Lock escalation passes that merged ranges.
    pub escalations: u64,
    /// Completed checkpoints.
    pub checkpoints: u64,
    /// Versions removed by garbage collection.
    pub versions_collected: u64,
    /// Log files removed by archival.
    pub log_files_archived: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stats_are_zero() {
        let stats = EngineStats::new();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn record_and_snapshot() {
        let stats = EngineStats::new();
        stats.record_log_append(40);
        stats.record_log_append(60);
        stats.record_begin();
        stats.record_commit();
        stats.record_deadlock();
        stats.record_versions_collected(3);

        let snap = stats.snapshot();
        assert_eq!(snap.log_records, 2);
        assert_eq!(snap.log_bytes, 100);
        assert_eq!(snap.txns_begun, 1);
        assert_eq!(snap.txns_committed, 1);
        assert_eq!(snap.deadlocks, 1);
        assert_eq!(snap.versions_collected, 3);
    }

    #[test]
    fn concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let stats = Arc::new(EngineStats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..100 {
                        s.record_lock_wait();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(stats.snapshot().lock_waits, 800);
    }
}
