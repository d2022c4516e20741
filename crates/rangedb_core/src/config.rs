//! Environment configuration.

use crate::locktree::{BytewiseComparator, KeyComparator};
use std::sync::Arc;
use std::time::Duration;

/// How lock-wait cycles are found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlockDetection {
    /// Every blocking acquire checks the wait-for graph before sleeping;
    /// the requester that would close a cycle is rejected.
    OnAcquire,
    /// Waiters only sleep; cycles are broken by calls to
    /// `Environment::detect_deadlocks`.
    Polling,
}

/// Configuration for opening an environment.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// Whether to create the environment directory if it doesn't exist.
    pub create_if_missing: bool,

    /// How long a blocked lock request waits before failing.
    pub lock_timeout: Duration,

    /// Number of ranges in one dictionary's lock tree above which ranges
    /// are escalated.
    pub lock_escalation_threshold: usize,

    /// Deadlock detection policy.
    pub deadlock_detection: DeadlockDetection,

    /// Whether read locks held by unrelated transactions are compatible.
    ///
    /// When false, a read lock blocks other readers as well as writers.
    pub shared_read_locks: bool,

    /// Size of a log file before a new one is started.
    pub log_file_size: u64,

    /// Whether commit waits for the log to be durable.
    pub sync_on_commit: bool,

    /// Bytes of in-memory rollback entries per transaction before they are
    /// spilled to a side file.
    pub rollback_spill_threshold: usize,

    /// How often the background checkpointer runs (zero = never).
    pub checkpoint_interval: Duration,

    /// How many times a failing checkpoint flush is retried before the
    /// environment is declared panicked.
    pub checkpoint_flush_retries: u32,

    /// Number of rollback entries processed between progress reports.
    pub progress_interval: u64,

    /// Bytes of rows a bulk loader buffers before spilling to a temp file.
    pub loader_memory_limit: usize,

    /// Custom key comparators, looked up by [`KeyComparator::name`] when a
    /// dictionary is opened or recovered.
    pub comparators: Vec<Arc<dyn KeyComparator>>,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            lock_timeout: Duration::from_secs(4),
            lock_escalation_threshold: 10_000,
            deadlock_detection: DeadlockDetection::OnAcquire,
            shared_read_locks: true,
            log_file_size: 100 * 1024 * 1024, // 100 MB
            sync_on_commit: true,
            rollback_spill_threshold: 4 * 1024 * 1024, // 4 MB
            checkpoint_interval: Duration::ZERO,       // disabled
            checkpoint_flush_retries: 3,
            progress_interval: 1024,
            loader_memory_limit: 16 * 1024 * 1024,
            comparators: Vec::new(),
        }
    }
}

impl EnvConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the environment if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the lock wait timeout.
    #[must_use]
    pub const fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets the lock escalation threshold.
    #[must_use]
    pub const fn lock_escalation_threshold(mut self, ranges: usize) -> Self {
        self.lock_escalation_threshold = ranges;
        self
    }

    /// Sets the deadlock detection policy.
    #[must_use]
    pub const fn deadlock_detection(mut self, policy: DeadlockDetection) -> Self {
        self.deadlock_detection = policy;
        self
    }

    /// Sets whether read locks are shared between unrelated transactions.
    #[must_use]
    pub const fn shared_read_locks(mut self, value: bool) -> Self {
        self.shared_read_locks = value;
        self
    }

    /// Sets the log file size at which a new file is started.
    #[must_use]
    pub const fn log_file_size(mut self, size: u64) -> Self {
        self.log_file_size = size;
        self
    }

    /// Sets whether commit waits for the log to be durable.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets the rollback spill threshold in bytes.
    #[must_use]
    pub const fn rollback_spill_threshold(mut self, bytes: usize) -> Self {
        self.rollback_spill_threshold = bytes;
        self
    }

    /// Sets the background checkpoint interval.
    #[must_use]
    pub const fn checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// Sets the number of checkpoint flush retries.
    #[must_use]
    pub const fn checkpoint_flush_retries(mut self, retries: u32) -> Self {
        self.checkpoint_flush_retries = retries;
        self
    }

    /// Sets how many rollback entries pass between progress reports.
    #[must_use]
    pub const fn progress_interval(mut self, entries: u64) -> Self {
        self.progress_interval = entries;
        self
    }

    /// Sets the bulk loader memory limit in bytes.
    #[must_use]
    pub const fn loader_memory_limit(mut self, bytes: usize) -> Self {
        self.loader_memory_limit = bytes;
        self
    }

    /// Registers a custom key comparator.
    #[must_use]
    pub fn with_comparator(mut self, comparator: Arc<dyn KeyComparator>) -> Self {
        self.comparators.push(comparator);
        self
    }

    /// Finds a comparator by name; `"bytewise"` is always available.
    #[must_use]
    pub fn comparator(&self, name: &str) -> Option<Arc<dyn KeyComparator>> {
        if let Some(found) = self.comparators.iter().find(|c| c.name() == name) {
            return Some(Arc::clone(found));
        }
        (name == BytewiseComparator.name())
            .then(|| Arc::new(BytewiseComparator) as Arc<dyn KeyComparator>)
    }
}
