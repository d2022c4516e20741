//! Lock manager: one lock tree per dictionary plus the wait-for graph.

use super::range::{KeyComparator, KeyRange};
use super::tree::{LockTree, RangeLock};
use super::wfg::{DeadlockVictim, WaitEntry, WaitForGraph};
use crate::config::DeadlockDetection;
use crate::error::{CoreError, CoreResult};
use crate::stats::EngineStats;
use crate::types::{DictId, LockMode, TxnId};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Lock manager settings.
#[derive(Debug, Clone, Copy)]
pub struct LockSettings {
    /// How long a blocked request waits.
    pub timeout: Duration,
    /// Ranges per tree above which escalation runs.
    pub escalation_threshold: usize,
    /// Cycle detection policy.
    pub detection: DeadlockDetection,
    /// Whether unrelated readers share.
    pub shared_reads: bool,
}

/// A lock request.
#[derive(Debug, Clone)]
pub struct LockRequest<'a> {
    /// Requesting transaction followed by its ancestors, root last.
    pub lineage: &'a [TxnId],
    /// Dictionary to lock in.
    pub dict: DictId,
    /// Keys to lock.
    pub range: KeyRange,
    /// Lock mode.
    pub mode: LockMode,
    /// Fail instead of waiting.
    pub nowait: bool,
}

impl LockRequest<'_> {
    fn txn(&self) -> TxnId {
        self.lineage.first().copied().unwrap_or(TxnId(0))
    }

    fn root(&self) -> TxnId {
        self.lineage.last().copied().unwrap_or(TxnId(0))
    }
}

struct DictLocks {
    tree: Mutex<LockTree>,
    released: Condvar,
}

/// Grants, releases and escalates range locks.
pub struct LockManager {
    settings: LockSettings,
    dicts: RwLock<HashMap<DictId, Arc<DictLocks>>>,
    wfg: Mutex<WaitForGraph>,
    next_seq: AtomicU64,
    stats: Arc<EngineStats>,
}

impl LockManager {
    /// Creates a manager with no dictionaries.
    pub fn new(settings: LockSettings, stats: Arc<EngineStats>) -> Self {
        Self {
            settings,
            dicts: RwLock::new(HashMap::new()),
            wfg: Mutex::new(WaitForGraph::new()),
            next_seq: AtomicU64::new(1),
            stats,
        }
    }

    /// Creates the lock tree of a dictionary.
    pub fn register_dict(&self, dict: DictId, comparator: Arc<dyn KeyComparator>) {
        self.dicts.write().entry(dict).or_insert_with(|| {
            Arc::new(DictLocks {
                tree: Mutex::new(LockTree::new(comparator)),
                released: Condvar::new(),
            })
        });
    }

    /// Drops the lock tree of a removed dictionary.
    pub fn remove_dict(&self, dict: DictId) {
        self.dicts.write().remove(&dict);
    }

    fn dict(&self, dict: DictId) -> CoreResult<Arc<DictLocks>> {
        self.dicts
            .read()
            .get(&dict)
            .cloned()
            .ok_or_else(|| CoreError::DictionaryNotFound {
                name: dict.to_string(),
            })
    }

    /// Acquires a range lock, blocking as configured.
    ///
    /// # Errors
    ///
    /// - [`CoreError::LockNotGranted`] for a conflicting `nowait` request
    /// - [`CoreError::Deadlock`] if the requester is chosen as victim
    /// - [`CoreError::LockTimeout`] if the wait exceeds the timeout
    pub fn acquire(&self, req: &LockRequest<'_>) -> CoreResult<()> {
        let txn = req.txn();
        let root = req.root();
        let locks = self.dict(req.dict)?;
        let deadline = Instant::now() + self.settings.timeout;
        let mut seq = None;
        let mut tree = locks.tree.lock();
        if !req.range.is_valid(tree.comparator().as_ref()) {
            return Err(CoreError::invalid_argument(format!(
                "empty lock range {}",
                req.range
            )));
        }

        loop {
            if seq.is_some() && self.wfg.lock().take_rejection(txn) {
                self.wfg.lock().clear(txn);
                self.stats.record_deadlock();
                debug!(%txn, dict = %req.dict, "lock wait rejected as deadlock victim");
                return Err(CoreError::Deadlock { txn });
            }

            if tree.is_covered(&req.range, req.mode, req.lineage) {
                self.end_wait(txn, seq);
                return Ok(());
            }

            let blockers =
                tree.conflicting_owners(&req.range, req.mode, root, self.settings.shared_reads);
            if blockers.is_empty() {
                tree.grant(RangeLock {
                    range: req.range.clone(),
                    mode: req.mode,
                    owner: root,
                    holder: txn,
                });
                trace!(%txn, dict = %req.dict, range = %req.range, mode = %req.mode, "lock granted");
                if tree.len() > self.settings.escalation_threshold {
                    let merged = tree.escalate();
                    if merged > 0 {
                        self.stats.record_escalation();
                        debug!(dict = %req.dict, merged, remaining = tree.len(), "locks escalated");
                    }
                }
                self.end_wait(txn, seq);
                return Ok(());
            }

            if req.nowait {
                return Err(CoreError::LockNotGranted {
                    txn,
                    dict: req.dict,
                });
            }

            let request_seq = match seq {
                Some(s) => s,
                None => {
                    self.stats.record_lock_wait();
                    let s = self.next_seq.fetch_add(1, Ordering::Relaxed);
                    seq = Some(s);
                    s
                }
            };

            {
                let mut wfg = self.wfg.lock();
                wfg.set_waiting(WaitEntry {
                    txn,
                    root,
                    dict: req.dict,
                    blockers: blockers.clone(),
                    seq: request_seq,
                });
                if self.settings.detection == DeadlockDetection::OnAcquire
                    && wfg.closes_cycle(txn)
                {
                    wfg.clear(txn);
                    drop(wfg);
                    self.stats.record_deadlock();
                    debug!(%txn, dict = %req.dict, ?blockers, "deadlock: requester rejected");
                    return Err(CoreError::Deadlock { txn });
                }
            }

            debug!(%txn, dict = %req.dict, range = %req.range, ?blockers, "waiting for lock");
            if locks.released.wait_until(&mut tree, deadline).timed_out() {
                let rejected = {
                    let mut wfg = self.wfg.lock();
                    wfg.clear(txn);
                    wfg.take_rejection(txn)
                };
                if rejected {
                    self.stats.record_deadlock();
                    return Err(CoreError::Deadlock { txn });
                }
                // One last look; the release may have raced the timeout.
                if tree.is_covered(&req.range, req.mode, req.lineage)
                    || tree
                        .conflicting_owners(&req.range, req.mode, root, self.settings.shared_reads)
                        .is_empty()
                {
                    seq = None;
                    continue;
                }
                self.stats.record_lock_timeout();
                debug!(%txn, dict = %req.dict, "lock wait timed out");
                return Err(CoreError::LockTimeout {
                    txn,
                    dict: req.dict,
                });
            }
        }
    }

    fn end_wait(&self, txn: TxnId, seq: Option<u64>) {
        if seq.is_some() {
            self.wfg.lock().clear(txn);
        }
    }

    fn notify(&self, locks: &DictLocks) {
        locks.released.notify_all();
    }

    /// Releases every range owned by the family rooted at `root`.
    pub fn release_owner(&self, root: TxnId, dicts: &[DictId]) {
        for dict in dicts {
            if let Ok(locks) = self.dict(*dict) {
                let released = locks.tree.lock().release_owner(root);
                if released > 0 {
                    trace!(%root, %dict, released, "locks released");
                    self.notify(&locks);
                }
            }
        }
        self.wfg.lock().forget(root);
    }

    /// Releases the ranges granted to `holder` itself (child abort).
    pub fn release_holder(&self, holder: TxnId, dicts: &[DictId]) {
        for dict in dicts {
            if let Ok(locks) = self.dict(*dict) {
                let released = locks.tree.lock().release_holder(holder);
                if released > 0 {
                    self.notify(&locks);
                }
            }
        }
        self.wfg.lock().forget(holder);
    }

    /// Hands a committed child's ranges to its parent.
    pub fn transfer(&self, from: TxnId, to: TxnId, dicts: &[DictId]) {
        for dict in dicts {
            if let Ok(locks) = self.dict(*dict) {
                locks.tree.lock().transfer(from, to);
            }
        }
        self.wfg.lock().forget(from);
    }

    /// Escalates one dictionary's tree regardless of the threshold.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DictionaryNotFound`] for an unknown dictionary.
    pub fn escalate(&self, dict: DictId) -> CoreResult<usize> {
        let locks = self.dict(dict)?;
        let merged = locks.tree.lock().escalate();
        if merged > 0 {
            self.stats.record_escalation();
            debug!(%dict, merged, "locks escalated on request");
        }
        Ok(merged)
    }

    /// Finds wait cycles and rejects one waiter per cycle.
    ///
    /// Safe to call while other threads acquire and release.
    pub fn detect_deadlocks(&self) -> Vec<DeadlockVictim> {
        let victims = self.wfg.lock().reject_cycles();
        for victim in &victims {
            debug!(txn = %victim.txn, dict = %victim.dict, "deadlock victim chosen");
            if let Ok(locks) = self.dict(victim.dict) {
                // Taking the tree mutex guarantees the victim is parked.
                let _tree = locks.tree.lock();
                locks.released.notify_all();
            }
        }
        victims
    }

    /// Copies the granted ranges of a dictionary.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DictionaryNotFound`] for an unknown dictionary.
    pub fn ranges(&self, dict: DictId) -> CoreResult<Vec<RangeLock>> {
        Ok(self.dict(dict)?.tree.lock().ranges().to_vec())
    }

    /// Number of blocked requests.
    pub fn waiters(&self) -> usize {
        self.wfg.lock().len()
    }
}
