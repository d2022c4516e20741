//! Transaction manager.
//!
//! Transactions live in an arena keyed by id; ancestry is walked by id
//! lookup and ids are never reused. Records stay in the arena until their
//! family has finished, so a provisional version can always be resolved to
//! its writer's fate.
//!
//! Snapshots and root commits are ordered by the snapshot latch: taking a
//! snapshot holds it shared, while a root commit holds it exclusively just
//! long enough to append its `Commit` record and publish the commit LSN.
//! Every snapshot therefore either includes a commit entirely or not at
//! all, even though the versions themselves are flipped later.

use super::state::{TxnInfo, TxnInner, TxnProgress, TxnRecord};
use crate::error::{CoreError, CoreResult};
use crate::locktree::{KeyRange, LockManager, LockRequest};
use crate::log::{LogRecord, LogWriter, OpenTxn};
use crate::mvcc::{MvccStore, WriterResolver, WriterStatus};
use crate::rollback::{RollbackEntry, RollbackLog};
use crate::stats::EngineStats;
use crate::types::{DictId, IsolationLevel, LockMode, Lsn, TxnId, TxnState};
use parking_lot::RwLock;
use rangedb_storage::BackendProvider;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Callback receiving commit/abort progress.
pub type ProgressFn<'a> = &'a mut dyn FnMut(&TxnProgress);

/// Transaction manager settings.
#[derive(Debug, Clone, Copy)]
pub struct TxnSettings {
    /// Rollback bytes kept in memory per transaction.
    pub rollback_spill_threshold: usize,
    /// Entries between progress reports.
    pub progress_interval: u64,
    /// Whether root commit waits for durability.
    pub sync_on_commit: bool,
}

struct ProgressReporter<'a> {
    progress: TxnProgress,
    interval: u64,
    reported: Option<u64>,
    callback: Option<ProgressFn<'a>>,
}

impl<'a> ProgressReporter<'a> {
    fn new(total: u64, is_commit: bool, interval: u64, callback: Option<ProgressFn<'a>>) -> Self {
        Self {
            progress: TxnProgress {
                entries_processed: 0,
                entries_total: total,
                is_commit,
                stalled_on_checkpoint: false,
            },
            interval,
            reported: None,
            callback,
        }
    }

    fn report(&mut self) {
        if let Some(callback) = self.callback.as_mut() {
            callback(&self.progress);
            self.reported = Some(self.progress.entries_processed);
        }
    }

    fn tick(&mut self) {
        self.progress.entries_processed += 1;
        if self.interval > 0 && self.progress.entries_processed % self.interval == 0 {
            self.report();
        }
    }

    fn stalled(&mut self) {
        self.progress.stalled_on_checkpoint = true;
        self.report();
        self.progress.stalled_on_checkpoint = false;
    }

    fn finish(&mut self) {
        if self.reported != Some(self.progress.entries_processed) {
            self.report();
        }
    }
}

/// Creates, tracks and finishes transactions.
pub struct TxnManager {
    settings: TxnSettings,
    provider: Arc<dyn BackendProvider>,
    log: Arc<LogWriter>,
    locks: Arc<LockManager>,
    mvcc: Arc<MvccStore>,
    stats: Arc<EngineStats>,
    txns: RwLock<HashMap<TxnId, Arc<TxnRecord>>>,
    next_id: AtomicU64,
    snapshot_latch: RwLock<()>,
    checkpoint_running: AtomicBool,
}

impl TxnManager {
    /// Creates a manager whose first transaction gets `first_id`.
    pub fn new(
        settings: TxnSettings,
        provider: Arc<dyn BackendProvider>,
        log: Arc<LogWriter>,
        locks: Arc<LockManager>,
        mvcc: Arc<MvccStore>,
        stats: Arc<EngineStats>,
        first_id: TxnId,
    ) -> Self {
        Self {
            settings,
            provider,
            log,
            locks,
            mvcc,
            stats,
            txns: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(first_id.0.max(1)),
            snapshot_latch: RwLock::new(()),
            checkpoint_running: AtomicBool::new(false),
        }
    }

    /// Looks up a live transaction.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TransactionNotFound`] if it finished or never existed.
    pub fn record(&self, txn: TxnId) -> CoreResult<Arc<TxnRecord>> {
        self.txns
            .read()
            .get(&txn)
            .cloned()
            .ok_or(CoreError::TransactionNotFound { txn })
    }

    /// Starts a transaction, nested under `parent` if given.
    ///
    /// A child must use its parent's isolation level and shares its
    /// snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if the parent cannot take a
    /// child, and log errors if the `Begin` record cannot be appended.
    pub fn begin(&self, parent: Option<TxnId>, isolation: IsolationLevel) -> CoreResult<TxnId> {
        self.log.check()?;
        let parent_rec = parent.map(|p| self.record(p)).transpose()?;
        let mut parent_inner = parent_rec.as_ref().map(|p| p.inner.lock());

        if let (Some(p), Some(inner)) = (&parent_rec, &parent_inner) {
            p.check_operable(inner)?;
            if p.isolation != isolation {
                return Err(CoreError::invalid_operation(format!(
                    "child isolation {isolation:?} differs from parent {:?}",
                    p.isolation
                )));
            }
        }

        let _latch = self.snapshot_latch.read();
        let id = TxnId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let begin_lsn = self.log.append(&LogRecord::Begin {
            txn: id,
            parent,
            isolation,
        })?;
        let snapshot = match &parent_rec {
            Some(p) if isolation.fixes_snapshot() => p.snapshot(),
            _ => self.log.next_lsn(),
        };

        let mut lineage = vec![id];
        if let Some(p) = &parent_rec {
            lineage.extend_from_slice(&p.lineage);
        }
        let record = Arc::new(TxnRecord::new(
            id,
            parent,
            lineage,
            isolation,
            begin_lsn,
            snapshot,
            RollbackLog::new(id, Arc::clone(&self.provider), self.settings.rollback_spill_threshold),
        ));
        self.txns.write().insert(id, record);
        if let Some(inner) = parent_inner.as_mut() {
            inner.children.push(id);
        }

        self.stats.record_begin();
        debug!(txn = %id, ?parent, ?isolation, begin_lsn = begin_lsn.0, "transaction begun");
        Ok(id)
    }

    /// Returns the state of a live transaction.
    pub fn state(&self, txn: TxnId) -> Option<TxnState> {
        self.txns.read().get(&txn).map(|rec| rec.state())
    }

    /// Describes a live transaction.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TransactionNotFound`] if it is not live.
    pub fn info(&self, txn: TxnId) -> CoreResult<TxnInfo> {
        let rec = self.record(txn)?;
        let inner = rec.inner.lock();
        Ok(TxnInfo {
            id: rec.id,
            parent: rec.parent,
            children: inner.children.clone(),
            state: rec.state(),
            isolation: rec.isolation,
            begin_lsn: rec.begin_lsn,
            snapshot: rec.snapshot(),
            rollback_entries: inner.rollback.as_ref().map_or(0, RollbackLog::len),
        })
    }

    /// Returns the transaction ready for one statement.
    ///
    /// A `ReadCommitted` transaction takes a fresh snapshot here.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if it cannot run statements.
    pub fn statement(&self, txn: TxnId) -> CoreResult<Arc<TxnRecord>> {
        self.log.check()?;
        let rec = self.record(txn)?;
        {
            let inner = rec.inner.lock();
            rec.check_operable(&inner)?;
        }
        if rec.isolation == IsolationLevel::ReadCommitted {
            let _latch = self.snapshot_latch.read();
            rec.set_snapshot(self.log.next_lsn());
        }
        Ok(rec)
    }

    /// Acquires a range lock on behalf of `txn`.
    ///
    /// # Errors
    ///
    /// Lock errors leave the transaction usable for abort.
    pub fn lock(
        &self,
        rec: &TxnRecord,
        dict: DictId,
        range: KeyRange,
        mode: LockMode,
        nowait: bool,
    ) -> CoreResult<()> {
        self.locks.acquire(&LockRequest {
            lineage: &rec.lineage,
            dict,
            range,
            mode,
            nowait,
        })?;
        rec.inner.lock().lock_dicts.insert(dict);
        Ok(())
    }

    /// Takes a whole-table write lock; later row writes in `dict` skip
    /// per-row locking.
    ///
    /// # Errors
    ///
    /// Lock errors as for [`TxnManager::lock`].
    pub fn lock_table(&self, rec: &TxnRecord, dict: DictId, nowait: bool) -> CoreResult<()> {
        self.lock(rec, dict, KeyRange::all(), LockMode::Write, nowait)?;
        rec.inner.lock().table_locks.insert(dict);
        debug!(txn = %rec.id, %dict, "table lock taken");
        Ok(())
    }

    /// Returns true if `rec` or an ancestor holds a table lock on `dict`.
    pub fn holds_table_lock(&self, rec: &TxnRecord, dict: DictId) -> bool {
        rec.lineage.iter().any(|id| {
            self.txns
                .read()
                .get(id)
                .cloned()
                .is_some_and(|r| r.inner.lock().table_locks.contains(&dict))
        })
    }

    /// Logs a write, installs the provisional version and records undo.
    ///
    /// Runs under the transaction's mutex, so it is serialized against
    /// commit or abort starting to consume the rollback log. The caller
    /// holds the covering write lock.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] once commit or abort began.
    pub fn write(
        &self,
        rec: &TxnRecord,
        dict: DictId,
        key: &[u8],
        value: Option<&[u8]>,
    ) -> CoreResult<Lsn> {
        let mut inner = rec.inner.lock();
        rec.check_operable(&inner)?;
        self.mvcc.dict(dict)?;

        let record = match value {
            Some(value) => LogRecord::Insert {
                txn: rec.id,
                dict,
                key: key.to_vec(),
                value: value.to_vec(),
            },
            None => LogRecord::Delete {
                txn: rec.id,
                dict,
                key: key.to_vec(),
            },
        };
        let lsn = self.log.append(&record)?;
        self.mvcc
            .write(dict, key, value.map(<[u8]>::to_vec), rec.id, lsn)?;
        let rollback = inner
            .rollback
            .as_mut()
            .ok_or_else(|| CoreError::invalid_operation("rollback log already consumed"))?;
        let spilled = rollback.push(RollbackEntry {
            dict,
            key: key.to_vec(),
            lsn,
            writer: rec.id,
        })?;
        if spilled {
            self.stats.record_rollback_spill();
        }
        trace!(txn = %rec.id, %dict, lsn = lsn.0, tombstone = value.is_none(), "write logged");
        Ok(lsn)
    }

    fn take_rollback(&self, rec: &TxnRecord) -> CoreResult<RollbackLog> {
        let mut inner = rec.inner.lock();
        rec.check_operable(&inner)?;
        rec.set_state(TxnState::Preparing);
        Ok(inner
            .rollback
            .take()
            .unwrap_or_else(|| RollbackLog::new(rec.id, Arc::clone(&self.provider), 0)))
    }

    fn active_children(rec: &TxnRecord) -> Option<TxnId> {
        rec.inner.lock().children.last().copied()
    }

    /// Commits a transaction; active children are committed first.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if the transaction is not
    /// active, and log errors (fatal) if the commit cannot be made durable.
    /// A commit whose rollback log cannot be read is still finished and
    /// returns [`CoreError::EnvironmentPanicked`].
    pub fn commit(&self, txn: TxnId, progress: Option<ProgressFn<'_>>) -> CoreResult<()> {
        self.log.check()?;
        let rec = self.record(txn)?;
        while let Some(child) = Self::active_children(&rec) {
            self.commit(child, None)?;
        }

        let rollback = self.take_rollback(&rec)?;
        match rec.parent {
            None => self.commit_root(&rec, rollback, progress),
            Some(parent) => self.commit_child(&rec, parent, rollback),
        }
    }

    fn commit_root(
        &self,
        rec: &TxnRecord,
        rollback: RollbackLog,
        progress: Option<ProgressFn<'_>>,
    ) -> CoreResult<()> {
        let mut reporter = ProgressReporter::new(
            rollback.len(),
            true,
            self.settings.progress_interval,
            progress,
        );

        let commit_lsn = {
            let _latch = match self.snapshot_latch.try_write() {
                Some(latch) => latch,
                None => {
                    if self.checkpoint_running.load(Ordering::Acquire) {
                        reporter.stalled();
                    }
                    self.snapshot_latch.write()
                }
            };
            let lsn = self.log.append(&LogRecord::Commit { txn: rec.id })?;
            rec.set_commit_lsn(lsn);
            lsn
        };

        if self.settings.sync_on_commit {
            self.log.flush(Some(commit_lsn))?;
        }

        // The commit record is logged, so the commit finishes even if the
        // rollback log cannot be read back; recovery redoes it.
        let marked = rollback.for_each_oldest_first(|entry| {
            self.mvcc
                .commit_version(entry.dict, &entry.key, entry.lsn, commit_lsn)?;
            reporter.tick();
            Ok(())
        });
        reporter.finish();

        let (dicts, merged) = Self::family_parts(rec);
        self.locks.release_owner(rec.id, &dicts);
        rec.set_state(TxnState::Committed);
        if let Err(err) = rollback.discard() {
            warn!(txn = %rec.id, error = %err, "failed to remove rollback spill file");
        }
        self.remove_records(rec.id, &merged);

        self.stats.record_commit();
        debug!(txn = %rec.id, commit_lsn = commit_lsn.0, "transaction committed");
        marked.map_err(|err| self.panic_on(rec.id, "commit", &err))
    }

    /// Poisons the environment after a transaction could not be finished
    /// in memory. The log still decides its outcome at the next open.
    fn panic_on(&self, txn: TxnId, phase: &str, err: &CoreError) -> CoreError {
        let reason = format!("{phase} of transaction {txn} failed: {err}");
        self.log.set_poison(reason.clone());
        CoreError::panicked(reason)
    }

    fn commit_child(&self, rec: &TxnRecord, parent: TxnId, rollback: RollbackLog) -> CoreResult<()> {
        let parent_rec = self.record(parent)?;
        self.log.append(&LogRecord::Commit { txn: rec.id })?;

        let (dicts, table_locks, merged) = {
            let mut inner = rec.inner.lock();
            (
                std::mem::take(&mut inner.lock_dicts),
                std::mem::take(&mut inner.table_locks),
                std::mem::take(&mut inner.merged),
            )
        };
        let dict_list: Vec<DictId> = dicts.iter().copied().collect();
        self.locks.transfer(rec.id, parent, &dict_list);

        let absorbed = {
            let mut parent_inner = parent_rec.inner.lock();
            let absorbed = match parent_inner.rollback.as_mut() {
                Some(parent_log) => parent_log.absorb(rollback),
                None => Err(CoreError::invalid_operation("parent rollback log consumed")),
            };
            if let Ok(spills) = &absorbed {
                for _ in 0..*spills {
                    self.stats.record_rollback_spill();
                }
            }
            parent_inner.lock_dicts.extend(dicts);
            parent_inner.table_locks.extend(table_locks);
            parent_inner.merged.push(rec.id);
            parent_inner.merged.extend(merged);
            parent_inner.children.retain(|child| *child != rec.id);
            absorbed
        };

        rec.set_merged_into(parent);
        rec.set_state(TxnState::Committed);
        self.stats.record_commit();
        debug!(txn = %rec.id, %parent, "child transaction merged into parent");
        // Without the child's entries the parent can no longer undo them.
        absorbed
            .map(|_| ())
            .map_err(|err| self.panic_on(rec.id, "child commit", &err))
    }

    /// Aborts a transaction; active children are aborted first.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if the transaction is not
    /// active. If the `Abort` record cannot be logged the undo still
    /// happens and the log error is returned. If the rollback log cannot be
    /// read the locks are still released, the transaction is removed and
    /// the environment panics.
    pub fn abort(&self, txn: TxnId, progress: Option<ProgressFn<'_>>) -> CoreResult<()> {
        let rec = self.record(txn)?;
        while let Some(child) = Self::active_children(&rec) {
            self.abort(child, None)?;
        }

        let rollback = self.take_rollback(&rec)?;
        let mut reporter = ProgressReporter::new(
            rollback.len(),
            false,
            self.settings.progress_interval,
            progress,
        );
        let undone = rollback.for_each_newest_first(|entry| {
            self.mvcc.undo(entry.dict, &entry.key, entry.lsn)?;
            reporter.tick();
            Ok(())
        });
        reporter.finish();

        let (dicts, merged) = Self::family_parts(&rec);
        match rec.parent {
            None => self.locks.release_owner(rec.id, &dicts),
            Some(_) => self.locks.release_holder(rec.id, &dicts),
        }

        // An incomplete undo must not be logged as an abort: the poisoned
        // log refuses the record and recovery undoes the rest.
        let logged = match &undone {
            Ok(()) => self.log.append(&LogRecord::Abort { txn }),
            Err(err) => Err(self.panic_on(txn, "abort", err)),
        };
        rec.set_state(TxnState::Aborted);
        if let Err(err) = rollback.discard() {
            warn!(%txn, error = %err, "failed to remove rollback spill file");
        }
        if let Some(parent) = rec.parent {
            if let Ok(parent_rec) = self.record(parent) {
                parent_rec.inner.lock().children.retain(|child| *child != txn);
            }
        }
        self.remove_records(txn, &merged);

        self.stats.record_abort();
        debug!(%txn, "transaction aborted");
        logged.map(|_| ())
    }

    fn family_parts(rec: &TxnRecord) -> (Vec<DictId>, Vec<TxnId>) {
        let inner: parking_lot::MutexGuard<'_, TxnInner> = rec.inner.lock();
        (
            inner.lock_dicts.iter().copied().collect(),
            inner.merged.clone(),
        )
    }

    fn remove_records(&self, txn: TxnId, merged: &[TxnId]) {
        let mut txns = self.txns.write();
        txns.remove(&txn);
        for id in merged {
            txns.remove(id);
        }
    }

    /// Oldest snapshot any live reader may use.
    pub fn oldest_snapshot(&self) -> Lsn {
        let floor = self.log.next_lsn();
        self.txns
            .read()
            .values()
            .filter(|rec| rec.isolation != IsolationLevel::ReadUncommitted)
            .filter(|rec| matches!(rec.state(), TxnState::Active | TxnState::Preparing))
            .map(|rec| rec.snapshot())
            .fold(floor, Lsn::min)
    }

    /// Lowest `Begin` LSN among live transactions.
    pub fn oldest_begin(&self) -> Option<Lsn> {
        self.txns.read().values().map(|rec| rec.begin_lsn).min()
    }

    /// Live transactions with their parents, ordered by id.
    pub fn open_transactions(&self) -> Vec<OpenTxn> {
        let mut open: Vec<OpenTxn> = self
            .txns
            .read()
            .values()
            .map(|rec| OpenTxn {
                txn: rec.id,
                parent: rec.parent,
                begin_lsn: rec.begin_lsn,
            })
            .collect();
        open.sort_by_key(|o| o.txn);
        open
    }

    /// Number of live transaction records.
    pub fn live_count(&self) -> usize {
        self.txns.read().len()
    }

    /// Appends `CheckpointBegin` under the snapshot latch.
    ///
    /// Returns the record's LSN and the oldest LSN recovery will need.
    ///
    /// # Errors
    ///
    /// Log errors.
    pub fn begin_checkpoint(&self) -> CoreResult<(Lsn, Lsn, Vec<OpenTxn>)> {
        let _latch = self.snapshot_latch.write();
        let open_txns = self.open_transactions();
        let next = self.log.next_lsn();
        let oldest_required = open_txns
            .iter()
            .map(|o| o.begin_lsn)
            .min()
            .map_or(next, |begin| begin.min(next));
        let lsn = self.log.append(&LogRecord::CheckpointBegin {
            open_txns: open_txns.clone(),
            oldest_required,
        })?;
        Ok((lsn, oldest_required, open_txns))
    }

    /// Flags a checkpoint in progress (used for stall reports).
    pub fn set_checkpoint_running(&self, running: bool) {
        self.checkpoint_running.store(running, Ordering::Release);
    }

    /// Aborts every live root transaction (used on close).
    ///
    /// # Errors
    ///
    /// Returns the first abort error.
    pub fn abort_all(&self) -> CoreResult<usize> {
        let roots: Vec<TxnId> = self
            .txns
            .read()
            .values()
            .filter(|rec| rec.is_root() && rec.state() == TxnState::Active)
            .map(|rec| rec.id)
            .collect();
        for txn in &roots {
            self.abort(*txn, None)?;
        }
        Ok(roots.len())
    }
}

impl WriterResolver for TxnManager {
    fn status(&self, writer: TxnId) -> WriterStatus {
        let mut current = writer;
        loop {
            let Some(rec) = self.txns.read().get(&current).cloned() else {
                return WriterStatus::Aborted;
            };
            if rec.state() == TxnState::Aborted {
                return WriterStatus::Aborted;
            }
            if let Some(commit_lsn) = rec.commit_lsn() {
                return WriterStatus::Committed { commit_lsn };
            }
            match rec.merged_into() {
                Some(parent) => current = parent,
                None => return WriterStatus::Active { owner: current },
            }
        }
    }
}
