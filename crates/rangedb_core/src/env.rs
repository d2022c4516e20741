//! Environment handle.

use crate::checkpoint::{CheckpointReport, Checkpointer};
use crate::config::EnvConfig;
use crate::db::Db;
#[cfg(feature = "std")]
use crate::dir::EnvDir;
use crate::error::{CoreError, CoreResult};
use crate::locktree::{DeadlockVictim, LockManager, LockSettings, RangeLock};
use crate::log::{FileOp, LogRecord, LogWriter};
use crate::mvcc::{collect, GcObserver, GcReport, MvccStore};
use crate::recovery::{recover, RecoveryReport};
use crate::stats::{EngineStats, StatsSnapshot};
use crate::tree::{Catalog, CatalogEntry, ImageTreeStore, TreeStore};
use crate::txn::{TxnInfo, TxnManager, TxnProgress, TxnSettings};
use crate::types::{IsolationLevel, LogFileId, TxnId, TxnState};
use parking_lot::{Condvar, Mutex, RwLock};
use rangedb_storage::{BackendProvider, MemoryProvider};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Shared state behind an [`Environment`] and its [`Db`] handles.
pub(crate) struct EnvCore {
    pub(crate) config: EnvConfig,
    pub(crate) provider: Arc<dyn BackendProvider>,
    pub(crate) stats: Arc<EngineStats>,
    pub(crate) log: Arc<LogWriter>,
    pub(crate) locks: Arc<LockManager>,
    pub(crate) mvcc: Arc<MvccStore>,
    pub(crate) txns: Arc<TxnManager>,
    pub(crate) catalog: Arc<RwLock<Catalog>>,
    checkpointer: Checkpointer,
    gc_observer: RwLock<Option<Arc<dyn GcObserver>>>,
    closed: AtomicBool,
    next_temp: AtomicU64,
}

impl EnvCore {
    pub(crate) fn ensure_open(&self) -> CoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CoreError::invalid_operation("environment is closed"));
        }
        self.log.check()
    }

    /// Returns a fresh temporary file name.
    pub(crate) fn temp_name(&self, prefix: &str) -> String {
        let n = self.next_temp.fetch_add(1, Ordering::Relaxed);
        format!("tmp/{prefix}{n}.tmp")
    }
}

struct Background {
    stop: Arc<(Mutex<bool>, Condvar)>,
    handle: JoinHandle<()>,
}

impl Background {
    fn spawn(core: Arc<EnvCore>, interval: Duration) -> CoreResult<Self> {
        let stop = Arc::new((Mutex::new(false), Condvar::new()));
        let signal = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("rangedb-checkpoint".into())
            .spawn(move || {
                debug!(?interval, "background checkpointer started");
                let (stopped, wake) = &*signal;
                loop {
                    {
                        let mut stopped = stopped.lock();
                        if !*stopped {
                            wake.wait_for(&mut stopped, interval);
                        }
                        if *stopped {
                            break;
                        }
                    }
                    if let Err(err) = core.checkpointer.run() {
                        warn!(error = %err, "background checkpoint failed");
                        if err.is_fatal() {
                            break;
                        }
                    }
                }
                debug!("background checkpointer exiting");
            })?;
        Ok(Self { stop, handle })
    }

    fn stop(self) {
        let (stopped, wake) = &*self.stop;
        *stopped.lock() = true;
        wake.notify_all();
        if self.handle.join().is_err() {
            warn!("background checkpointer panicked");
        }
    }
}

/// An open environment: the lock manager, transaction manager, log and
/// version store of one set of dictionaries.
///
/// Several environments can be open in one process; each owns its own
/// managers.
///
/// ```rust,ignore
/// use rangedb_core::{EnvConfig, Environment, IsolationLevel};
///
/// let env = Environment::open_in_memory(EnvConfig::default())?;
/// let users = env.open_db("users")?;
/// env.transaction(IsolationLevel::Serializable, |txn| {
///     users.put(txn, b"alice", b"1")
/// })?;
/// env.close()?;
/// ```
pub struct Environment {
    core: Arc<EnvCore>,
    recovery: RecoveryReport,
    background: Mutex<Option<Background>>,
    #[cfg(feature = "std")]
    _dir: Option<EnvDir>,
}

impl Environment {
    /// Opens (or creates) an environment in a directory.
    ///
    /// # Errors
    ///
    /// - [`CoreError::EnvironmentLocked`] if another handle has it open
    /// - recovery errors, see [`crate::recovery::recover`]
    #[cfg(feature = "std")]
    pub fn open(path: &std::path::Path, config: EnvConfig) -> CoreResult<Self> {
        let dir = EnvDir::open(path, config.create_if_missing)?;
        let provider: Arc<dyn BackendProvider> =
            Arc::new(rangedb_storage::DirectoryProvider::new(path)?);
        let tree = Arc::new(ImageTreeStore::open(Arc::clone(&provider))?);
        let mut env = Self::open_inner(config, provider, tree)?;
        env._dir = Some(dir);
        Ok(env)
    }

    /// Opens a non-persistent environment.
    ///
    /// # Errors
    ///
    /// Only fails if the background checkpointer cannot be started.
    pub fn open_in_memory(config: EnvConfig) -> CoreResult<Self> {
        let provider: Arc<dyn BackendProvider> = Arc::new(MemoryProvider::new());
        let tree = Arc::new(ImageTreeStore::open(Arc::clone(&provider))?);
        Self::open_inner(config, provider, tree)
    }

    /// Opens an environment over caller-supplied storage and tree layer.
    ///
    /// Test harnesses use this to reopen a "crashed" environment over the
    /// same in-memory bytes, or to inject slow and failing components.
    ///
    /// # Errors
    ///
    /// Recovery errors, see [`crate::recovery::recover`].
    pub fn open_with_provider(
        config: EnvConfig,
        provider: Arc<dyn BackendProvider>,
        tree: Arc<dyn TreeStore>,
    ) -> CoreResult<Self> {
        Self::open_inner(config, provider, tree)
    }

    fn open_inner(
        config: EnvConfig,
        provider: Arc<dyn BackendProvider>,
        tree: Arc<dyn TreeStore>,
    ) -> CoreResult<Self> {
        let stats = Arc::new(EngineStats::new());
        let locks = Arc::new(LockManager::new(
            LockSettings {
                timeout: config.lock_timeout,
                escalation_threshold: config.lock_escalation_threshold,
                detection: config.deadlock_detection,
                shared_reads: config.shared_read_locks,
            },
            Arc::clone(&stats),
        ));
        let mvcc = Arc::new(MvccStore::new());

        clear_temporaries(provider.as_ref());
        let recovered = recover(
            &config,
            Arc::clone(&provider),
            tree.as_ref(),
            &mvcc,
            &locks,
            Arc::clone(&stats),
        )?;

        let log = Arc::new(recovered.log);
        let txns = Arc::new(TxnManager::new(
            TxnSettings {
                rollback_spill_threshold: config.rollback_spill_threshold,
                progress_interval: config.progress_interval,
                sync_on_commit: config.sync_on_commit,
            },
            Arc::clone(&provider),
            Arc::clone(&log),
            Arc::clone(&locks),
            Arc::clone(&mvcc),
            Arc::clone(&stats),
            recovered.next_txn,
        ));
        let catalog = Arc::new(RwLock::new(recovered.catalog));
        let checkpointer = Checkpointer::new(
            Arc::clone(&log),
            Arc::clone(&txns),
            Arc::clone(&mvcc),
            tree,
            Arc::clone(&catalog),
            Arc::clone(&stats),
            config.checkpoint_flush_retries,
            recovered.checkpoint,
        );
        let interval = config.checkpoint_interval;

        let core = Arc::new(EnvCore {
            config,
            provider,
            stats,
            log,
            locks,
            mvcc,
            txns,
            catalog,
            checkpointer,
            gc_observer: RwLock::new(None),
            closed: AtomicBool::new(false),
            next_temp: AtomicU64::new(1),
        });

        let background = if interval.is_zero() {
            None
        } else {
            Some(Background::spawn(Arc::clone(&core), interval)?)
        };

        info!(
            dictionaries = core.catalog.read().dicts.len(),
            next_lsn = core.log.next_lsn().0,
            "environment opened"
        );
        Ok(Self {
            core,
            recovery: recovered.report,
            background: Mutex::new(background),
            #[cfg(feature = "std")]
            _dir: None,
        })
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &EnvConfig {
        &self.core.config
    }

    /// What recovery did when this environment was opened.
    #[must_use]
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Returns true until [`Environment::close`] runs.
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.core.closed.load(Ordering::Acquire)
    }

    /// Aborts live transactions, takes a final checkpoint and closes.
    ///
    /// # Errors
    ///
    /// Returns the checkpoint error; the environment is closed regardless.
    pub fn close(&self) -> CoreResult<()> {
        if let Some(background) = self.background.lock().take() {
            background.stop();
        }
        if self.core.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.core.log.poisoned().is_some() {
            return Ok(());
        }

        let aborted = self.core.txns.abort_all()?;
        if aborted > 0 {
            warn!(aborted, "aborted transactions still open at close");
        }
        self.core.checkpointer.run()?;
        info!("environment closed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dictionaries
    // ------------------------------------------------------------------

    /// Opens a dictionary, creating it with the bytewise comparator.
    ///
    /// # Errors
    ///
    /// See [`Environment::open_db_with_comparator`].
    pub fn open_db(&self, name: &str) -> CoreResult<Db> {
        self.open_db_with_comparator(name, "bytewise")
    }

    /// Opens a dictionary, creating it with the named comparator.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidArgument`] if the comparator is not registered
    ///   or the dictionary already uses another one
    /// - log errors while recording the creation
    pub fn open_db_with_comparator(&self, name: &str, comparator: &str) -> CoreResult<Db> {
        self.core.ensure_open()?;
        if name.is_empty() {
            return Err(CoreError::invalid_argument("dictionary name is empty"));
        }
        let mut catalog = self.core.catalog.write();
        if let Some(entry) = catalog.by_name(name) {
            if entry.comparator != comparator {
                return Err(CoreError::invalid_argument(format!(
                    "dictionary {name} uses comparator {:?}",
                    entry.comparator
                )));
            }
            return Ok(Db::new(Arc::clone(&self.core), entry.id, name));
        }

        let cmp = self.core.config.comparator(comparator).ok_or_else(|| {
            CoreError::invalid_argument(format!("comparator {comparator:?} is not registered"))
        })?;
        let id = catalog.allocate();
        let lsn = self.core.log.append(&LogRecord::FileOp(FileOp::Create {
            dict: id,
            name: name.to_string(),
            comparator: comparator.to_string(),
        }))?;
        self.core.log.flush(Some(lsn))?;
        catalog.insert(CatalogEntry {
            id,
            name: name.to_string(),
            comparator: comparator.to_string(),
        });
        self.core.mvcc.register_dict(id, Arc::clone(&cmp));
        self.core.locks.register_dict(id, cmp);
        info!(%id, name, comparator, "dictionary created");
        Ok(Db::new(Arc::clone(&self.core), id, name))
    }

    /// Removes a dictionary and everything in it.
    ///
    /// # Errors
    ///
    /// - [`CoreError::DictionaryNotFound`] for an unknown name
    /// - [`CoreError::InvalidOperation`] while a transaction holds locks in it
    pub fn remove_db(&self, name: &str) -> CoreResult<()> {
        self.core.ensure_open()?;
        let mut catalog = self.core.catalog.write();
        let id = catalog
            .by_name(name)
            .map(|entry| entry.id)
            .ok_or_else(|| CoreError::DictionaryNotFound {
                name: name.to_string(),
            })?;
        if !self.core.locks.ranges(id)?.is_empty() {
            return Err(CoreError::invalid_operation(format!(
                "dictionary {name} is locked by a live transaction"
            )));
        }
        let lsn = self
            .core
            .log
            .append(&LogRecord::FileOp(FileOp::Remove { dict: id }))?;
        self.core.log.flush(Some(lsn))?;
        catalog.remove(id);
        self.core.mvcc.remove_dict(id);
        self.core.locks.remove_dict(id);
        info!(%id, name, "dictionary removed");
        Ok(())
    }

    /// Names of the existing dictionaries, sorted.
    #[must_use]
    pub fn dictionaries(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .core
            .catalog
            .read()
            .dicts
            .iter()
            .map(|entry| entry.name.clone())
            .collect();
        names.sort();
        names
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Starts a transaction, nested under `parent` if given.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidOperation`] if `parent` cannot take a
    /// child (not active, already has an active child, or uses another
    /// isolation level).
    pub fn begin(&self, parent: Option<TxnId>, isolation: IsolationLevel) -> CoreResult<TxnId> {
        self.core.ensure_open()?;
        self.core.txns.begin(parent, isolation)
    }

    /// Commits a transaction.
    ///
    /// # Errors
    ///
    /// See [`TxnManager::commit`].
    pub fn commit(&self, txn: TxnId) -> CoreResult<()> {
        self.core.ensure_open()?;
        self.core.txns.commit(txn, None)
    }

    /// Commits a transaction, reporting progress every
    /// `progress_interval` rollback entries.
    ///
    /// # Errors
    ///
    /// See [`TxnManager::commit`].
    pub fn commit_with_progress(
        &self,
        txn: TxnId,
        progress: &mut dyn FnMut(&TxnProgress),
    ) -> CoreResult<()> {
        self.core.ensure_open()?;
        self.core.txns.commit(txn, Some(progress))
    }

    /// Aborts a transaction.
    ///
    /// Works after a lock error; a panicked environment still undoes the
    /// in-memory effects.
    ///
    /// # Errors
    ///
    /// See [`TxnManager::abort`].
    pub fn abort(&self, txn: TxnId) -> CoreResult<()> {
        self.core.txns.abort(txn, None)
    }

    /// Aborts a transaction, reporting progress.
    ///
    /// # Errors
    ///
    /// See [`TxnManager::abort`].
    pub fn abort_with_progress(
        &self,
        txn: TxnId,
        progress: &mut dyn FnMut(&TxnProgress),
    ) -> CoreResult<()> {
        self.core.txns.abort(txn, Some(progress))
    }

    /// Runs `f` in a new top-level transaction: commits on `Ok`, aborts on
    /// `Err`.
    ///
    /// # Errors
    ///
    /// The error returned by `f`, or the commit error.
    pub fn transaction<F, T>(&self, isolation: IsolationLevel, f: F) -> CoreResult<T>
    where
        F: FnOnce(TxnId) -> CoreResult<T>,
    {
        let txn = self.begin(None, isolation)?;
        match f(txn) {
            Ok(value) => {
                self.commit(txn)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(abort_err) = self.abort(txn) {
                    warn!(%txn, error = %abort_err, "abort after failed transaction body failed");
                }
                Err(err)
            }
        }
    }

    /// State of a live transaction; `None` once it has finished.
    #[must_use]
    pub fn txn_state(&self, txn: TxnId) -> Option<TxnState> {
        self.core.txns.state(txn)
    }

    /// Describes a live transaction.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TransactionNotFound`] once it has finished.
    pub fn txn_info(&self, txn: TxnId) -> CoreResult<TxnInfo> {
        self.core.txns.info(txn)
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Takes a checkpoint.
    ///
    /// # Errors
    ///
    /// See [`Checkpointer::run`].
    pub fn checkpoint(&self) -> CoreResult<CheckpointReport> {
        self.core.ensure_open()?;
        self.core.checkpointer.run()
    }

    /// Log files recovery no longer needs.
    ///
    /// Nothing is archivable before the first complete checkpoint, and a
    /// file holding the `Begin` of a live transaction never is.
    ///
    /// # Errors
    ///
    /// Fails only on a closed or panicked environment.
    pub fn archive(&self) -> CoreResult<Vec<LogFileId>> {
        self.core.ensure_open()?;
        let Some(mark) = self.core.checkpointer.last() else {
            return Ok(Vec::new());
        };
        let cutoff = self
            .core
            .txns
            .oldest_begin()
            .map_or(mark.oldest_required, |begin| begin.min(mark.oldest_required));
        Ok(self.core.log.archivable(cutoff))
    }

    /// Deletes the files [`Environment::archive`] reports.
    ///
    /// # Errors
    ///
    /// Storage errors while removing files.
    pub fn purge_archived(&self) -> CoreResult<Vec<LogFileId>> {
        let files = self.archive()?;
        if !files.is_empty() {
            self.core.log.remove_files(&files)?;
            self.core.stats.record_log_files_archived(files.len() as u64);
            info!(files = files.len(), "archived log files removed");
        }
        Ok(files)
    }

    /// Finds lock-wait cycles and rejects one waiter per cycle.
    ///
    /// # Errors
    ///
    /// Fails only on a closed or panicked environment.
    pub fn detect_deadlocks(&self) -> CoreResult<Vec<DeadlockVictim>> {
        self.core.ensure_open()?;
        Ok(self.core.locks.detect_deadlocks())
    }

    /// Removes versions of `db` no live snapshot can read.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DictionaryNotFound`] for a removed dictionary.
    pub fn garbage_collect(&self, db: &Db) -> CoreResult<GcReport> {
        self.core.ensure_open()?;
        let oldest = self.core.txns.oldest_snapshot();
        let observer = self.core.gc_observer.read().clone();
        let report = collect(&self.core.mvcc, db.id(), oldest, observer.as_deref())?;
        self.core
            .stats
            .record_versions_collected(report.versions_removed);
        Ok(report)
    }

    /// Escalates the lock tree of `db`; returns the ranges merged away.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DictionaryNotFound`] for a removed dictionary.
    pub fn escalate(&self, db: &Db) -> CoreResult<usize> {
        self.core.ensure_open()?;
        self.core.locks.escalate(db.id())
    }

    /// Currently granted ranges of `db`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DictionaryNotFound`] for a removed dictionary.
    pub fn lock_ranges(&self, db: &Db) -> CoreResult<Vec<RangeLock>> {
        self.core.locks.ranges(db.id())
    }

    /// Number of lock requests currently blocked.
    #[must_use]
    pub fn lock_waiters(&self) -> usize {
        self.core.locks.waiters()
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> StatsSnapshot {
        self.core.stats.snapshot()
    }

    /// Installs (or removes) the observer told about every version GC
    /// removes.
    pub fn set_gc_observer(&self, observer: Option<Arc<dyn GcObserver>>) {
        *self.core.gc_observer.write() = observer;
    }

    /// LSN the next log record gets.
    #[must_use]
    pub fn next_lsn(&self) -> crate::types::Lsn {
        self.core.log.next_lsn()
    }

    pub(crate) fn core(&self) -> &Arc<EnvCore> {
        &self.core
    }
}

/// Loader temp files and rollback spills never survive a restart; undo
/// after a crash is driven by the log.
fn clear_temporaries(provider: &dyn BackendProvider) {
    for prefix in ["tmp/", "rollback/"] {
        let Ok(names) = provider.list(prefix) else {
            continue;
        };
        for name in names {
            if let Err(err) = provider.remove(&name) {
                warn!(file = %name, error = %err, "failed to remove temporary file");
            }
        }
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("is_open", &self.is_open())
            .field("next_lsn", &self.core.log.next_lsn())
            .field("live_txns", &self.core.txns.live_count())
            .finish_non_exhaustive()
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "close on drop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locktree::{KeyBound, KeyRange};
    use crate::types::LockMode;
    use std::sync::mpsc;

    fn env() -> Environment {
        Environment::open_in_memory(EnvConfig::default().lock_timeout(Duration::from_secs(2)))
            .unwrap()
    }

    #[test]
    fn open_db_is_idempotent() {
        let env = env();
        let a = env.open_db("users").unwrap();
        let b = env.open_db("users").unwrap();
        assert_eq!(a.id(), b.id());
        assert_eq!(env.dictionaries(), vec!["users".to_string()]);
        assert!(env.open_db_with_comparator("users", "reverse").is_err());
    }

    #[test]
    fn transaction_commits_on_ok_and_aborts_on_err() {
        let env = env();
        let db = env.open_db("t").unwrap();
        env.transaction(IsolationLevel::Serializable, |txn| db.put(txn, b"a", b"1"))
            .unwrap();
        let failed: CoreResult<()> = env.transaction(IsolationLevel::Serializable, |txn| {
            db.put(txn, b"b", b"2")?;
            Err(CoreError::invalid_operation("boom"))
        });
        assert!(failed.is_err());

        let txn = env.begin(None, IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(db.get(txn, b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(db.get(txn, b"b").unwrap(), None);
        env.commit(txn).unwrap();
        assert_eq!(env.stats().txns_aborted, 1);
    }

    #[test]
    fn deadlock_victim_can_abort_and_other_proceeds() {
        let env = env();
        let db = env.open_db("t").unwrap();
        let a = env.begin(None, IsolationLevel::Serializable).unwrap();
        let b = env.begin(None, IsolationLevel::Serializable).unwrap();
        db.lock_range(a, KeyRange::point(b"L"), LockMode::Write).unwrap();
        db.lock_range(b, KeyRange::point(b"M"), LockMode::Write).unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let db = db.clone();
            std::thread::spawn(move || {
                tx.send(()).unwrap();
                db.lock_range(a, KeyRange::point(b"M"), LockMode::Write)
            })
        };
        rx.recv().unwrap();
        while env.lock_waiters() == 0 {
            std::thread::yield_now();
        }

        let err = db
            .lock_range(b, KeyRange::point(b"L"), LockMode::Write)
            .unwrap_err();
        assert!(matches!(err, CoreError::Deadlock { txn } if txn == b));
        env.abort(b).unwrap();
        waiter.join().unwrap().unwrap();
        env.commit(a).unwrap();
    }

    #[test]
    fn remove_db_refuses_locked_dictionary() {
        let env = env();
        let db = env.open_db("t").unwrap();
        let txn = env.begin(None, IsolationLevel::Serializable).unwrap();
        db.put(txn, b"k", b"v").unwrap();
        assert!(env.remove_db("t").is_err());
        env.commit(txn).unwrap();
        env.remove_db("t").unwrap();
        assert!(env.dictionaries().is_empty());
        assert!(db.get(env.begin(None, IsolationLevel::ReadCommitted).unwrap(), b"k").is_err());
    }

    #[test]
    fn reopen_over_same_memory() {
        let provider = MemoryProvider::new();
        let shared: Arc<dyn BackendProvider> = Arc::new(provider.clone());
        {
            let env = Environment::open_with_provider(
                EnvConfig::default(),
                Arc::clone(&shared),
                Arc::new(ImageTreeStore::open(Arc::clone(&shared)).unwrap()),
            )
            .unwrap();
            let db = env.open_db("t").unwrap();
            env.transaction(IsolationLevel::Serializable, |txn| db.put(txn, b"k", b"v"))
                .unwrap();
            env.close().unwrap();
        }

        let env = Environment::open_with_provider(
            EnvConfig::default(),
            Arc::clone(&shared),
            Arc::new(ImageTreeStore::open(Arc::clone(&shared)).unwrap()),
        )
        .unwrap();
        assert!(env.recovery_report().clean_shutdown);
        let db = env.open_db("t").unwrap();
        let txn = env.begin(None, IsolationLevel::SnapshotRepeatableRead).unwrap();
        assert_eq!(db.get(txn, b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn archive_waits_for_checkpoint() {
        let env = Environment::open_in_memory(EnvConfig::default().log_file_size(256)).unwrap();
        let db = env.open_db("t").unwrap();
        for n in 0..20u8 {
            env.transaction(IsolationLevel::Serializable, |txn| db.put(txn, &[n], &[0; 32]))
                .unwrap();
        }
        assert!(env.archive().unwrap().is_empty());
        env.checkpoint().unwrap();
        let archived = env.purge_archived().unwrap();
        assert!(!archived.is_empty());
        assert_eq!(env.stats().log_files_archived, archived.len() as u64);
    }

    #[test]
    fn background_checkpointer_runs() {
        let env = Environment::open_in_memory(
            EnvConfig::default().checkpoint_interval(Duration::from_millis(10)),
        )
        .unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while env.stats().checkpoints == 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(env.stats().checkpoints > 0);
        env.close().unwrap();
    }

    #[test]
    fn closed_environment_rejects_work() {
        let env = env();
        env.close().unwrap();
        assert!(env.begin(None, IsolationLevel::Serializable).is_err());
        env.close().unwrap();
    }

    #[test]
    fn explicit_prelock_blocks_other_family() {
        let env = Environment::open_in_memory(
            EnvConfig::default().lock_timeout(Duration::from_millis(20)),
        )
        .unwrap();
        let db = env.open_db("t").unwrap();
        let a = env.begin(None, IsolationLevel::Serializable).unwrap();
        db.lock_range(
            a,
            KeyRange::span(KeyBound::Key(b"a".to_vec()), KeyBound::Key(b"m".to_vec())),
            LockMode::Write,
        )
        .unwrap();
        let b = env.begin(None, IsolationLevel::Serializable).unwrap();
        let err = db.put(b, b"c", b"x").unwrap_err();
        assert!(matches!(err, CoreError::LockTimeout { .. }));
        env.abort(b).unwrap();
        env.commit(a).unwrap();
    }
}
