//! Checkpoint coordinator.
//!
//! A checkpoint logs `CheckpointBegin` with the open transactions, copies
//! the dirty chains, makes the log durable, hands the chains to the tree
//! store and logs `CheckpointEnd`. Only the `CheckpointBegin` append holds
//! the snapshot latch, and chain copying holds one dictionary latch at a
//! time, so commits and aborts never wait for the image write.

use crate::error::{CoreError, CoreResult};
use crate::log::{LogRecord, LogWriter};
use crate::mvcc::{CapturedChain, MvccStore};
use crate::stats::EngineStats;
use crate::tree::{Catalog, TreeStore};
use crate::txn::TxnManager;
use crate::types::{DictId, Lsn};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Outcome of a completed checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointReport {
    /// LSN of the `CheckpointBegin` record.
    pub begin_lsn: Lsn,
    /// LSN of the `CheckpointEnd` record.
    pub end_lsn: Lsn,
    /// Oldest LSN recovery needs when starting from this checkpoint.
    pub oldest_required: Lsn,
    /// Transactions open at `begin_lsn`.
    pub open_txns: usize,
    /// Chains handed to the tree store.
    pub chains_written: usize,
}

/// The most recent complete checkpoint, as found by recovery or written
/// since open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointMark {
    /// LSN of the `CheckpointBegin` record.
    pub begin_lsn: Lsn,
    /// Oldest LSN recovery needs when starting from it.
    pub oldest_required: Lsn,
}

/// Runs checkpoints for one environment.
pub struct Checkpointer {
    log: Arc<LogWriter>,
    txns: Arc<TxnManager>,
    mvcc: Arc<MvccStore>,
    tree: Arc<dyn TreeStore>,
    catalog: Arc<RwLock<Catalog>>,
    stats: Arc<EngineStats>,
    flush_retries: u32,
    serial: Mutex<()>,
    last: Mutex<Option<CheckpointMark>>,
}

impl Checkpointer {
    /// Creates a coordinator.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        log: Arc<LogWriter>,
        txns: Arc<TxnManager>,
        mvcc: Arc<MvccStore>,
        tree: Arc<dyn TreeStore>,
        catalog: Arc<RwLock<Catalog>>,
        stats: Arc<EngineStats>,
        flush_retries: u32,
        last: Option<CheckpointMark>,
    ) -> Self {
        Self {
            log,
            txns,
            mvcc,
            tree,
            catalog,
            stats,
            flush_retries,
            serial: Mutex::new(()),
            last: Mutex::new(last),
        }
    }

    /// The most recent complete checkpoint.
    pub fn last(&self) -> Option<CheckpointMark> {
        *self.last.lock()
    }

    /// Takes a checkpoint. Concurrent calls run one after the other.
    ///
    /// # Errors
    ///
    /// Log errors, and [`CoreError::EnvironmentPanicked`] once the image
    /// flush has failed more than the configured number of retries.
    pub fn run(&self) -> CoreResult<CheckpointReport> {
        let _serial = self.serial.lock();
        self.log.check()?;
        self.txns.set_checkpoint_running(true);
        let result = self.run_locked();
        self.txns.set_checkpoint_running(false);
        result
    }

    fn run_locked(&self) -> CoreResult<CheckpointReport> {
        let (begin_lsn, oldest_required, open_txns) = self.txns.begin_checkpoint()?;
        let captured = self.mvcc.capture_dirty(self.txns.as_ref());
        let catalog = self.catalog.read().clone();

        if let Err(err) = self.log.flush(None) {
            self.mvcc.restore_dirty(&captured);
            return Err(err);
        }

        let mut attempt = 0;
        loop {
            match self.write_image(&captured, &catalog, begin_lsn) {
                Ok(()) => break,
                Err(err) if attempt < self.flush_retries => {
                    attempt += 1;
                    warn!(attempt, error = %err, "checkpoint flush failed; retrying");
                }
                Err(err) => {
                    self.mvcc.restore_dirty(&captured);
                    let reason = format!(
                        "checkpoint flush failed after {} attempts: {err}",
                        attempt + 1
                    );
                    error!(%reason, "environment panicked");
                    self.log.set_poison(reason.clone());
                    return Err(CoreError::panicked(reason));
                }
            }
        }

        let end_lsn = self.log.append(&LogRecord::CheckpointEnd { begin_lsn })?;
        self.log.flush(Some(end_lsn))?;
        *self.last.lock() = Some(CheckpointMark {
            begin_lsn,
            oldest_required,
        });

        let chains_written = captured.iter().map(|(_, chains)| chains.len()).sum();
        self.stats.record_checkpoint();
        info!(
            begin = begin_lsn.0,
            end = end_lsn.0,
            oldest_required = oldest_required.0,
            open_txns = open_txns.len(),
            chains_written,
            "checkpoint complete"
        );
        Ok(CheckpointReport {
            begin_lsn,
            end_lsn,
            oldest_required,
            open_txns: open_txns.len(),
            chains_written,
        })
    }

    fn write_image(
        &self,
        captured: &[(DictId, Vec<CapturedChain>)],
        catalog: &Catalog,
        begin_lsn: Lsn,
    ) -> CoreResult<()> {
        for (dict, chains) in captured {
            for chain in chains {
                self.tree
                    .store_chain(*dict, &chain.key, chain.versions.as_deref())?;
            }
        }
        self.tree.store_catalog(catalog)?;
        self.tree.flush_dirty_nodes(begin_lsn)
    }
}
