//! Crash recovery.
//!
//! Recovery starts from the last durable tree image and the newest
//! complete checkpoint in the log (a `CheckpointEnd` whose
//! `CheckpointBegin` is present). Every record from the checkpoint's oldest
//! required LSN onward is replayed:
//!
//! - inserts and deletes are reinstalled by LSN, so replaying a record the
//!   image already holds changes nothing;
//! - a child's `Commit` hands its writes to its parent, a root's `Commit`
//!   marks the family's writes committed at the commit LSN;
//! - an `Abort` removes the writes of the aborted transaction.
//!
//! Transactions with neither record are losers. Their writes are removed,
//! children before parents, and a synthetic `Abort` is logged for each, so
//! running recovery again finds nothing left to undo.

use crate::checkpoint::CheckpointMark;
use crate::config::EnvConfig;
use crate::error::{CoreError, CoreResult};
use crate::locktree::LockManager;
use crate::log::{FileOp, LogEntry, LogReader, LogRecord, LogScan, LogWriter, OpenTxn, TornTail};
use crate::mvcc::{collect, MvccStore, Version, VersionChain, VersionState};
use crate::stats::EngineStats;
use crate::tree::{Catalog, CatalogEntry, TreeStore};
use crate::types::{DictId, Lsn, TxnId};
use rangedb_storage::BackendProvider;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What recovery found and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// The log ended with a checkpoint taken while nothing was running, so
    /// only the image was loaded.
    pub clean_shutdown: bool,
    /// `CheckpointBegin` LSN of the checkpoint recovery started from.
    pub checkpoint: Option<Lsn>,
    /// First LSN replayed.
    pub scan_start: Lsn,
    /// Records replayed.
    pub records_scanned: usize,
    /// Root transactions whose commits were redone.
    pub committed: usize,
    /// Transactions whose logged abort was replayed.
    pub aborted: usize,
    /// Transactions undone because they never finished.
    pub losers: Vec<TxnId>,
    /// Provisional versions without a transaction in the scanned log.
    pub orphaned_versions: usize,
    /// Versions removed by the final garbage collection.
    pub versions_collected: u64,
    /// Damage cut off the end of the log.
    pub torn_tail: Option<TornTail>,
}

/// State handed to the environment after recovery.
pub struct Recovered {
    /// Writer positioned after the last valid record.
    pub log: LogWriter,
    /// Dictionary catalog.
    pub catalog: Catalog,
    /// First id for new transactions.
    pub next_txn: TxnId,
    /// Checkpoint the log can be archived against.
    pub checkpoint: Option<CheckpointMark>,
    /// Summary.
    pub report: RecoveryReport,
}

#[derive(Debug, Default)]
struct PendingTxn {
    parent: Option<TxnId>,
    writes: Vec<(DictId, Vec<u8>, Lsn)>,
}

struct Replay<'a> {
    config: &'a EnvConfig,
    mvcc: &'a MvccStore,
    locks: &'a LockManager,
    catalog: Catalog,
    pending: BTreeMap<TxnId, PendingTxn>,
    report: RecoveryReport,
}

impl Replay<'_> {
    fn register(&mut self, entry: CatalogEntry) -> CoreResult<()> {
        let comparator = self.config.comparator(&entry.comparator).ok_or_else(|| {
            CoreError::invalid_argument(format!(
                "dictionary {} uses comparator {:?}, which is not registered",
                entry.name, entry.comparator
            ))
        })?;
        self.mvcc.register_dict(entry.id, Arc::clone(&comparator));
        self.locks.register_dict(entry.id, comparator);
        self.catalog.insert(entry);
        Ok(())
    }

    fn unregister(&mut self, dict: DictId) {
        self.catalog.remove(dict);
        self.mvcc.remove_dict(dict);
        self.locks.remove_dict(dict);
    }

    fn known(&self, dict: DictId) -> bool {
        self.catalog.by_id(dict).is_some()
    }

    fn write(
        &mut self,
        lsn: Lsn,
        txn: TxnId,
        dict: DictId,
        key: &[u8],
        value: Option<Vec<u8>>,
    ) -> CoreResult<()> {
        if !self.known(dict) {
            return Ok(());
        }
        self.mvcc.install(
            dict,
            key,
            Version {
                value,
                writer: txn,
                lsn,
                state: VersionState::Provisional,
            },
        )?;
        self.pending
            .entry(txn)
            .or_default()
            .writes
            .push((dict, key.to_vec(), lsn));
        Ok(())
    }

    fn commit(&mut self, txn: TxnId, commit_lsn: Lsn) -> CoreResult<()> {
        let Some(done) = self.pending.remove(&txn) else {
            return Ok(());
        };
        match done.parent {
            Some(parent) => {
                self.pending
                    .entry(parent)
                    .or_default()
                    .writes
                    .extend(done.writes);
            }
            None => {
                for (dict, key, lsn) in &done.writes {
                    self.mvcc.commit_version(*dict, key, *lsn, commit_lsn)?;
                }
                self.report.committed += 1;
            }
        }
        Ok(())
    }

    fn undo(&mut self, txn: TxnId) -> CoreResult<bool> {
        let Some(done) = self.pending.remove(&txn) else {
            return Ok(false);
        };
        for (dict, key, lsn) in done.writes.iter().rev() {
            self.mvcc.undo(*dict, key, *lsn)?;
        }
        Ok(true)
    }

    fn apply(&mut self, entry: &LogEntry) -> CoreResult<()> {
        match &entry.record {
            LogRecord::Begin { txn, parent, .. } => {
                self.pending.entry(*txn).or_default().parent = *parent;
            }
            LogRecord::Insert {
                txn,
                dict,
                key,
                value,
            } => self.write(entry.lsn, *txn, *dict, key, Some(value.clone()))?,
            LogRecord::Delete { txn, dict, key } => {
                self.write(entry.lsn, *txn, *dict, key, None)?;
            }
            LogRecord::Commit { txn } => self.commit(*txn, entry.lsn)?,
            LogRecord::Abort { txn } => {
                if self.undo(*txn)? {
                    self.report.aborted += 1;
                }
            }
            LogRecord::CheckpointBegin { .. } | LogRecord::CheckpointEnd { .. } => {}
            LogRecord::FileOp(FileOp::Create {
                dict,
                name,
                comparator,
            }) => self.register(CatalogEntry {
                id: *dict,
                name: name.clone(),
                comparator: comparator.clone(),
            })?,
            LogRecord::FileOp(FileOp::Remove { dict }) => self.unregister(*dict),
        }
        self.report.records_scanned += 1;
        Ok(())
    }
}

/// Newest `CheckpointEnd` with its matching `CheckpointBegin`.
fn find_checkpoint(scan: &LogScan) -> Option<(usize, usize, Lsn, &[OpenTxn])> {
    for (end_at, entry) in scan.entries.iter().enumerate().rev() {
        let LogRecord::CheckpointEnd { begin_lsn } = entry.record else {
            continue;
        };
        let begin_at = scan.entries.partition_point(|e| e.lsn < begin_lsn);
        if let Some(LogEntry {
            record:
                LogRecord::CheckpointBegin {
                    open_txns,
                    oldest_required,
                },
            lsn,
            ..
        }) = scan.entries.get(begin_at)
        {
            if *lsn == begin_lsn {
                return Some((begin_at, end_at, *oldest_required, open_txns.as_slice()));
            }
        }
        debug!(begin = begin_lsn.0, "ignoring checkpoint end without its begin");
    }
    None
}

/// Rebuilds the in-memory state of an environment.
///
/// # Errors
///
/// Corruption in older log files, image decoding errors, and storage
/// errors while repairing the log tail.
pub fn recover(
    config: &EnvConfig,
    provider: Arc<dyn BackendProvider>,
    tree: &dyn TreeStore,
    mvcc: &MvccStore,
    locks: &LockManager,
    stats: Arc<EngineStats>,
) -> CoreResult<Recovered> {
    let scan = LogReader::open(Arc::clone(&provider))?.scan()?;
    let image = tree.load()?;
    let log = LogWriter::open(provider, config.log_file_size, &scan, Arc::clone(&stats))?;

    let mut replay = Replay {
        config,
        mvcc,
        locks,
        catalog: Catalog::default(),
        pending: BTreeMap::new(),
        report: RecoveryReport {
            torn_tail: scan.torn_tail.clone(),
            ..RecoveryReport::default()
        },
    };
    replay.catalog.next_id = image.catalog.next_id;
    for entry in image.catalog.dicts.clone() {
        replay.register(entry)?;
    }

    let mut max_txn = 0u64;
    for (dict, key, versions) in image.chains {
        if !replay.known(dict) {
            continue;
        }
        max_txn = versions.iter().map(|v| v.writer.0).fold(max_txn, u64::max);
        mvcc.load_chain(dict, &key, VersionChain::from_newest_first(versions))?;
    }
    for entry in &scan.entries {
        if let Some(txn) = entry.record.txn() {
            max_txn = max_txn.max(txn.0);
        }
    }

    let found = find_checkpoint(&scan);
    let checkpoint = found.map(|(begin_at, _, oldest_required, _)| CheckpointMark {
        begin_lsn: scan.entries[begin_at].lsn,
        oldest_required,
    });
    replay.report.checkpoint = checkpoint.map(|mark| mark.begin_lsn);

    let clean = found.is_some_and(|(begin_at, end_at, _, open)| {
        end_at + 1 == scan.entries.len()
            && open.is_empty()
            && image.flushed_lsn == scan.entries[begin_at].lsn
            && scan.entries[begin_at + 1..end_at]
                .iter()
                .all(|e| e.record.txn().is_none() && !matches!(e.record, LogRecord::FileOp(_)))
    });

    if clean {
        replay.report.clean_shutdown = true;
        replay.report.scan_start = scan.next_lsn();
    } else {
        let start = checkpoint.map_or(Lsn::ZERO, |mark| mark.oldest_required);
        replay.report.scan_start = start;
        for entry in scan.entries_from(start) {
            replay.apply(entry)?;
        }

        // Children have larger ids than their parents, so undoing in
        // descending id order finishes every child before its parent.
        let losers: Vec<TxnId> = replay.pending.keys().rev().copied().collect();
        for txn in &losers {
            replay.undo(*txn)?;
            log.append(&LogRecord::Abort { txn: *txn })?;
            debug!(%txn, "loser transaction undone");
        }
        replay.report.losers = losers;
        log.flush(None)?;
    }

    let orphans = mvcc.retain_versions(|_, version| version.state != VersionState::Provisional);
    for (dict, _, version) in &orphans {
        warn!(%dict, lsn = version.lsn.0, writer = %version.writer, "dropping orphaned provisional version");
    }
    replay.report.orphaned_versions = orphans.len();

    let oldest = log.next_lsn();
    for dict in mvcc.dict_ids() {
        replay.report.versions_collected += collect(mvcc, dict, oldest, None)?.versions_removed;
    }
    stats.record_versions_collected(replay.report.versions_collected);

    let report = replay.report;
    info!(
        clean = report.clean_shutdown,
        checkpoint = ?report.checkpoint.map(|lsn| lsn.0),
        scanned = report.records_scanned,
        committed = report.committed,
        aborted = report.aborted,
        losers = report.losers.len(),
        next_lsn = oldest.0,
        "recovery complete"
    );

    Ok(Recovered {
        log,
        catalog: replay.catalog,
        next_txn: TxnId(max_txn + 1),
        checkpoint,
        report,
    })
}
