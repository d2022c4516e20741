//! Log writer with group commit.
//!
//! Appending only assigns an LSN and copies the encoded record into an
//! in-memory pending buffer; that part runs under a short mutex and never
//! touches storage. Writing the buffer out is serialized by a separate flush
//! latch, so one thread flushing writes and syncs the entries of every
//! thread that appended before it. Commits that arrive while a flush is in
//! progress find their LSN durable once they get the latch and return
//! without a second sync.

use crate::error::{CoreError, CoreResult};
use crate::log::reader::LogScan;
use crate::log::record::{encode_envelope, LogFileHeader, LogRecord, FILE_HEADER_SIZE, LOG_VERSION};
use crate::stats::EngineStats;
use crate::types::{LogFileId, Lsn};
use parking_lot::{Mutex, RwLock};
use rangedb_storage::{BackendProvider, StorageBackend};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, warn};

struct PendingWrite {
    file: LogFileId,
    bytes: Vec<u8>,
    last_lsn: Lsn,
}

struct AppendState {
    next_lsn: Lsn,
    current: LogFileId,
    /// Bytes in the current file, buffered ones included.
    current_len: u64,
    pending: Vec<PendingWrite>,
    /// First LSN of every live file.
    files: BTreeMap<LogFileId, Lsn>,
}

struct FlushState {
    file: LogFileId,
    backend: Option<Box<dyn StorageBackend>>,
}

/// Appends records to the numbered log files.
pub struct LogWriter {
    provider: Arc<dyn BackendProvider>,
    file_size_limit: u64,
    append: Mutex<AppendState>,
    flush: Mutex<FlushState>,
    written_lsn: AtomicU64,
    durable_lsn: AtomicU64,
    poison: RwLock<Option<String>>,
    stats: Arc<EngineStats>,
}

impl LogWriter {
    /// Opens the writer after a scan of the existing log.
    ///
    /// A torn tail found by the scan is truncated away, and appends continue
    /// in the newest file. An empty log starts file 1 at LSN 1.
    ///
    /// # Errors
    ///
    /// Returns an error if the newest file cannot be repaired.
    pub fn open(
        provider: Arc<dyn BackendProvider>,
        file_size_limit: u64,
        scan: &LogScan,
        stats: Arc<EngineStats>,
    ) -> CoreResult<Self> {
        let next_lsn = scan.next_lsn();
        let mut files = BTreeMap::new();
        let mut pending = Vec::new();
        let mut backend = None;

        for info in &scan.files {
            if let Some(first) = info.first_lsn {
                files.insert(info.id, first);
            }
        }

        let (current, current_len) = match scan.files.last() {
            Some(last) if last.first_lsn.is_some() => {
                let mut handle = provider.open(&last.id.file_name())?;
                if let Some(torn) = &scan.torn_tail {
                    warn!(
                        file = %torn.file,
                        valid_len = torn.valid_len,
                        reason = %torn.reason,
                        "truncating torn log tail"
                    );
                    handle.truncate(torn.valid_len)?;
                    handle.sync()?;
                }
                backend = Some(handle);
                (last.id, last.valid_len)
            }
            newest => {
                // No files, or the newest header never made it to storage.
                let id = match newest {
                    Some(last) => {
                        warn!(file = %last.id, "replacing log file with torn header");
                        provider.remove(&last.id.file_name())?;
                        last.id
                    }
                    None => LogFileId(1),
                };
                files.insert(id, next_lsn);
                pending.push(PendingWrite {
                    file: id,
                    bytes: file_header(id, next_lsn).to_vec(),
                    last_lsn: Lsn(next_lsn.0.saturating_sub(1)),
                });
                (id, FILE_HEADER_SIZE as u64)
            }
        };

        let last = next_lsn.0.saturating_sub(1);
        debug!(file = %current, next_lsn = next_lsn.0, "log writer opened");

        Ok(Self {
            provider,
            file_size_limit: file_size_limit.max(FILE_HEADER_SIZE as u64 + 1),
            append: Mutex::new(AppendState {
                next_lsn,
                current,
                current_len,
                pending,
                files,
            }),
            flush: Mutex::new(FlushState {
                file: current,
                backend,
            }),
            written_lsn: AtomicU64::new(last),
            durable_lsn: AtomicU64::new(last),
            poison: RwLock::new(None),
            stats,
        })
    }

    /// Returns the poison reason if an earlier log failure panicked the
    /// environment.
    #[must_use]
    pub fn poisoned(&self) -> Option<String> {
        self.poison.read().clone()
    }

    /// Fails with [`CoreError::EnvironmentPanicked`] if poisoned.
    ///
    /// # Errors
    ///
    /// See above.
    pub fn check(&self) -> CoreResult<()> {
        match self.poison.read().as_ref() {
            Some(reason) => Err(CoreError::panicked(reason.clone())),
            None => Ok(()),
        }
    }

    /// Marks the environment panicked. The first reason wins.
    pub fn set_poison(&self, reason: impl Into<String>) {
        let mut poison = self.poison.write();
        if poison.is_none() {
            let reason = reason.into();
            error!(%reason, "environment panicked");
            *poison = Some(reason);
        }
    }

    /// Appends a record and returns its LSN.
    ///
    /// The record is durable only after a [`LogWriter::flush`] covering it.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::EnvironmentPanicked`] after an earlier fatal
    /// failure.
    pub fn append(&self, record: &LogRecord) -> CoreResult<Lsn> {
        let payload = record.encode_payload()?;
        let kind = record.kind();
        self.check()?;

        let mut state = self.append.lock();
        let lsn = state.next_lsn;
        let bytes = encode_envelope(lsn, kind, &payload)?;
        let len = bytes.len() as u64;

        if state.current_len > FILE_HEADER_SIZE as u64
            && state.current_len + len > self.file_size_limit
        {
            let next = LogFileId(state.current.0 + 1);
            debug!(from = %state.current, to = %next, first_lsn = lsn.0, "log file rollover");
            state.pending.push(PendingWrite {
                file: next,
                bytes: file_header(next, lsn).to_vec(),
                last_lsn: Lsn(lsn.0 - 1),
            });
            state.files.insert(next, lsn);
            state.current = next;
            state.current_len = FILE_HEADER_SIZE as u64;
        }

        let current = state.current;
        match state.pending.last_mut() {
            Some(last) if last.file == current => {
                last.bytes.extend_from_slice(&bytes);
                last.last_lsn = lsn;
            }
            _ => state.pending.push(PendingWrite {
                file: current,
                bytes,
                last_lsn: lsn,
            }),
        }
        state.current_len += len;
        state.next_lsn = lsn.next();
        drop(state);

        self.stats.record_log_append(len);
        Ok(lsn)
    }

    /// Returns the LSN the next append will get.
    #[must_use]
    pub fn next_lsn(&self) -> Lsn {
        self.append.lock().next_lsn
    }

    /// Returns the highest LSN known durable.
    #[must_use]
    pub fn durable_lsn(&self) -> Lsn {
        Lsn(self.durable_lsn.load(Ordering::Acquire))
    }

    /// Makes every record up to `upto` durable (everything appended so far
    /// if `None`).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LogIo`] if writing or syncing fails; the
    /// environment is panicked from then on.
    pub fn flush(&self, upto: Option<Lsn>) -> CoreResult<()> {
        self.check()?;
        let target = match upto {
            Some(lsn) => lsn,
            None => Lsn(self.next_lsn().0 - 1),
        };
        if self.durable_lsn() >= target {
            return Ok(());
        }

        let mut flush = self.flush.lock();
        if self.durable_lsn() >= target {
            // Another thread's flush covered us.
            return Ok(());
        }
        self.write_out(&mut flush, true)
    }

    /// Writes buffered records to storage without syncing.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::LogIo`] if writing fails.
    pub fn write_buffered(&self) -> CoreResult<()> {
        self.check()?;
        let mut flush = self.flush.lock();
        self.write_out(&mut flush, false)
    }

    fn write_out(&self, flush: &mut FlushState, sync: bool) -> CoreResult<()> {
        let batch = std::mem::take(&mut self.append.lock().pending);
        match self.write_batch(flush, batch, sync) {
            Ok(()) => Ok(()),
            Err(err) => {
                let message = err.to_string();
                self.set_poison(format!("log write failed: {message}"));
                Err(CoreError::log_io(message))
            }
        }
    }

    fn write_batch(
        &self,
        flush: &mut FlushState,
        batch: Vec<PendingWrite>,
        sync: bool,
    ) -> CoreResult<()> {
        let mut last = None;
        for write in batch {
            if flush.file != write.file || flush.backend.is_none() {
                if let Some(old) = flush.backend.as_mut() {
                    old.sync()?;
                }
                flush.backend = Some(self.provider.open(&write.file.file_name())?);
                flush.file = write.file;
            }
            if let Some(backend) = flush.backend.as_mut() {
                backend.append(&write.bytes)?;
            }
            last = Some(write.last_lsn);
        }

        if let Some(lsn) = last {
            self.written_lsn.fetch_max(lsn.0, Ordering::AcqRel);
        }
        if sync {
            if let Some(backend) = flush.backend.as_mut() {
                backend.sync()?;
            }
            self.stats.record_log_sync();
            let written = self.written_lsn.load(Ordering::Acquire);
            self.durable_lsn.fetch_max(written, Ordering::AcqRel);
        }
        Ok(())
    }

    /// Returns `(file, first LSN)` for every live file, oldest first.
    #[must_use]
    pub fn files(&self) -> Vec<(LogFileId, Lsn)> {
        self.append
            .lock()
            .files
            .iter()
            .map(|(id, lsn)| (*id, *lsn))
            .collect()
    }

    /// Returns the files whose every record has an LSN below `cutoff`.
    ///
    /// The file currently being written, and any file with records still
    /// buffered, are never returned.
    #[must_use]
    pub fn archivable(&self, cutoff: Lsn) -> Vec<LogFileId> {
        let flush = self.flush.lock();
        let state = self.append.lock();
        let limit = flush.file.min(state.current);
        let ids: Vec<(LogFileId, Lsn)> = state.files.iter().map(|(id, lsn)| (*id, *lsn)).collect();
        ids.windows(2)
            .filter(|pair| pair[0].0 < limit && pair[1].1 <= cutoff)
            .map(|pair| pair[0].0)
            .collect()
    }

    /// Deletes archived files.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be removed; files removed before
    /// the failure stay removed.
    pub fn remove_files(&self, ids: &[LogFileId]) -> CoreResult<()> {
        let _flush = self.flush.lock();
        for id in ids {
            let current = self.append.lock().current;
            if *id >= current {
                return Err(CoreError::invalid_operation(format!(
                    "refusing to remove live log file {id}"
                )));
            }
            self.provider.remove(&id.file_name())?;
            self.append.lock().files.remove(id);
            debug!(file = %id, "log file removed");
        }
        Ok(())
    }
}

fn file_header(id: LogFileId, first_lsn: Lsn) -> [u8; FILE_HEADER_SIZE] {
    LogFileHeader {
        version: u32::from(LOG_VERSION),
        file_id: id.0,
        first_lsn,
    }
    .encode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::reader::LogReader;
    use crate::types::{DictId, TxnId};
    use rangedb_storage::MemoryProvider;
    use std::thread;

    fn open(provider: &MemoryProvider, limit: u64) -> LogWriter {
        let provider: Arc<dyn BackendProvider> = Arc::new(provider.clone());
        let scan = LogReader::open(Arc::clone(&provider))
            .unwrap()
            .scan()
            .unwrap();
        LogWriter::open(provider, limit, &scan, Arc::new(EngineStats::new())).unwrap()
    }

    fn scan(provider: &MemoryProvider) -> LogScan {
        LogReader::open(Arc::new(provider.clone()))
            .unwrap()
            .scan()
            .unwrap()
    }

    fn insert(n: u64) -> LogRecord {
        LogRecord::Insert {
            txn: TxnId(1),
            dict: DictId(1),
            key: n.to_be_bytes().to_vec(),
            value: vec![0u8; 64],
        }
    }

    #[test]
    fn lsns_are_sequential_from_one() {
        let provider = MemoryProvider::new();
        let log = open(&provider, 1 << 20);
        assert_eq!(log.append(&insert(1)).unwrap(), Lsn(1));
        assert_eq!(log.append(&insert(2)).unwrap(), Lsn(2));
        assert_eq!(log.durable_lsn(), Lsn(0));
        log.flush(None).unwrap();
        assert_eq!(log.durable_lsn(), Lsn(2));
        assert_eq!(scan(&provider).entries.len(), 2);
    }

    #[test]
    fn unflushed_records_are_not_on_storage() {
        let provider = MemoryProvider::new();
        let log = open(&provider, 1 << 20);
        log.append(&insert(1)).unwrap();
        log.flush(None).unwrap();
        log.append(&insert(2)).unwrap();
        assert_eq!(scan(&provider).entries.len(), 1);
    }

    #[test]
    fn rollover_starts_new_files() {
        let provider = MemoryProvider::new();
        let log = open(&provider, 512);
        for n in 0..20 {
            log.append(&insert(n)).unwrap();
        }
        log.flush(None).unwrap();

        let scanned = scan(&provider);
        assert!(scanned.files.len() > 1);
        assert_eq!(scanned.entries.len(), 20);
        assert_eq!(log.files().len(), scanned.files.len());
    }

    #[test]
    fn reopen_continues_the_sequence() {
        let provider = MemoryProvider::new();
        {
            let log = open(&provider, 1 << 20);
            log.append(&insert(1)).unwrap();
            log.append(&insert(2)).unwrap();
            log.flush(None).unwrap();
        }
        let log = open(&provider, 1 << 20);
        assert_eq!(log.append(&insert(3)).unwrap(), Lsn(3));
        log.flush(None).unwrap();
        assert_eq!(scan(&provider).entries.len(), 3);
    }

    #[test]
    fn reopen_truncates_torn_tail() {
        let provider = MemoryProvider::new();
        {
            let log = open(&provider, 1 << 20);
            log.append(&insert(1)).unwrap();
            log.append(&insert(2)).unwrap();
            log.flush(None).unwrap();
        }
        let name = LogFileId(1).file_name();
        let mut backend = provider.open(&name).unwrap();
        let size = backend.size().unwrap();
        backend.truncate(size - 5).unwrap();

        let log = open(&provider, 1 << 20);
        assert_eq!(log.append(&insert(9)).unwrap(), Lsn(2));
        log.flush(None).unwrap();

        let scanned = scan(&provider);
        assert!(scanned.torn_tail.is_none());
        assert_eq!(scanned.entries.len(), 2);
    }

    #[test]
    fn archivable_excludes_current_file() {
        let provider = MemoryProvider::new();
        let log = open(&provider, 400);
        for n in 0..30 {
            log.append(&insert(n)).unwrap();
        }
        log.flush(None).unwrap();

        let files = log.files();
        assert!(files.len() >= 3);
        assert!(log.archivable(Lsn(1)).is_empty());

        let everything = log.archivable(Lsn(u64::MAX));
        assert_eq!(everything.len(), files.len() - 1);

        log.remove_files(&everything).unwrap();
        assert_eq!(log.files().len(), 1);
        let scanned = scan(&provider);
        assert_eq!(scanned.files.len(), 1);
        assert!(log.remove_files(&[files[files.len() - 1].0]).is_err());
    }

    #[test]
    fn group_commit_from_many_threads() {
        let provider = MemoryProvider::new();
        let log = Arc::new(open(&provider, 1 << 20));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let log = Arc::clone(&log);
                thread::spawn(move || {
                    for n in 0..50 {
                        let lsn = log.append(&insert(t * 100 + n)).unwrap();
                        log.flush(Some(lsn)).unwrap();
                        assert!(log.durable_lsn() >= lsn);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(scan(&provider).entries.len(), 400);
    }

    #[test]
    fn poisoned_writer_rejects_everything() {
        let provider = MemoryProvider::new();
        let log = open(&provider, 1 << 20);
        log.set_poison("disk vanished");
        assert!(matches!(
            log.append(&insert(1)),
            Err(CoreError::EnvironmentPanicked { .. })
        ));
        assert!(log.flush(None).is_err());
    }
}
