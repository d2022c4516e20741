//! Reading log files back.
//!
//! Records are streamed out of each file through a fixed read buffer. Damage
//! is handled differently depending on where it is found: the newest file
//! may end in a partially written record (a crash during append), which is
//! reported as a torn tail and cut off; damage in any older file means data
//! that was once durable is gone and is reported as corruption.

use crate::error::{CoreError, CoreResult};
use crate::log::record::{
    compute_crc32, LogFileHeader, LogRecord, LogRecordKind, FILE_HEADER_SIZE, LOG_VERSION,
    RECORD_CRC_SIZE, RECORD_HEADER_SIZE, RECORD_MAGIC,
};
use crate::types::{LogFileId, Lsn};
use rangedb_storage::{BackendProvider, StorageBackend};
use std::sync::Arc;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// A decoded record with its position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// LSN of the record.
    pub lsn: Lsn,
    /// File holding the record.
    pub file: LogFileId,
    /// Byte offset of the record inside its file.
    pub offset: u64,
    /// The record.
    pub record: LogRecord,
}

/// A partially written record found at the end of the newest file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TornTail {
    /// File holding the damage.
    pub file: LogFileId,
    /// Length of the valid prefix.
    pub valid_len: u64,
    /// What was wrong with the record at `valid_len`.
    pub reason: String,
}

/// Streaming iterator over the records of one log file.
pub struct LogFileIter {
    backend: Box<dyn StorageBackend>,
    file: LogFileId,
    header: Option<LogFileHeader>,
    strict: bool,
    total_size: u64,
    offset: u64,
    expected_lsn: Lsn,
    buffer: Vec<u8>,
    buffer_start: u64,
    torn: Option<TornTail>,
    finished: bool,
}

impl LogFileIter {
    /// Opens a file for iteration.
    ///
    /// With `strict` set, any damage is an error. Otherwise damage ends the
    /// iteration and is reported by [`LogFileIter::torn_tail`].
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read, or (in strict mode)
    /// if the file header is damaged.
    pub fn new(backend: Box<dyn StorageBackend>, file: LogFileId, strict: bool) -> CoreResult<Self> {
        let total_size = backend.size()?;
        let mut iter = Self {
            backend,
            file,
            header: None,
            strict,
            total_size,
            offset: FILE_HEADER_SIZE as u64,
            expected_lsn: Lsn::ZERO,
            buffer: Vec::new(),
            buffer_start: 0,
            torn: None,
            finished: false,
        };

        if total_size < FILE_HEADER_SIZE as u64 {
            iter.damage(0, "log file header is incomplete".to_string())?;
            return Ok(iter);
        }

        let raw = iter.backend.read_at(0, FILE_HEADER_SIZE)?;
        match LogFileHeader::decode(&raw) {
            Ok(header) if header.file_id == file.0 => {
                iter.expected_lsn = header.first_lsn;
                iter.header = Some(header);
            }
            Ok(header) => {
                iter.damage(
                    0,
                    format!("header names file {} but file is {file}", header.file_id),
                )?;
            }
            Err(err) => iter.damage(0, err.to_string())?,
        }
        Ok(iter)
    }

    /// Returns the decoded file header, if it was intact.
    #[must_use]
    pub fn header(&self) -> Option<LogFileHeader> {
        self.header
    }

    /// Returns the torn tail found so far, if any.
    #[must_use]
    pub fn torn_tail(&self) -> Option<&TornTail> {
        self.torn.as_ref()
    }

    /// Offset just past the last valid record read so far.
    #[must_use]
    pub fn valid_len(&self) -> u64 {
        self.torn
            .as_ref()
            .map_or(self.offset, |torn| torn.valid_len)
    }

    /// LSN the next record in this file must carry.
    #[must_use]
    pub fn expected_lsn(&self) -> Lsn {
        self.expected_lsn
    }

    fn damage(&mut self, at: u64, reason: String) -> CoreResult<()> {
        self.finished = true;
        if self.strict {
            return Err(CoreError::corruption(format!(
                "{} at offset {at}: {reason}",
                self.file
            )));
        }
        self.torn = Some(TornTail {
            file: self.file,
            valid_len: at,
            reason,
        });
        Ok(())
    }

    /// Returns `len` bytes starting at `offset`, or `None` past end of file.
    fn bytes_at(&mut self, offset: u64, len: usize) -> CoreResult<Option<&[u8]>> {
        if offset + len as u64 > self.total_size {
            return Ok(None);
        }
        let buffered_end = self.buffer_start + self.buffer.len() as u64;
        if offset < self.buffer_start || offset + len as u64 > buffered_end {
            let want = len.max(READ_BUFFER_SIZE) as u64;
            let read_len = want.min(self.total_size - offset) as usize;
            self.buffer = self.backend.read_at(offset, read_len)?;
            self.buffer_start = offset;
        }
        let start = (offset - self.buffer_start) as usize;
        Ok(Some(&self.buffer[start..start + len]))
    }

    fn read_next(&mut self) -> CoreResult<Option<LogEntry>> {
        if self.finished {
            return Ok(None);
        }
        let start = self.offset;
        if start == self.total_size {
            self.finished = true;
            return Ok(None);
        }

        let Some(header) = self.bytes_at(start, RECORD_HEADER_SIZE)? else {
            self.damage(start, "incomplete record header".to_string())?;
            return Ok(None);
        };
        let magic_ok = header[0..4] == RECORD_MAGIC;
        let version = u16::from_le_bytes([header[4], header[5]]);
        let kind_byte = header[6];
        let payload_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;
        let mut raw_lsn = [0u8; 8];
        raw_lsn.copy_from_slice(&header[11..19]);
        let lsn = Lsn(u64::from_le_bytes(raw_lsn));

        if !magic_ok {
            self.damage(start, "invalid record magic".to_string())?;
            return Ok(None);
        }
        if version > LOG_VERSION {
            self.damage(start, format!("unsupported record version {version}"))?;
            return Ok(None);
        }
        let Some(kind) = LogRecordKind::from_byte(kind_byte) else {
            self.damage(start, format!("unknown record kind {kind_byte}"))?;
            return Ok(None);
        };

        let total_len = RECORD_HEADER_SIZE + payload_len + RECORD_CRC_SIZE;
        let Some(full) = self.bytes_at(start, total_len)? else {
            self.damage(start, "incomplete record body".to_string())?;
            return Ok(None);
        };
        let body_end = RECORD_HEADER_SIZE + payload_len;
        let mut raw_crc = [0u8; 4];
        raw_crc.copy_from_slice(&full[body_end..]);
        let stored = u32::from_le_bytes(raw_crc);
        let actual = compute_crc32(&full[..body_end]);
        if stored != actual {
            if self.strict {
                self.finished = true;
                return Err(CoreError::ChecksumMismatch {
                    lsn: Some(lsn),
                    expected: stored,
                    actual,
                });
            }
            self.damage(start, format!("checksum mismatch for {lsn}"))?;
            return Ok(None);
        }

        let payload = full[RECORD_HEADER_SIZE..body_end].to_vec();
        if lsn != self.expected_lsn {
            self.damage(
                start,
                format!("expected {} but record carries {lsn}", self.expected_lsn),
            )?;
            return Ok(None);
        }
        let record = match LogRecord::decode_payload(kind, &payload) {
            Ok(record) => record,
            Err(err) => {
                self.damage(start, err.to_string())?;
                return Ok(None);
            }
        };

        self.offset = start + total_len as u64;
        self.expected_lsn = lsn.next();
        Ok(Some(LogEntry {
            lsn,
            file: self.file,
            offset: start,
            record,
        }))
    }
}

impl Iterator for LogFileIter {
    type Item = CoreResult<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_next() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}

/// Summary of one scanned file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFileInfo {
    /// File number.
    pub id: LogFileId,
    /// LSN of the first record the file is meant to hold; `None` if the
    /// header itself was torn.
    pub first_lsn: Option<Lsn>,
    /// LSN of the last valid record, if the file holds any.
    pub last_lsn: Option<Lsn>,
    /// Length of the valid prefix in bytes.
    pub valid_len: u64,
}

/// Result of scanning the whole log.
#[derive(Debug, Default)]
pub struct LogScan {
    /// Every valid record, in LSN order.
    pub entries: Vec<LogEntry>,
    /// Per-file summaries, oldest first.
    pub files: Vec<LogFileInfo>,
    /// Damage cut off the end of the newest file.
    pub torn_tail: Option<TornTail>,
}

impl LogScan {
    /// LSN the next appended record gets.
    #[must_use]
    pub fn next_lsn(&self) -> Lsn {
        self.entries
            .last()
            .map(|entry| entry.lsn.next())
            .or_else(|| self.files.iter().rev().find_map(|f| f.first_lsn))
            .unwrap_or(Lsn(1))
    }

    /// Returns the records with LSN at or after `from`.
    pub fn entries_from(&self, from: Lsn) -> &[LogEntry] {
        let start = self.entries.partition_point(|entry| entry.lsn < from);
        &self.entries[start..]
    }
}

/// Reads the log files of an environment.
pub struct LogReader {
    provider: Arc<dyn BackendProvider>,
    files: Vec<LogFileId>,
}

impl LogReader {
    /// Lists the log files held by `provider`.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing fails.
    pub fn open(provider: Arc<dyn BackendProvider>) -> CoreResult<Self> {
        let mut files: Vec<LogFileId> = provider
            .list("log/")?
            .iter()
            .filter_map(|name| LogFileId::parse(name))
            .collect();
        files.sort_unstable();
        Ok(Self { provider, files })
    }

    /// Returns the file numbers, oldest first.
    #[must_use]
    pub fn file_ids(&self) -> &[LogFileId] {
        &self.files
    }

    /// Opens an iterator over one file.
    ///
    /// Every file but the newest is read strictly.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn iter_file(&self, id: LogFileId) -> CoreResult<LogFileIter> {
        let strict = self.files.last() != Some(&id);
        LogFileIter::new(self.provider.open(&id.file_name())?, id, strict)
    }

    /// Reads every file.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Corruption`] if an older file is damaged or the
    /// files do not continue each other's LSN sequence.
    pub fn scan(&self) -> CoreResult<LogScan> {
        let mut scan = LogScan::default();
        for &id in &self.files {
            let mut iter = self.iter_file(id)?;
            if let (Some(header), Some(last)) = (iter.header(), scan.entries.last()) {
                if header.first_lsn != last.lsn.next() {
                    return Err(CoreError::corruption(format!(
                        "{id} starts at {} but the previous file ends at {}",
                        header.first_lsn, last.lsn
                    )));
                }
            }
            let first_lsn = iter.header().map(|h| h.first_lsn);
            let mut last_lsn = None;
            for entry in iter.by_ref() {
                let entry = entry?;
                last_lsn = Some(entry.lsn);
                scan.entries.push(entry);
            }
            scan.files.push(LogFileInfo {
                id,
                first_lsn,
                last_lsn,
                valid_len: iter.valid_len(),
            });
            scan.torn_tail = iter.torn_tail().cloned();
        }
        Ok(scan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::record::{encode_record, LOG_VERSION};
    use crate::types::{DictId, TxnId};
    use rangedb_storage::MemoryProvider;

    fn write_file(provider: &MemoryProvider, id: u64, first: u64, records: &[LogRecord]) -> u64 {
        let mut backend = provider.open(&LogFileId(id).file_name()).unwrap();
        let header = LogFileHeader {
            version: u32::from(LOG_VERSION),
            file_id: id,
            first_lsn: Lsn(first),
        };
        backend.append(&header.encode()).unwrap();
        for (i, record) in records.iter().enumerate() {
            backend
                .append(&encode_record(Lsn(first + i as u64), record).unwrap())
                .unwrap();
        }
        backend.size().unwrap()
    }

    fn insert(txn: u64, key: &[u8]) -> LogRecord {
        LogRecord::Insert {
            txn: TxnId(txn),
            dict: DictId(1),
            key: key.to_vec(),
            value: b"v".to_vec(),
        }
    }

    #[test]
    fn empty_log_starts_at_one() {
        let provider = Arc::new(MemoryProvider::new());
        let scan = LogReader::open(provider).unwrap().scan().unwrap();
        assert!(scan.entries.is_empty());
        assert_eq!(scan.next_lsn(), Lsn(1));
    }

    #[test]
    fn scans_across_files_in_order() {
        let provider = MemoryProvider::new();
        write_file(&provider, 1, 1, &[insert(1, b"a"), insert(1, b"b")]);
        write_file(&provider, 2, 3, &[LogRecord::Commit { txn: TxnId(1) }]);

        let scan = LogReader::open(Arc::new(provider)).unwrap().scan().unwrap();
        let lsns: Vec<_> = scan.entries.iter().map(|e| e.lsn.0).collect();
        assert_eq!(lsns, vec![1, 2, 3]);
        assert_eq!(scan.files.len(), 2);
        assert_eq!(scan.files[0].last_lsn, Some(Lsn(2)));
        assert_eq!(scan.next_lsn(), Lsn(4));
        assert_eq!(scan.entries_from(Lsn(2)).len(), 2);
    }

    #[test]
    fn torn_tail_in_newest_file_is_cut() {
        let provider = MemoryProvider::new();
        let len = write_file(&provider, 1, 1, &[insert(1, b"a"), insert(1, b"b")]);
        let mut backend = provider.open(&LogFileId(1).file_name()).unwrap();
        backend.truncate(len - 3).unwrap();

        let scan = LogReader::open(Arc::new(provider)).unwrap().scan().unwrap();
        assert_eq!(scan.entries.len(), 1);
        let torn = scan.torn_tail.unwrap();
        assert_eq!(torn.file, LogFileId(1));
        assert_eq!(torn.valid_len, scan.files[0].valid_len);
    }

    #[test]
    fn damage_in_older_file_is_corruption() {
        let provider = MemoryProvider::new();
        write_file(&provider, 1, 1, &[insert(1, b"a"), insert(1, b"b")]);
        write_file(&provider, 2, 3, &[insert(1, b"c")]);
        provider
            .backend(&LogFileId(1).file_name())
            .unwrap()
            .poke(FILE_HEADER_SIZE + RECORD_HEADER_SIZE + 2, 0xAA);

        let result = LogReader::open(Arc::new(provider)).unwrap().scan();
        assert!(matches!(result, Err(CoreError::ChecksumMismatch { .. })));
    }

    #[test]
    fn lsn_gap_between_files_is_corruption() {
        let provider = MemoryProvider::new();
        write_file(&provider, 1, 1, &[insert(1, b"a")]);
        write_file(&provider, 2, 5, &[insert(1, b"b")]);

        let result = LogReader::open(Arc::new(provider)).unwrap().scan();
        assert!(matches!(result, Err(CoreError::Corruption { .. })));
    }

    #[test]
    fn large_records_span_the_read_buffer() {
        let provider = MemoryProvider::new();
        let big = LogRecord::Insert {
            txn: TxnId(1),
            dict: DictId(1),
            key: b"big".to_vec(),
            value: vec![7u8; READ_BUFFER_SIZE * 2],
        };
        write_file(&provider, 1, 1, &[insert(1, b"a"), big.clone(), insert(1, b"z")]);

        let scan = LogReader::open(Arc::new(provider)).unwrap().scan().unwrap();
        assert_eq!(scan.entries.len(), 3);
        assert_eq!(scan.entries[1].record, big);
    }
}
