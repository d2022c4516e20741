//! Log record types and serialization.

use crate::error::{CoreError, CoreResult};
use crate::types::{DictId, IsolationLevel, Lsn, TxnId};

/// Magic bytes identifying a log record.
pub const RECORD_MAGIC: [u8; 4] = *b"RDBL";

/// Magic bytes at the start of every log file.
pub const FILE_MAGIC: [u8; 8] = *b"RDBLOGF\0";

/// Current log format version.
pub const LOG_VERSION: u16 = 1;

/// Record header: magic (4) + version (2) + kind (1) + length (4) + lsn (8).
pub const RECORD_HEADER_SIZE: usize = 19;

/// Record trailer: crc32 (4).
pub const RECORD_CRC_SIZE: usize = 4;

/// File header: magic (8) + version (4) + file id (8) + first lsn (8) + crc32 (4).
pub const FILE_HEADER_SIZE: usize = 32;

/// Kind of log record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogRecordKind {
    /// A transaction began.
    Begin = 1,
    /// A key was written.
    Insert = 2,
    /// A key was deleted.
    Delete = 3,
    /// A transaction committed (for a child: merged into its parent).
    Commit = 4,
    /// A transaction aborted.
    Abort = 5,
    /// A checkpoint started.
    CheckpointBegin = 6,
    /// A checkpoint completed.
    CheckpointEnd = 7,
    /// A dictionary was created or removed.
    FileOp = 8,
}

impl LogRecordKind {
    /// Converts a byte to a record kind.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Begin),
            2 => Some(Self::Insert),
            3 => Some(Self::Delete),
            4 => Some(Self::Commit),
            5 => Some(Self::Abort),
            6 => Some(Self::CheckpointBegin),
            7 => Some(Self::CheckpointEnd),
            8 => Some(Self::FileOp),
            _ => None,
        }
    }

    /// Converts the kind to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A transaction that was live when a checkpoint began.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenTxn {
    /// Transaction id.
    pub txn: TxnId,
    /// Parent, for nested transactions.
    pub parent: Option<TxnId>,
    /// LSN of the transaction's `Begin` record.
    pub begin_lsn: Lsn,
}

/// Dictionary-level file operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOp {
    /// A dictionary was created.
    Create {
        /// Assigned id.
        dict: DictId,
        /// User-visible name.
        name: String,
        /// Name of the key comparator.
        comparator: String,
    },
    /// A dictionary was removed.
    Remove {
        /// Removed id.
        dict: DictId,
    },
}

/// A log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// Begin a transaction.
    Begin {
        /// Transaction ID.
        txn: TxnId,
        /// Parent transaction, for nested transactions.
        parent: Option<TxnId>,
        /// Isolation level.
        isolation: IsolationLevel,
    },

    /// Insert or overwrite a key.
    Insert {
        /// Writing transaction.
        txn: TxnId,
        /// Dictionary written.
        dict: DictId,
        /// Key bytes.
        key: Vec<u8>,
        /// Value bytes.
        value: Vec<u8>,
    },

    /// Delete a key (writes a tombstone).
    Delete {
        /// Writing transaction.
        txn: TxnId,
        /// Dictionary written.
        dict: DictId,
        /// Key bytes.
        key: Vec<u8>,
    },

    /// Commit a transaction.
    Commit {
        /// Transaction ID.
        txn: TxnId,
    },

    /// Abort a transaction.
    Abort {
        /// Transaction ID.
        txn: TxnId,
    },

    /// First half of a checkpoint.
    CheckpointBegin {
        /// Transactions live when the checkpoint began.
        open_txns: Vec<OpenTxn>,
        /// Oldest LSN recovery must scan from if this checkpoint completes.
        oldest_required: Lsn,
    },

    /// Second half of a checkpoint.
    CheckpointEnd {
        /// LSN of the matching `CheckpointBegin`.
        begin_lsn: Lsn,
    },

    /// Dictionary create/remove.
    FileOp(FileOp),
}

impl LogRecord {
    /// Returns the record kind.
    #[must_use]
    pub fn kind(&self) -> LogRecordKind {
        match self {
            Self::Begin { .. } => LogRecordKind::Begin,
            Self::Insert { .. } => LogRecordKind::Insert,
            Self::Delete { .. } => LogRecordKind::Delete,
            Self::Commit { .. } => LogRecordKind::Commit,
            Self::Abort { .. } => LogRecordKind::Abort,
            Self::CheckpointBegin { .. } => LogRecordKind::CheckpointBegin,
            Self::CheckpointEnd { .. } => LogRecordKind::CheckpointEnd,
            Self::FileOp(_) => LogRecordKind::FileOp,
        }
    }

    /// Returns the transaction ID if this record belongs to one.
    #[must_use]
    pub fn txn(&self) -> Option<TxnId> {
        match self {
            Self::Begin { txn, .. }
            | Self::Insert { txn, .. }
            | Self::Delete { txn, .. }
            | Self::Commit { txn }
            | Self::Abort { txn } => Some(*txn),
            Self::CheckpointBegin { .. } | Self::CheckpointEnd { .. } | Self::FileOp(_) => None,
        }
    }

    /// Serializes the record payload (without envelope).
    ///
    /// # Errors
    ///
    /// Returns an error if a key or value does not fit a 32-bit length.
    pub fn encode_payload(&self) -> CoreResult<Vec<u8>> {
        let mut out = PayloadWriter::default();

        match self {
            Self::Begin {
                txn,
                parent,
                isolation,
            } => {
                out.u64(txn.as_u64());
                out.opt_u64(parent.map(TxnId::as_u64));
                out.u8(isolation.as_byte());
            }
            Self::Insert {
                txn,
                dict,
                key,
                value,
            } => {
                out.u64(txn.as_u64());
                out.u32(dict.as_u32());
                out.bytes(key)?;
                out.bytes(value)?;
            }
            Self::Delete { txn, dict, key } => {
                out.u64(txn.as_u64());
                out.u32(dict.as_u32());
                out.bytes(key)?;
            }
            Self::Commit { txn } | Self::Abort { txn } => {
                out.u64(txn.as_u64());
            }
            Self::CheckpointBegin {
                open_txns,
                oldest_required,
            } => {
                out.u64(oldest_required.as_u64());
                out.len(open_txns.len())?;
                for open in open_txns {
                    out.u64(open.txn.as_u64());
                    out.opt_u64(open.parent.map(TxnId::as_u64));
                    out.u64(open.begin_lsn.as_u64());
                }
            }
            Self::CheckpointEnd { begin_lsn } => {
                out.u64(begin_lsn.as_u64());
            }
            Self::FileOp(FileOp::Create {
                dict,
                name,
                comparator,
            }) => {
                out.u8(1);
                out.u32(dict.as_u32());
                out.bytes(name.as_bytes())?;
                out.bytes(comparator.as_bytes())?;
            }
            Self::FileOp(FileOp::Remove { dict }) => {
                out.u8(2);
                out.u32(dict.as_u32());
            }
        }

        Ok(out.finish())
    }

    /// Deserializes a record from its kind and payload.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Corruption`] if the payload is malformed.
    pub fn decode_payload(kind: LogRecordKind, payload: &[u8]) -> CoreResult<Self> {
        let mut input = PayloadReader::new(payload);

        let record = match kind {
            LogRecordKind::Begin => {
                let txn = TxnId(input.u64()?);
                let parent = input.opt_u64()?.map(TxnId);
                let level = input.u8()?;
                let isolation = IsolationLevel::from_byte(level).ok_or_else(|| {
                    CoreError::corruption(format!("unknown isolation level {level}"))
                })?;
                Self::Begin {
                    txn,
                    parent,
                    isolation,
                }
            }
            LogRecordKind::Insert => Self::Insert {
                txn: TxnId(input.u64()?),
                dict: DictId(input.u32()?),
                key: input.bytes()?,
                value: input.bytes()?,
            },
            LogRecordKind::Delete => Self::Delete {
                txn: TxnId(input.u64()?),
                dict: DictId(input.u32()?),
                key: input.bytes()?,
            },
            LogRecordKind::Commit => Self::Commit {
                txn: TxnId(input.u64()?),
            },
            LogRecordKind::Abort => Self::Abort {
                txn: TxnId(input.u64()?),
            },
            LogRecordKind::CheckpointBegin => {
                let oldest_required = Lsn(input.u64()?);
                let count = input.u32()? as usize;
                let mut open_txns = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    open_txns.push(OpenTxn {
                        txn: TxnId(input.u64()?),
                        parent: input.opt_u64()?.map(TxnId),
                        begin_lsn: Lsn(input.u64()?),
                    });
                }
                Self::CheckpointBegin {
                    open_txns,
                    oldest_required,
                }
            }
            LogRecordKind::CheckpointEnd => Self::CheckpointEnd {
                begin_lsn: Lsn(input.u64()?),
            },
            LogRecordKind::FileOp => match input.u8()? {
                1 => {
                    let dict = DictId(input.u32()?);
                    let name = String::from_utf8(input.bytes()?)
                        .map_err(|_| CoreError::corruption("dictionary name is not UTF-8"))?;
                    let comparator = String::from_utf8(input.bytes()?)
                        .map_err(|_| CoreError::corruption("comparator name is not UTF-8"))?;
                    Self::FileOp(FileOp::Create {
                        dict,
                        name,
                        comparator,
                    })
                }
                2 => Self::FileOp(FileOp::Remove {
                    dict: DictId(input.u32()?),
                }),
                other => {
                    return Err(CoreError::corruption(format!("unknown file op {other}")));
                }
            },
        };

        input.expect_end(kind)?;
        Ok(record)
    }
}

#[derive(Default)]
struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn opt_u64(&mut self, v: Option<u64>) {
        match v {
            Some(v) => {
                self.u8(1);
                self.u64(v);
            }
            None => self.u8(0),
        }
    }

    fn len(&mut self, len: usize) -> CoreResult<()> {
        let len = u32::try_from(len)
            .map_err(|_| CoreError::invalid_argument("log payload field exceeds 4 GiB"))?;
        self.u32(len);
        Ok(())
    }

    fn bytes(&mut self, data: &[u8]) -> CoreResult<()> {
        self.len(data.len())?;
        self.buf.extend_from_slice(data);
        Ok(())
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}

struct PayloadReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> CoreResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| CoreError::corruption("unexpected end of log payload"))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> CoreResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> CoreResult<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    fn u64(&mut self) -> CoreResult<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    fn opt_u64(&mut self) -> CoreResult<Option<u64>> {
        match self.u8()? {
            0 => Ok(None),
            1 => Ok(Some(self.u64()?)),
            flag => Err(CoreError::corruption(format!("invalid option flag {flag}"))),
        }
    }

    fn bytes(&mut self) -> CoreResult<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn expect_end(&self, kind: LogRecordKind) -> CoreResult<()> {
        if self.pos != self.data.len() {
            return Err(CoreError::corruption(format!(
                "trailing bytes in {kind:?} record: decoded {} of {} bytes",
                self.pos,
                self.data.len()
            )));
        }
        Ok(())
    }
}

/// Builds the full on-disk envelope for a record.
///
/// # Errors
///
/// Returns an error if the payload cannot be encoded.
pub fn encode_record(lsn: Lsn, record: &LogRecord) -> CoreResult<Vec<u8>> {
    let payload = record.encode_payload()?;
    encode_envelope(lsn, record.kind(), &payload)
}

/// Wraps an already encoded payload in the record envelope.
///
/// # Errors
///
/// Returns an error if the payload does not fit a 32-bit length.
pub fn encode_envelope(lsn: Lsn, kind: LogRecordKind, payload: &[u8]) -> CoreResult<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| CoreError::invalid_argument("log record payload exceeds 4 GiB"))?;

    let mut data = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len() + RECORD_CRC_SIZE);
    data.extend_from_slice(&RECORD_MAGIC);
    data.extend_from_slice(&LOG_VERSION.to_le_bytes());
    data.push(kind.as_byte());
    data.extend_from_slice(&len.to_le_bytes());
    data.extend_from_slice(&lsn.as_u64().to_le_bytes());
    data.extend_from_slice(payload);
    let crc = compute_crc32(&data);
    data.extend_from_slice(&crc.to_le_bytes());
    Ok(data)
}

/// Header written at the start of each log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogFileHeader {
    /// Format version of the file.
    pub version: u32,
    /// Number of the file.
    pub file_id: u64,
    /// LSN of the first record the file holds.
    pub first_lsn: Lsn,
}

impl LogFileHeader {
    /// Encodes the header.
    #[must_use]
    pub fn encode(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut out = [0u8; FILE_HEADER_SIZE];
        out[0..8].copy_from_slice(&FILE_MAGIC);
        out[8..12].copy_from_slice(&self.version.to_le_bytes());
        out[12..20].copy_from_slice(&self.file_id.to_le_bytes());
        out[20..28].copy_from_slice(&self.first_lsn.as_u64().to_le_bytes());
        let crc = compute_crc32(&out[..28]);
        out[28..32].copy_from_slice(&crc.to_le_bytes());
        out
    }

    /// Decodes and validates a header.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Corruption`] on bad magic, checksum or version.
    pub fn decode(raw: &[u8]) -> CoreResult<Self> {
        if raw.len() < FILE_HEADER_SIZE || raw[0..8] != FILE_MAGIC {
            return Err(CoreError::corruption("log file header has bad magic"));
        }
        let field = |range: std::ops::Range<usize>| {
            let mut buf = [0u8; 8];
            buf[..range.len()].copy_from_slice(&raw[range]);
            u64::from_le_bytes(buf)
        };
        let stored = field(28..32) as u32;
        let actual = compute_crc32(&raw[..28]);
        if stored != actual {
            return Err(CoreError::ChecksumMismatch {
                lsn: None,
                expected: stored,
                actual,
            });
        }
        let version = field(8..12) as u32;
        if version > u32::from(LOG_VERSION) {
            return Err(CoreError::corruption(format!(
                "log file format version {version} is newer than supported {LOG_VERSION}"
            )));
        }
        Ok(Self {
            version,
            file_id: field(12..20),
            first_lsn: Lsn(field(20..28)),
        })
    }
}

/// Computes CRC32 checksum for data (IEEE polynomial).
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(record: LogRecord) {
        let payload = record.encode_payload().unwrap();
        let decoded = LogRecord::decode_payload(record.kind(), &payload).unwrap();
        assert_eq!(record, decoded);
    }

    #[test]
    fn records_roundtrip() {
        roundtrip(LogRecord::Begin {
            txn: TxnId(9),
            parent: Some(TxnId(3)),
            isolation: IsolationLevel::Serializable,
        });
        roundtrip(LogRecord::Insert {
            txn: TxnId(9),
            dict: DictId(1),
            key: b"apple".to_vec(),
            value: vec![0xCA, 0xFE],
        });
        roundtrip(LogRecord::CheckpointBegin {
            open_txns: vec![
                OpenTxn {
                    txn: TxnId(4),
                    parent: None,
                    begin_lsn: Lsn(10),
                },
                OpenTxn {
                    txn: TxnId(5),
                    parent: Some(TxnId(4)),
                    begin_lsn: Lsn(12),
                },
            ],
            oldest_required: Lsn(10),
        });
        roundtrip(LogRecord::FileOp(FileOp::Create {
            dict: DictId(7),
            name: "orders".to_string(),
            comparator: "bytewise".to_string(),
        }));
        roundtrip(LogRecord::FileOp(FileOp::Remove { dict: DictId(7) }));
    }

    #[test]
    fn trailing_bytes_are_corruption() {
        let mut payload = LogRecord::Commit { txn: TxnId(1) }
            .encode_payload()
            .unwrap();
        payload.push(0);
        let err = LogRecord::decode_payload(LogRecordKind::Commit, &payload).unwrap_err();
        assert!(matches!(err, CoreError::Corruption { .. }));
    }

    #[test]
    fn short_payload_is_corruption() {
        let payload = LogRecord::Delete {
            txn: TxnId(1),
            dict: DictId(1),
            key: b"k".to_vec(),
        }
        .encode_payload()
        .unwrap();
        let err =
            LogRecord::decode_payload(LogRecordKind::Delete, &payload[..payload.len() - 1])
                .unwrap_err();
        assert!(matches!(err, CoreError::Corruption { .. }));
    }

    #[test]
    fn file_header_roundtrip_and_checksum() {
        let header = LogFileHeader {
            version: 1,
            file_id: 3,
            first_lsn: Lsn(120),
        };
        let mut raw = header.encode();
        assert_eq!(LogFileHeader::decode(&raw).unwrap(), header);

        raw[14] ^= 0xFF;
        assert!(matches!(
            LogFileHeader::decode(&raw),
            Err(CoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }
}
