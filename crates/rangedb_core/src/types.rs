//! Core type definitions for RangeDB.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a transaction.
///
/// Transaction IDs are monotonically increasing and never reused, which is
/// what makes an id a safe handle into the transaction table: a stale id
/// can only ever miss, never alias a newer transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u64);

impl TxnId {
    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// Log sequence number.
///
/// LSNs are assigned by the log writer in append order and totally order
/// every logged event. Snapshots are expressed as LSNs: a snapshot taken at
/// `s` sees exactly the transactions whose commit record has an LSN below `s`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Lsn(pub u64);

impl Lsn {
    /// The LSN before any record.
    pub const ZERO: Self = Self(0);

    /// Creates a new LSN.
    #[must_use]
    pub const fn new(lsn: u64) -> Self {
        Self(lsn)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Returns the following LSN.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lsn:{}", self.0)
    }
}

/// Identifier for a dictionary (one keyed table inside an environment).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DictId(pub u32);

impl DictId {
    /// Creates a new dictionary ID.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for DictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dict:{}", self.0)
    }
}

/// Number of a log file inside the environment's log directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogFileId(pub u64);

impl LogFileId {
    /// Returns the provider name of this log file.
    #[must_use]
    pub fn file_name(self) -> String {
        format!("log/log{:012}.rlog", self.0)
    }

    /// Parses a provider name produced by [`LogFileId::file_name`].
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let stem = name.strip_prefix("log/log")?.strip_suffix(".rlog")?;
        stem.parse().ok().map(Self)
    }
}

impl fmt::Display for LogFileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "log{:012}", self.0)
    }
}

/// Isolation level of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IsolationLevel {
    /// Snapshot reads plus read-range locks, so phantoms are blocked.
    Serializable = 1,
    /// Snapshot fixed at begin, no read locks.
    SnapshotRepeatableRead = 2,
    /// Snapshot re-taken at every statement.
    ReadCommitted = 3,
    /// Sees the newest version of every key, committed or not.
    ReadUncommitted = 4,
}

impl IsolationLevel {
    /// Converts a byte to an isolation level.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Serializable),
            2 => Some(Self::SnapshotRepeatableRead),
            3 => Some(Self::ReadCommitted),
            4 => Some(Self::ReadUncommitted),
            _ => None,
        }
    }

    /// Converts the level to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }

    /// Returns true if the snapshot is fixed for the transaction's lifetime.
    #[must_use]
    pub const fn fixes_snapshot(self) -> bool {
        matches!(self, Self::Serializable | Self::SnapshotRepeatableRead)
    }

    /// Returns true if reads take range locks.
    #[must_use]
    pub const fn locks_reads(self) -> bool {
        matches!(self, Self::Serializable)
    }
}

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TxnState {
    /// Accepting operations.
    Active,
    /// Commit or abort has started consuming the rollback log.
    Preparing,
    /// Committed (for a child: merged into its parent).
    Committed,
    /// Aborted; all effects undone.
    Aborted,
}

impl TxnState {
    /// Returns true for `Committed` and `Aborted`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

/// Mode of a range lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockMode {
    /// Shared lock taken by serializable reads.
    Read,
    /// Exclusive lock taken by writes.
    Write,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "R"),
            Self::Write => write!(f, "W"),
        }
    }
}
