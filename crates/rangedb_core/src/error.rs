//! Error types for RangeDB core.

use crate::types::{DictId, Lsn, TxnId};
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in RangeDB core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A non-blocking lock request conflicted with another transaction.
    #[error("lock not granted to {txn} on {dict}")]
    LockNotGranted {
        /// Requesting transaction.
        txn: TxnId,
        /// Dictionary of the requested range.
        dict: DictId,
    },

    /// Waiting for the lock would close a cycle; the caller is the victim.
    #[error("deadlock: {txn} chosen as victim")]
    Deadlock {
        /// The rejected transaction.
        txn: TxnId,
    },

    /// The lock wait exceeded the configured timeout.
    #[error("lock wait timed out for {txn} on {dict}")]
    LockTimeout {
        /// Requesting transaction.
        txn: TxnId,
        /// Dictionary of the requested range.
        dict: DictId,
    },

    /// Key does not exist.
    #[error("key not found in {dict}")]
    KeyNotFound {
        /// Dictionary searched.
        dict: DictId,
    },

    /// Key already exists and overwrite was not allowed.
    #[error("key already exists in {dict}")]
    KeyExists {
        /// Dictionary written.
        dict: DictId,
    },

    /// Appending to or flushing the log failed. Fatal to the environment.
    #[error("log I/O error: {message}")]
    LogIo {
        /// Description of the failure.
        message: String,
    },

    /// The device ran out of space.
    #[error("out of space: {message}")]
    OutOfSpace {
        /// Description of the failure.
        message: String,
    },

    /// Persisted data is corrupt.
    #[error("corruption: {message}")]
    Corruption {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch detected.
    #[error("checksum mismatch at {lsn:?}: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// LSN of the record, if it could be decoded.
        lsn: Option<Lsn>,
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// A previous fatal error poisoned the environment.
    #[error("environment panicked: {reason}")]
    EnvironmentPanicked {
        /// The fatal error that poisoned the environment.
        reason: String,
    },

    /// No transaction with this id is live.
    #[error("transaction not found: {txn}")]
    TransactionNotFound {
        /// The missing transaction.
        txn: TxnId,
    },

    /// Dictionary does not exist.
    #[error("dictionary not found: {name}")]
    DictionaryNotFound {
        /// Name or id of the dictionary.
        name: String,
    },

    /// Another process holds the environment lock.
    #[error("environment locked: another process has exclusive access")]
    EnvironmentLocked,

    /// Operation not permitted in the current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why the operation is invalid.
        message: String,
    },

    /// Invalid argument provided.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid argument.
        message: String,
    },

    /// Checkpoint image encoding or decoding failed.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// Storage backend error.
    #[error("storage error: {0}")]
    Storage(rangedb_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<rangedb_storage::StorageError> for CoreError {
    fn from(err: rangedb_storage::StorageError) -> Self {
        if err.is_out_of_space() {
            Self::OutOfSpace {
                message: err.to_string(),
            }
        } else {
            Self::Storage(err)
        }
    }
}

impl CoreError {
    /// Creates a corruption error.
    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption {
            message: message.into(),
        }
    }

    /// Creates a log I/O error.
    pub fn log_io(message: impl Into<String>) -> Self {
        Self::LogIo {
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates a panicked-environment error.
    pub fn panicked(reason: impl Into<String>) -> Self {
        Self::EnvironmentPanicked {
            reason: reason.into(),
        }
    }

    /// Returns true for errors raised by the lock manager.
    ///
    /// A transaction that receives one of these is still intact and can be
    /// aborted (or retried after the conflicting transaction finishes).
    #[must_use]
    pub fn is_lock_error(&self) -> bool {
        matches!(
            self,
            Self::LockNotGranted { .. } | Self::Deadlock { .. } | Self::LockTimeout { .. }
        )
    }

    /// Returns true for errors after which the environment cannot continue.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::LogIo { .. } | Self::EnvironmentPanicked { .. })
    }

    /// Returns true if the error reports exhausted storage space.
    #[must_use]
    pub fn is_out_of_space(&self) -> bool {
        matches!(self, Self::OutOfSpace { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rangedb_storage::StorageError;

    #[test]
    fn out_of_space_stays_distinguishable() {
        let storage: StorageError =
            io::Error::new(io::ErrorKind::StorageFull, "no space left").into();
        let err: CoreError = storage.into();
        assert!(err.is_out_of_space());
        assert!(!err.is_fatal());
    }

    #[test]
    fn classification() {
        assert!(CoreError::Deadlock { txn: TxnId(1) }.is_lock_error());
        assert!(CoreError::log_io("disk gone").is_fatal());
        assert!(CoreError::panicked("earlier failure").is_fatal());
        assert!(!CoreError::KeyNotFound { dict: DictId(1) }.is_lock_error());
    }
}
