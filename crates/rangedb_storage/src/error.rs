//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(io::Error),

    /// The device ran out of space.
    ///
    /// Kept apart from [`StorageError::Io`] so callers can unwind partial
    /// work instead of treating the failure as fatal.
    #[error("out of space: {0}")]
    OutOfSpace(io::Error),

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// A named backend does not exist.
    #[error("no such backend: {0}")]
    NotFound(String),

    /// The storage is closed.
    #[error("storage is closed")]
    Closed,
}

impl StorageError {
    /// Returns true if this error reports exhausted storage space.
    #[must_use]
    pub fn is_out_of_space(&self) -> bool {
        matches!(self, Self::OutOfSpace(_))
    }
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::StorageFull {
            Self::OutOfSpace(err)
        } else {
            Self::Io(err)
        }
    }
}
