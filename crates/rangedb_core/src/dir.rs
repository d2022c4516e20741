//! Environment directory management.
//!
//! ```text
//! <env_path>/
//! ├─ LOCK                  # advisory lock, held while the environment is open
//! ├─ tree.img              # last checkpoint image
//! ├─ log/log000000000001.rlog
//! ├─ rollback/txn<id>.spill
//! └─ tmp/loader<n>.tmp
//! ```

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";

/// An environment directory held under an exclusive advisory lock.
///
/// Only one `EnvDir` can exist per directory across processes; the lock is
/// released when the value is dropped.
#[derive(Debug)]
pub struct EnvDir {
    path: PathBuf,
    _lock_file: File,
}

impl EnvDir {
    /// Opens (or creates) an environment directory and locks it.
    ///
    /// # Errors
    ///
    /// - [`CoreError::InvalidArgument`] if the directory is missing and
    ///   `create_if_missing` is false, or the path is not a directory
    /// - [`CoreError::EnvironmentLocked`] if another handle holds the lock
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_argument(format!(
                    "environment directory does not exist: {}",
                    path.display()
                )));
            }
        }
        if !path.is_dir() {
            return Err(CoreError::invalid_argument(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::EnvironmentLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Makes renames and removals inside the directory durable.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory cannot be synced.
    #[cfg(unix)]
    pub fn sync(&self) -> CoreResult<()> {
        File::open(&self.path)?.sync_all()?;
        Ok(())
    }

    /// Makes renames and removals inside the directory durable.
    ///
    /// NTFS journals metadata, so there is nothing to do.
    #[cfg(not(unix))]
    pub fn sync(&self) -> CoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn open_creates_directory() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("env");
        let dir = EnvDir::open(&path, true).unwrap();
        assert!(path.is_dir());
        assert!(path.join(LOCK_FILE).exists());
        dir.sync().unwrap();
    }

    #[test]
    fn missing_directory_without_create() {
        let temp = tempdir().unwrap();
        let result = EnvDir::open(&temp.path().join("missing"), false);
        assert!(matches!(result, Err(CoreError::InvalidArgument { .. })));
    }

    #[test]
    fn second_open_is_locked_out() {
        let temp = tempdir().unwrap();
        let _first = EnvDir::open(temp.path(), true).unwrap();
        let second = EnvDir::open(temp.path(), true);
        assert!(matches!(second, Err(CoreError::EnvironmentLocked)));
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempdir().unwrap();
        drop(EnvDir::open(temp.path(), true).unwrap());
        EnvDir::open(temp.path(), true).unwrap();
    }
}
