//! Named backend providers.
//!
//! The engine keeps several families of files in one environment: numbered
//! log files, per-transaction rollback spill files, loader temporaries and
//! the checkpoint image. A provider maps a slash-separated name such as
//! `log/log000000000003.rlog` to a backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::file::FileBackend;
use crate::memory::InMemoryBackend;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Hands out named storage backends.
///
/// # Invariants
///
/// - `open` creates the backend if it does not exist yet
/// - two `open` calls for the same name observe the same bytes
/// - `rename` replaces the destination atomically
pub trait BackendProvider: Send + Sync {
    /// Opens (creating if needed) the backend with the given name.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be created or opened.
    fn open(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>>;

    /// Returns true if a backend with this name exists.
    fn exists(&self, name: &str) -> bool;

    /// Removes the named backend. Removing a missing backend is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend exists but cannot be removed.
    fn remove(&self, name: &str) -> StorageResult<()>;

    /// Atomically renames `from` to `to`, replacing `to` if present.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if `from` does not exist.
    fn rename(&self, from: &str, to: &str) -> StorageResult<()>;

    /// Lists the names that start with `prefix`, in ascending order.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing fails.
    fn list(&self, prefix: &str) -> StorageResult<Vec<String>>;
}

/// In-memory provider.
///
/// Clones share the same name table, so an environment reopened with a
/// clone of the provider sees exactly what the previous one wrote.
#[derive(Debug, Default, Clone)]
pub struct MemoryProvider {
    files: Arc<RwLock<BTreeMap<String, InMemoryBackend>>>,
}

impl MemoryProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a handle to the named backend without creating it.
    #[must_use]
    pub fn backend(&self, name: &str) -> Option<InMemoryBackend> {
        self.files.read().get(name).cloned()
    }

    /// Returns a deep copy whose backends no longer share bytes with `self`.
    #[must_use]
    pub fn deep_clone(&self) -> Self {
        let files = self
            .files
            .read()
            .iter()
            .map(|(name, backend)| (name.clone(), InMemoryBackend::with_data(backend.data())))
            .collect();
        Self {
            files: Arc::new(RwLock::new(files)),
        }
    }
}

impl BackendProvider for MemoryProvider {
    fn open(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>> {
        let backend = self
            .files
            .write()
            .entry(name.to_string())
            .or_default()
            .clone();
        Ok(Box::new(backend))
    }

    fn exists(&self, name: &str) -> bool {
        self.files.read().contains_key(name)
    }

    fn remove(&self, name: &str) -> StorageResult<()> {
        self.files.write().remove(name);
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        let mut files = self.files.write();
        let backend = files
            .remove(from)
            .ok_or_else(|| StorageError::NotFound(from.to_string()))?;
        files.insert(to.to_string(), backend);
        Ok(())
    }

    fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        Ok(self
            .files
            .read()
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Provider mapping names to files below a root directory.
#[derive(Debug, Clone)]
pub struct DirectoryProvider {
    root: PathBuf,
}

impl DirectoryProvider {
    /// Creates a provider rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(root: &Path) -> StorageResult<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a provider name to a filesystem path.
    #[must_use]
    pub fn path_of(&self, name: &str) -> PathBuf {
        name.split('/')
            .filter(|part| !part.is_empty())
            .fold(self.root.clone(), |path, part| path.join(part))
    }

    fn collect(&self, dir: &Path, rel: &str, out: &mut Vec<String>) -> StorageResult<()> {
        if !dir.is_dir() {
            return Ok(());
        }
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            let name = if rel.is_empty() {
                file_name
            } else {
                format!("{rel}/{file_name}")
            };
            if entry.file_type()?.is_dir() {
                self.collect(&entry.path(), &name, out)?;
            } else {
                out.push(name);
            }
        }
        Ok(())
    }
}

impl BackendProvider for DirectoryProvider {
    fn open(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>> {
        Ok(Box::new(FileBackend::open_with_create_dirs(
            &self.path_of(name),
        )?))
    }

    fn exists(&self, name: &str) -> bool {
        self.path_of(name).is_file()
    }

    fn remove(&self, name: &str) -> StorageResult<()> {
        match fs::remove_file(self.path_of(name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        let source = self.path_of(from);
        if !source.is_file() {
            return Err(StorageError::NotFound(from.to_string()));
        }
        let target = self.path_of(to);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(source, target)?;
        Ok(())
    }

    fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let mut names = Vec::new();
        self.collect(&self.root, "", &mut names)?;
        names.retain(|name| name.starts_with(prefix));
        names.sort();
        Ok(names)
    }
}
