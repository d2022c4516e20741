//! Fault injection.
//!
//! [`FaultyProvider`] wraps a provider and fails reads or writes of chosen
//! files;
//! [`ScriptedTreeStore`] wraps a tree store and slows or fails its image
//! flushes. Both are shared through `Arc`s so a test can change the plan
//! while an environment is running.

use parking_lot::Mutex;
use rangedb_core::mvcc::VersionChain;
use rangedb_core::{Catalog, CoreError, CoreResult, DictId, Lsn, TreeSnapshot, TreeStore, Version};
use rangedb_storage::{BackendProvider, StorageBackend, StorageError, StorageResult};
use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Kind of failure a write returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// `io::ErrorKind::StorageFull`.
    OutOfSpace,
    /// A generic I/O error.
    Io,
}

impl FaultKind {
    fn error(self, name: &str) -> StorageError {
        match self {
            Self::OutOfSpace => io::Error::new(
                io::ErrorKind::StorageFull,
                format!("simulated full device writing {name}"),
            )
            .into(),
            Self::Io => StorageError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("simulated write failure on {name}"),
            )),
        }
    }
}

#[derive(Debug, Clone)]
struct FaultRule {
    prefix: String,
    after_bytes: u64,
    kind: FaultKind,
}

#[derive(Debug, Default)]
struct FaultPlan {
    rules: Mutex<Vec<FaultRule>>,
    written: Mutex<std::collections::HashMap<String, u64>>,
    read_failures: Mutex<Vec<String>>,
    injected: AtomicUsize,
}

impl FaultPlan {
    fn check_read(&self, name: &str) -> Option<StorageError> {
        let failing = self
            .read_failures
            .lock()
            .iter()
            .any(|prefix| name.starts_with(prefix.as_str()));
        if !failing {
            return None;
        }
        self.injected.fetch_add(1, Ordering::SeqCst);
        Some(StorageError::Io(io::Error::new(
            io::ErrorKind::Other,
            format!("simulated read failure on {name}"),
        )))
    }

    /// Returns the failure for appending `len` bytes to `name`, if any.
    fn check_append(&self, name: &str, len: usize) -> Option<StorageError> {
        let rule = self
            .rules
            .lock()
            .iter()
            .find(|rule| name.starts_with(&rule.prefix))
            .cloned();
        let mut written = self.written.lock();
        let total = written.entry(name.to_string()).or_insert(0);
        if let Some(rule) = rule {
            if *total + len as u64 > rule.after_bytes {
                self.injected.fetch_add(1, Ordering::SeqCst);
                return Some(rule.kind.error(name));
            }
        }
        *total += len as u64;
        None
    }
}

/// A provider whose backends fail appends according to a shared plan.
#[derive(Clone)]
pub struct FaultyProvider {
    inner: Arc<dyn BackendProvider>,
    plan: Arc<FaultPlan>,
}

impl FaultyProvider {
    /// Wraps `inner` with an empty plan.
    pub fn new(inner: Arc<dyn BackendProvider>) -> Self {
        Self {
            inner,
            plan: Arc::new(FaultPlan::default()),
        }
    }

    /// Fails appends to files whose name starts with `prefix` once more
    /// than `after_bytes` would have been written to one file.
    pub fn fail_after(&self, prefix: &str, after_bytes: u64, kind: FaultKind) {
        self.plan.rules.lock().push(FaultRule {
            prefix: prefix.to_string(),
            after_bytes,
            kind,
        });
    }

    /// Fails every read of files whose name starts with `prefix`.
    pub fn fail_reads(&self, prefix: &str) {
        self.plan.read_failures.lock().push(prefix.to_string());
    }

    /// Removes every rule.
    pub fn heal(&self) {
        self.plan.rules.lock().clear();
        self.plan.read_failures.lock().clear();
    }

    /// Number of failures injected so far.
    pub fn injected(&self) -> usize {
        self.plan.injected.load(Ordering::SeqCst)
    }
}

impl BackendProvider for FaultyProvider {
    fn open(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>> {
        Ok(Box::new(FaultyBackend {
            name: name.to_string(),
            inner: self.inner.open(name)?,
            plan: Arc::clone(&self.plan),
        }))
    }

    fn exists(&self, name: &str) -> bool {
        self.inner.exists(name)
    }

    fn remove(&self, name: &str) -> StorageResult<()> {
        self.plan.written.lock().remove(name);
        self.inner.remove(name)
    }

    fn rename(&self, from: &str, to: &str) -> StorageResult<()> {
        self.inner.rename(from, to)
    }

    fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        self.inner.list(prefix)
    }
}

struct FaultyBackend {
    name: String,
    inner: Box<dyn StorageBackend>,
    plan: Arc<FaultPlan>,
}

impl StorageBackend for FaultyBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        if let Some(err) = self.plan.check_read(&self.name) {
            return Err(err);
        }
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        if let Some(err) = self.plan.check_append(&self.name, data.len()) {
            return Err(err);
        }
        self.inner.append(data)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.inner.flush()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.inner.sync()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.inner.truncate(new_size)
    }
}

/// A tree store whose flushes can be slowed down or made to fail.
pub struct ScriptedTreeStore {
    inner: Arc<dyn TreeStore>,
    delay_ms: AtomicU64,
    failures_left: AtomicU32,
    flushes: AtomicU32,
}

impl ScriptedTreeStore {
    /// Wraps `inner` with no delay and no failures.
    pub fn new(inner: Arc<dyn TreeStore>) -> Self {
        Self {
            inner,
            delay_ms: AtomicU64::new(0),
            failures_left: AtomicU32::new(0),
            flushes: AtomicU32::new(0),
        }
    }

    /// Sleeps for `delay` in every flush.
    #[must_use]
    pub fn with_delay(self, delay: Duration) -> Self {
        self.set_delay(delay);
        self
    }

    /// Changes the flush delay.
    pub fn set_delay(&self, delay: Duration) {
        let ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.delay_ms.store(ms, Ordering::SeqCst);
    }

    /// Fails the next `count` flushes.
    pub fn fail_next(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// Flush attempts so far, failed ones included.
    pub fn flushes(&self) -> u32 {
        self.flushes.load(Ordering::SeqCst)
    }
}

impl TreeStore for ScriptedTreeStore {
    fn store_version(&self, dict: DictId, key: &[u8], version: &Version) -> CoreResult<()> {
        self.inner.store_version(dict, key, version)
    }

    fn store_chain(
        &self,
        dict: DictId,
        key: &[u8],
        versions: Option<&[Version]>,
    ) -> CoreResult<()> {
        self.inner.store_chain(dict, key, versions)
    }

    fn load_versions(&self, dict: DictId, key: &[u8]) -> CoreResult<Option<VersionChain>> {
        self.inner.load_versions(dict, key)
    }

    fn store_catalog(&self, catalog: &Catalog) -> CoreResult<()> {
        self.inner.store_catalog(catalog)
    }

    fn flush_dirty_nodes(&self, upto_lsn: Lsn) -> CoreResult<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(CoreError::Io(io::Error::new(
                io::ErrorKind::Other,
                "simulated image flush failure",
            )));
        }
        self.inner.flush_dirty_nodes(upto_lsn)
    }

    fn load(&self) -> CoreResult<TreeSnapshot> {
        self.inner.load()
    }
}
