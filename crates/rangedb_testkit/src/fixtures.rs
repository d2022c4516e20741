//! Test fixtures and environment helpers.
//!
//! Provides convenience functions for setting up test environments
//! and common test scenarios.

use rangedb_core::{Db, EnvConfig, Environment, IsolationLevel, TxnId};
use std::path::{Path, PathBuf};
use std::sync::Once;
use std::time::Duration;
use tempfile::TempDir;

/// Configuration with short lock timeouts, for tests that expect conflicts.
#[must_use]
pub fn fast_config() -> EnvConfig {
    EnvConfig::default()
        .lock_timeout(Duration::from_millis(200))
        .sync_on_commit(true)
}

/// Installs a `tracing` subscriber honouring `RUST_LOG` once per process.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// A test environment with automatic cleanup.
pub struct TestEnv {
    /// The environment.
    pub env: Environment,
    /// The temporary directory (kept alive to prevent cleanup).
    temp_dir: Option<TempDir>,
}

impl TestEnv {
    /// Creates an in-memory environment with [`fast_config`].
    pub fn memory() -> Self {
        Self::memory_with(fast_config())
    }

    /// Creates an in-memory environment.
    pub fn memory_with(config: EnvConfig) -> Self {
        init_tracing();
        Self {
            env: Environment::open_in_memory(config).expect("Failed to open in-memory environment"),
            temp_dir: None,
        }
    }

    /// Creates a directory-backed environment with [`fast_config`].
    pub fn file() -> Self {
        Self::file_with(fast_config())
    }

    /// Creates a directory-backed environment in a fresh temp directory.
    pub fn file_with(config: EnvConfig) -> Self {
        init_tracing();
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let env = Environment::open(&temp_dir.path().join("env"), config)
            .expect("Failed to open environment");
        Self {
            env,
            temp_dir: Some(temp_dir),
        }
    }

    /// Returns the environment path if directory-backed.
    pub fn path(&self) -> Option<PathBuf> {
        self.temp_dir.as_ref().map(|d| d.path().join("env"))
    }

    /// Closes the environment and opens it again from its directory.
    ///
    /// # Panics
    ///
    /// Panics for in-memory environments, or if reopening fails.
    pub fn reopen(self, config: EnvConfig) -> Self {
        let Self { env, temp_dir } = self;
        let temp_dir = temp_dir.expect("reopen needs a directory-backed environment");
        env.close().expect("Failed to close environment");
        drop(env);
        let env = Environment::open(&temp_dir.path().join("env"), config)
            .expect("Failed to reopen environment");
        Self {
            env,
            temp_dir: Some(temp_dir),
        }
    }
}

impl std::ops::Deref for TestEnv {
    type Target = Environment;

    fn deref(&self) -> &Self::Target {
        &self.env
    }
}

/// Runs a test with a temporary in-memory environment.
///
/// # Example
///
/// ```rust,ignore
/// use rangedb_testkit::with_temp_env;
///
/// #[test]
/// fn my_test() {
///     with_temp_env(|env| {
///         let db = env.open_db("test").unwrap();
///         // ... test operations
///     });
/// }
/// ```
pub fn with_temp_env<F, R>(f: F) -> R
where
    F: FnOnce(&Environment) -> R,
{
    let test_env = TestEnv::memory();
    f(&test_env.env)
}

/// Runs a test with a temporary directory-backed environment.
pub fn with_temp_dir_env<F, R>(f: F) -> R
where
    F: FnOnce(&Environment, &Path) -> R,
{
    let test_env = TestEnv::file();
    let path = test_env.path().expect("directory-backed");
    f(&test_env.env, &path)
}

/// Key for the `n`th generated row; big-endian so keys sort numerically.
#[must_use]
pub fn numbered_key(n: u32) -> Vec<u8> {
    let mut key = b"key".to_vec();
    key.extend_from_slice(&n.to_be_bytes());
    key
}

/// Commits `count` rows `numbered_key(i) -> i` in one transaction.
///
/// # Panics
///
/// Panics if the transaction fails.
pub fn seed(env: &Environment, db: &Db, count: u32) {
    env.transaction(IsolationLevel::Serializable, |txn| {
        for i in 0..count {
            db.put(txn, &numbered_key(i), &i.to_le_bytes())?;
        }
        Ok(())
    })
    .expect("Failed to seed dictionary");
}

/// Reads `key` in a fresh read-committed transaction.
///
/// # Panics
///
/// Panics if the read fails.
pub fn read_committed(env: &Environment, db: &Db, key: &[u8]) -> Option<Vec<u8>> {
    let txn = env
        .begin(None, IsolationLevel::ReadCommitted)
        .expect("Failed to begin reader");
    let value = db.get(txn, key).expect("Failed to read");
    env.commit(txn).expect("Failed to commit reader");
    value
}

/// Collects every live pair visible to `txn`.
///
/// # Panics
///
/// Panics if the scan fails.
pub fn scan_all(db: &Db, txn: TxnId) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut cursor = db.cursor(txn);
    let mut out = Vec::new();
    while let Some(entry) = cursor.next().expect("Failed to advance cursor") {
        out.push(entry);
    }
    out
}
