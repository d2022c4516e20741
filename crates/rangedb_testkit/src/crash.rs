//! Crash recovery testing for RangeDB.
//!
//! An environment runs over a [`MemoryProvider`]. A "crash" freezes a deep
//! copy of the provider's bytes while the environment is still live, so the
//! copy holds exactly what had reached storage: nothing buffered in the log
//! writer, no final checkpoint. The environment is then dropped and a new
//! one is opened over the frozen copy, which runs recovery.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rangedb_testkit::crash::CrashHarness;
//!
//! let mut harness = CrashHarness::new(fast_config());
//! let env = harness.open()?;
//! // ... work ...
//! let env = harness.crash_and_reopen(env)?;
//! assert!(!env.recovery_report().losers.is_empty());
//! ```

use crate::fault::ScriptedTreeStore;
use rangedb_core::{CoreResult, EnvConfig, Environment, ImageTreeStore, LogFileId, TreeStore};
use rangedb_storage::{BackendProvider, MemoryProvider, StorageBackend};
use std::sync::Arc;

/// Points at which the log tail can be damaged before reopening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailDamage {
    /// Leave the log alone.
    None,
    /// Cut the given number of bytes off the newest log file.
    Truncate(u64),
    /// Flip a byte the given distance from the end of the newest log file.
    FlipByte(u64),
}

/// Opens environments over in-memory storage and crashes them.
pub struct CrashHarness {
    config: EnvConfig,
    provider: MemoryProvider,
    image_delay: Option<std::time::Duration>,
}

impl CrashHarness {
    /// Creates a harness over empty storage.
    pub fn new(config: EnvConfig) -> Self {
        Self {
            config,
            provider: MemoryProvider::new(),
            image_delay: None,
        }
    }

    /// Slows every checkpoint image flush by `delay` in environments opened
    /// from now on.
    pub fn with_image_delay(mut self, delay: std::time::Duration) -> Self {
        self.image_delay = Some(delay);
        self
    }

    /// The storage the next environment opens over.
    pub fn provider(&self) -> &MemoryProvider {
        &self.provider
    }

    /// Opens an environment over the current storage.
    ///
    /// # Errors
    ///
    /// Recovery errors.
    pub fn open(&self) -> CoreResult<Environment> {
        self.open_with(self.config.clone())
    }

    /// Opens an environment over the current storage with another config.
    ///
    /// # Errors
    ///
    /// Recovery errors.
    pub fn open_with(&self, config: EnvConfig) -> CoreResult<Environment> {
        let shared: Arc<dyn BackendProvider> = Arc::new(self.provider.clone());
        let image = ImageTreeStore::open(Arc::clone(&shared))?;
        let tree: Arc<dyn TreeStore> = match self.image_delay {
            Some(delay) => Arc::new(ScriptedTreeStore::new(Arc::new(image)).with_delay(delay)),
            None => Arc::new(image),
        };
        Environment::open_with_provider(config, shared, tree)
    }

    /// Freezes the bytes `env` has written so far and discards `env`.
    ///
    /// Whatever `env` does while being dropped (aborting transactions,
    /// the final checkpoint) lands in storage that is thrown away.
    pub fn crash(&mut self, env: Environment) {
        let frozen = self.provider.deep_clone();
        drop(env);
        self.provider = frozen;
    }

    /// [`CrashHarness::crash`] followed by [`CrashHarness::open`].
    ///
    /// # Errors
    ///
    /// Recovery errors.
    pub fn crash_and_reopen(&mut self, env: Environment) -> CoreResult<Environment> {
        self.crash(env);
        self.open()
    }

    /// Crashes, damages the newest log file, and reopens.
    ///
    /// # Errors
    ///
    /// Recovery errors.
    pub fn crash_with_damage(
        &mut self,
        env: Environment,
        damage: TailDamage,
    ) -> CoreResult<Environment> {
        self.crash(env);
        self.damage_tail(damage);
        self.open()
    }

    /// Names of the log files in storage, oldest first.
    pub fn log_files(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .provider
            .list("log/")
            .unwrap_or_default()
            .into_iter()
            .filter(|name| LogFileId::parse(name).is_some())
            .collect();
        names.sort();
        names
    }

    /// Applies `damage` to the newest log file.
    pub fn damage_tail(&self, damage: TailDamage) {
        let Some(newest) = self.log_files().pop() else {
            return;
        };
        let Some(mut backend) = self.provider.backend(&newest) else {
            return;
        };
        let size = backend.size().unwrap_or(0);
        match damage {
            TailDamage::None => {}
            TailDamage::Truncate(bytes) => {
                let _ = backend.truncate(size.saturating_sub(bytes));
            }
            TailDamage::FlipByte(distance) => {
                if distance > 0 && distance <= size {
                    let offset = (size - distance) as usize;
                    let old = backend.data()[offset];
                    backend.poke(offset, old ^ 0xFF);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{fast_config, numbered_key, read_committed};
    use rangedb_core::IsolationLevel;

    #[test]
    fn committed_survives_and_uncommitted_is_undone() {
        let mut harness = CrashHarness::new(fast_config());
        let env = harness.open().unwrap();
        let db = env.open_db("t").unwrap();
        env.transaction(IsolationLevel::Serializable, |txn| {
            db.put(txn, &numbered_key(1), b"committed")
        })
        .unwrap();
        let loser = env.begin(None, IsolationLevel::Serializable).unwrap();
        db.put(loser, &numbered_key(2), b"lost").unwrap();

        let env = harness.crash_and_reopen(env).unwrap();
        let report = env.recovery_report().clone();
        assert!(!report.clean_shutdown);
        assert_eq!(report.losers.len(), 1);
        let db = env.open_db("t").unwrap();
        assert_eq!(read_committed(&env, &db, &numbered_key(1)), Some(b"committed".to_vec()));
        assert_eq!(read_committed(&env, &db, &numbered_key(2)), None);
    }

    #[test]
    fn truncated_tail_is_repaired() {
        let mut harness = CrashHarness::new(fast_config());
        let env = harness.open().unwrap();
        let db = env.open_db("t").unwrap();
        env.transaction(IsolationLevel::Serializable, |txn| db.put(txn, b"a", b"1"))
            .unwrap();
        env.transaction(IsolationLevel::Serializable, |txn| db.put(txn, b"b", b"2"))
            .unwrap();

        let env = harness
            .crash_with_damage(env, TailDamage::Truncate(3))
            .unwrap();
        assert!(env.recovery_report().torn_tail.is_some());
        let db = env.open_db("t").unwrap();
        assert_eq!(read_committed(&env, &db, b"a"), Some(b"1".to_vec()));
        // The damaged record was the second transaction's commit.
        assert_eq!(read_committed(&env, &db, b"b"), None);
    }
}
