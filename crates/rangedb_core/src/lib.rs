//! # RangeDB Core
//!
//! Transaction, locking and durability core of the RangeDB embedded
//! key-value engine.
//!
//! This crate provides:
//! - A range lock manager with nested-transaction families, escalation and
//!   deadlock detection
//! - Nested transactions at four isolation levels
//! - Multi-version value chains with garbage collection
//! - A write-ahead log with group commit and per-transaction rollback logs
//! - Non-blocking checkpoints and crash recovery
//! - Environment, dictionary and cursor handles, a bulk loader and an
//!   online index builder
//!
//! ## Example
//!
//! ```rust
//! use rangedb_core::{EnvConfig, Environment, IsolationLevel};
//!
//! let env = Environment::open_in_memory(EnvConfig::default()).unwrap();
//! let users = env.open_db("users").unwrap();
//!
//! env.transaction(IsolationLevel::Serializable, |txn| {
//!     users.put(txn, b"alice", b"admin")
//! })
//! .unwrap();
//!
//! let txn = env.begin(None, IsolationLevel::SnapshotRepeatableRead).unwrap();
//! assert_eq!(users.get(txn, b"alice").unwrap(), Some(b"admin".to_vec()));
//! env.commit(txn).unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod bulk;
pub mod checkpoint;
mod config;
mod db;
#[cfg(feature = "std")]
mod dir;
mod env;
mod error;
pub mod locktree;
pub mod log;
pub mod mvcc;
pub mod recovery;
pub mod rollback;
mod stats;
pub mod tree;
pub mod txn;
mod types;

pub use bulk::{BulkLoader, HotIndexer, Identity, RowTransform, TransformedRow};
pub use checkpoint::{CheckpointMark, CheckpointReport};
pub use config::{DeadlockDetection, EnvConfig};
pub use db::{Cursor, Db, Entry};
#[cfg(feature = "std")]
pub use dir::EnvDir;
pub use env::Environment;
pub use error::{CoreError, CoreResult};
pub use locktree::{
    BytewiseComparator, DeadlockVictim, KeyBound, KeyComparator, KeyRange, RangeLock,
};
pub use mvcc::{GcObserver, GcReport, Version, VersionState};
pub use recovery::RecoveryReport;
pub use stats::{EngineStats, StatsSnapshot};
pub use tree::{Catalog, CatalogEntry, ImageTreeStore, TreeSnapshot, TreeStore};
pub use txn::{TxnInfo, TxnProgress};
pub use types::{DictId, IsolationLevel, LockMode, LogFileId, Lsn, TxnId, TxnState};
