//! # RangeDB Storage
//!
//! Storage backend trait and implementations for RangeDB.
//!
//! This crate provides the lowest-level storage abstraction for RangeDB.
//! Storage backends are **opaque byte stores** - they do not interpret
//! the data they store. Backend providers hand out named backends so the
//! engine can keep numbered log files, rollback spill files and loader
//! temporaries side by side without caring whether they live on disk or
//! in memory.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and ephemeral storage
//! - [`FileBackend`] - For persistent storage using OS file APIs
//!
//! ## Available Providers
//!
//! - [`MemoryProvider`] - Named in-memory backends, shareable across reopen
//! - [`DirectoryProvider`] - Named files below a root directory
//!
//! ## Example
//!
//! ```rust
//! use rangedb_storage::{BackendProvider, MemoryProvider, StorageBackend};
//!
//! let provider = MemoryProvider::new();
//! let mut backend = provider.open("log/log000000000001.rlog").unwrap();
//! let offset = backend.append(b"hello world").unwrap();
//! assert_eq!(backend.read_at(offset, 11).unwrap(), b"hello world");
//! assert_eq!(provider.list("log/").unwrap().len(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;
mod provider;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
pub use provider::{BackendProvider, DirectoryProvider, MemoryProvider};
