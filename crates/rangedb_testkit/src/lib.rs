//! # RangeDB Testkit
//!
//! Test utilities for RangeDB.
//!
//! This crate provides:
//! - Environment fixtures (in-memory and directory-backed)
//! - A crash harness that reopens an environment over a frozen copy of
//!   its storage
//! - Fault-injecting storage providers and tree stores
//! - A GC observer that checks removed versions against live snapshots
//! - Stress helpers for concurrent workloads
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use rangedb_testkit::prelude::*;
//!
//! #[test]
//! fn committed_write_survives_crash() {
//!     let mut harness = CrashHarness::new(fast_config());
//!     let env = harness.open().unwrap();
//!     // ... commit something ...
//!     let env = harness.crash_and_reopen(env).unwrap();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fault;
pub mod fixtures;
pub mod generators;
pub mod observer;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fault::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::observer::*;
    pub use crate::stress::*;
}

pub use crash::*;
pub use fault::*;
pub use fixtures::*;
pub use generators::*;
pub use observer::*;
pub use stress::*;
