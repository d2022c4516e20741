//! Multi-version value chains.
//!
//! Each key maps to a chain of versions, newest first. A write prepends a
//! provisional version tagged with the writer and the LSN of its log record;
//! the writer's root commit flips it to committed at the commit LSN, and an
//! abort removes it. Readers pick the first version their snapshot allows.

mod chain;
mod gc;
mod store;

pub use chain::{ReadView, Version, VersionChain, VersionState, WriterResolver, WriterStatus};
pub use gc::{collect, GcObserver, GcReport};
pub use store::{CapturedChain, DictChains, DictKey, MvccStore};
