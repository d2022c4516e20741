//! Transactions.
//!
//! A transaction is an entry in the manager's arena. Nested transactions
//! share their root's lock ownership and snapshot; a committed child's
//! rollback entries and locks move to its parent, and only the root's
//! commit makes the family's writes visible to others.

mod manager;
mod state;

pub use manager::{ProgressFn, TxnManager, TxnSettings};
pub use state::{TxnInfo, TxnProgress, TxnRecord};
