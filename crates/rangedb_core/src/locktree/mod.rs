//! Range locking.
//!
//! Each dictionary has a lock tree of granted `[low, high]` ranges. A
//! transaction and all of its ancestors and descendants form one family and
//! never conflict with each other; conflicts are checked between families
//! only. Blocked requests are recorded in a wait-for graph over families,
//! which is checked for cycles either on every blocking acquire or on
//! demand.

mod manager;
mod range;
mod tree;
mod wfg;

pub use manager::{LockManager, LockRequest, LockSettings};
pub use range::{BytewiseComparator, KeyBound, KeyComparator, KeyRange};
pub use tree::{LockTree, RangeLock};
pub use wfg::{DeadlockVictim, WaitEntry, WaitForGraph};

#[cfg(test)]
mod proptests {
    use super::*;
    use crate::types::{LockMode, TxnId};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn arb_range() -> impl Strategy<Value = KeyRange> {
        (0u8..20, 0u8..5).prop_map(|(low, width)| {
            KeyRange::span(
                KeyBound::Key(vec![low]),
                KeyBound::Key(vec![low.saturating_add(width)]),
            )
        })
    }

    fn arb_mode() -> impl Strategy<Value = LockMode> {
        prop_oneof![Just(LockMode::Read), Just(LockMode::Write)]
    }

    proptest! {
        /// Granting only conflict-free requests never yields two overlapping
        /// incompatible ranges from different families, before or after
        /// escalation.
        #[test]
        fn granted_ranges_are_mutually_exclusive(
            requests in prop::collection::vec((1u64..5, arb_range(), arb_mode()), 1..60)
        ) {
            let mut tree = LockTree::new(Arc::new(BytewiseComparator));
            for (owner, range, mode) in requests {
                let owner = TxnId(owner);
                if tree.conflicting_owners(&range, mode, owner, true).is_empty() {
                    tree.grant(RangeLock { range, mode, owner, holder: owner });
                }
            }
            tree.escalate();

            let cmp = BytewiseComparator;
            let ranges = tree.ranges();
            for (i, a) in ranges.iter().enumerate() {
                for b in &ranges[i + 1..] {
                    if a.owner != b.owner && a.range.overlaps(&b.range, &cmp) {
                        prop_assert!(LockTree::compatible(a.mode, b.mode, true));
                    }
                }
            }
        }
    }
}
