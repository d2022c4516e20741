//! Version garbage collection.

use super::chain::Version;
use super::store::MvccStore;
use crate::error::CoreResult;
use crate::types::{DictId, Lsn};
use tracing::debug;

/// Observes every version removed by garbage collection.
///
/// Installed with `Environment::set_gc_observer`; test harnesses use it to
/// check that no removed version was still needed by a live snapshot.
pub trait GcObserver: Send + Sync {
    /// Called once per removed version, after removal.
    fn version_removed(&self, dict: DictId, key: &[u8], version: &Version, oldest_snapshot: Lsn);
}

/// Outcome of one collection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GcReport {
    /// Snapshot boundary used.
    pub oldest_snapshot: Lsn,
    /// Versions removed.
    pub versions_removed: u64,
}

/// Collects one dictionary against the given snapshot boundary.
///
/// # Errors
///
/// Returns [`crate::CoreError::DictionaryNotFound`] for an unknown dictionary.
pub fn collect(
    store: &MvccStore,
    dict: DictId,
    oldest_snapshot: Lsn,
    observer: Option<&dyn GcObserver>,
) -> CoreResult<GcReport> {
    let removed = store.collect_garbage(dict, oldest_snapshot)?;
    if let Some(observer) = observer {
        for (key, version) in &removed {
            observer.version_removed(dict, key, version, oldest_snapshot);
        }
    }
    if !removed.is_empty() {
        debug!(%dict, removed = removed.len(), oldest = oldest_snapshot.0, "versions collected");
    }
    Ok(GcReport {
        oldest_snapshot,
        versions_removed: removed.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locktree::BytewiseComparator;
    use crate::mvcc::chain::VersionState;
    use crate::types::TxnId;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(Vec<u8>, Lsn)>>);

    impl GcObserver for Recorder {
        fn version_removed(&self, _dict: DictId, key: &[u8], version: &Version, _oldest: Lsn) {
            self.0.lock().push((key.to_vec(), version.lsn));
        }
    }

    #[test]
    fn observer_sees_each_removal() {
        let store = MvccStore::new();
        store.register_dict(DictId(1), Arc::new(BytewiseComparator));
        for (lsn, commit) in [(1, 2), (3, 4), (5, 6)] {
            store
                .install(
                    DictId(1),
                    b"k",
                    Version {
                        value: Some(vec![lsn as u8]),
                        writer: TxnId(lsn),
                        lsn: Lsn(lsn),
                        state: VersionState::Committed {
                            commit_lsn: Lsn(commit),
                        },
                    },
                )
                .unwrap();
        }

        let recorder = Recorder::default();
        let report = collect(&store, DictId(1), Lsn(7), Some(&recorder)).unwrap();
        assert_eq!(report.versions_removed, 2);
        let seen = recorder.0.lock().clone();
        assert_eq!(seen, vec![(b"k".to_vec(), Lsn(1)), (b"k".to_vec(), Lsn(3))]);
    }
}
