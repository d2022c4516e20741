//! GC verification.

use parking_lot::Mutex;
use rangedb_core::{DictId, GcObserver, Lsn, Version};

/// A version removed by garbage collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal {
    /// Dictionary.
    pub dict: DictId,
    /// Key.
    pub key: Vec<u8>,
    /// The removed version.
    pub version: Version,
    /// Boundary the collector used.
    pub oldest_snapshot: Lsn,
}

/// Records every removal and checks it against snapshots the test says are
/// still live.
///
/// A removal is a violation when the version was provisional, was
/// committed at or after the collector's boundary, or was the version one
/// of the registered snapshots reads.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    removals: Mutex<Vec<Removal>>,
    protected: Mutex<Vec<(DictId, Vec<u8>, Lsn)>>,
}

impl RecordingObserver {
    /// Creates an observer with nothing recorded.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares that a live snapshot reads the version of `key` committed
    /// at `commit_lsn`.
    pub fn protect(&self, dict: DictId, key: &[u8], commit_lsn: Lsn) {
        self.protected.lock().push((dict, key.to_vec(), commit_lsn));
    }

    /// Forgets every protected version.
    pub fn release_all(&self) {
        self.protected.lock().clear();
    }

    /// Everything removed so far.
    pub fn removals(&self) -> Vec<Removal> {
        self.removals.lock().clone()
    }

    /// Removals that broke a snapshot.
    pub fn violations(&self) -> Vec<Removal> {
        let protected = self.protected.lock();
        self.removals
            .lock()
            .iter()
            .filter(|removal| {
                let Some(commit_lsn) = removal.version.commit_lsn() else {
                    return true;
                };
                commit_lsn >= removal.oldest_snapshot
                    || protected.iter().any(|(dict, key, lsn)| {
                        *dict == removal.dict && *key == removal.key && *lsn == commit_lsn
                    })
            })
            .cloned()
            .collect()
    }
}

impl GcObserver for RecordingObserver {
    fn version_removed(&self, dict: DictId, key: &[u8], version: &Version, oldest_snapshot: Lsn) {
        self.removals.lock().push(Removal {
            dict,
            key: key.to_vec(),
            version: version.clone(),
            oldest_snapshot,
        });
    }
}
