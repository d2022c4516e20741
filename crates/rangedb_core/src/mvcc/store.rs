//! Chains of every key, grouped by dictionary.

use super::chain::{ReadView, Version, VersionChain, VersionState, WriterResolver, WriterStatus};
use crate::error::{CoreError, CoreResult};
use crate::locktree::KeyComparator;
use crate::types::{DictId, Lsn, TxnId};
use parking_lot::{Mutex, RwLock};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;

/// A key ordered by its dictionary's comparator.
#[derive(Clone)]
pub struct DictKey {
    bytes: Vec<u8>,
    comparator: Arc<dyn KeyComparator>,
}

impl DictKey {
    fn new(bytes: Vec<u8>, comparator: &Arc<dyn KeyComparator>) -> Self {
        Self {
            bytes,
            comparator: Arc::clone(comparator),
        }
    }

    /// Returns the key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for DictKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DictKey").field(&self.bytes).finish()
    }
}

impl PartialEq for DictKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DictKey {}

impl PartialOrd for DictKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DictKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.comparator.compare(&self.bytes, &other.bytes)
    }
}

/// The chains of one dictionary.
pub struct DictChains {
    comparator: Arc<dyn KeyComparator>,
    chains: RwLock<BTreeMap<DictKey, VersionChain>>,
    dirty: Mutex<HashSet<Vec<u8>>>,
}

impl DictChains {
    fn new(comparator: Arc<dyn KeyComparator>) -> Self {
        Self {
            comparator,
            chains: RwLock::new(BTreeMap::new()),
            dirty: Mutex::new(HashSet::new()),
        }
    }

    fn key(&self, bytes: &[u8]) -> DictKey {
        DictKey::new(bytes.to_vec(), &self.comparator)
    }

    fn mark_dirty(&self, key: &[u8]) {
        self.dirty.lock().insert(key.to_vec());
    }

    /// Returns the dictionary's comparator.
    pub fn comparator(&self) -> &Arc<dyn KeyComparator> {
        &self.comparator
    }

    /// Number of keys with at least one version.
    pub fn key_count(&self) -> usize {
        self.chains.read().len()
    }
}

/// A version about to be written into a checkpoint image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedChain {
    /// Key bytes.
    pub key: Vec<u8>,
    /// Versions newest first, or `None` when the key no longer exists.
    pub versions: Option<Vec<Version>>,
}

/// Version chains of every dictionary.
#[derive(Default)]
pub struct MvccStore {
    dicts: RwLock<HashMap<DictId, Arc<DictChains>>>,
}

impl MvccStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the chain map of a dictionary.
    pub fn register_dict(&self, dict: DictId, comparator: Arc<dyn KeyComparator>) {
        self.dicts
            .write()
            .entry(dict)
            .or_insert_with(|| Arc::new(DictChains::new(comparator)));
    }

    /// Drops a dictionary's chains.
    pub fn remove_dict(&self, dict: DictId) {
        self.dicts.write().remove(&dict);
    }

    /// Returns the registered dictionaries.
    pub fn dict_ids(&self) -> Vec<DictId> {
        let mut ids: Vec<DictId> = self.dicts.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Returns the chains of `dict`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DictionaryNotFound`] for an unknown dictionary.
    pub fn dict(&self, dict: DictId) -> CoreResult<Arc<DictChains>> {
        self.dicts
            .read()
            .get(&dict)
            .cloned()
            .ok_or_else(|| CoreError::DictionaryNotFound {
                name: dict.to_string(),
            })
    }

    /// Reads the value `view` sees. Tombstones read as `None`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DictionaryNotFound`] for an unknown dictionary.
    pub fn read(
        &self,
        dict: DictId,
        key: &[u8],
        view: &ReadView<'_>,
        resolver: &dyn WriterResolver,
    ) -> CoreResult<Option<Vec<u8>>> {
        let chains = self.dict(dict)?;
        let map = chains.chains.read();
        Ok(map
            .get(&chains.key(key))
            .and_then(|chain| chain.visible(view, resolver))
            .and_then(|version| version.value.clone()))
    }

    /// Returns the first key after `after` (or at/after `from` when
    /// `inclusive`) whose visible version is a live value.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DictionaryNotFound`] for an unknown dictionary.
    pub fn next_visible(
        &self,
        dict: DictId,
        from: Option<&[u8]>,
        inclusive: bool,
        view: &ReadView<'_>,
        resolver: &dyn WriterResolver,
    ) -> CoreResult<Option<(Vec<u8>, Vec<u8>)>> {
        let chains = self.dict(dict)?;
        let start = match from {
            None => Bound::Unbounded,
            Some(key) if inclusive => Bound::Included(chains.key(key)),
            Some(key) => Bound::Excluded(chains.key(key)),
        };
        let map = chains.chains.read();
        for (key, chain) in map.range((start, Bound::Unbounded)) {
            if let Some(value) = chain.visible(view, resolver).and_then(|v| v.value.clone()) {
                return Ok(Some((key.bytes.clone(), value)));
            }
        }
        Ok(None)
    }

    /// Prepends a provisional version. The caller holds the key's write lock.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DictionaryNotFound`] for an unknown dictionary.
    pub fn write(
        &self,
        dict: DictId,
        key: &[u8],
        value: Option<Vec<u8>>,
        writer: TxnId,
        lsn: Lsn,
    ) -> CoreResult<()> {
        let chains = self.dict(dict)?;
        chains
            .chains
            .write()
            .entry(chains.key(key))
            .or_default()
            .push(Version {
                value,
                writer,
                lsn,
                state: VersionState::Provisional,
            });
        chains.mark_dirty(key);
        Ok(())
    }

    /// Removes the version written at `lsn` (undo).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DictionaryNotFound`] for an unknown dictionary.
    pub fn undo(&self, dict: DictId, key: &[u8], lsn: Lsn) -> CoreResult<bool> {
        let Ok(chains) = self.dict(dict) else {
            // The dictionary was removed along with everything in it.
            return Ok(false);
        };
        let dict_key = chains.key(key);
        let mut map = chains.chains.write();
        let removed = match map.get_mut(&dict_key) {
            Some(chain) => {
                let removed = chain.remove_lsn(lsn).is_some();
                if chain.is_empty() {
                    map.remove(&dict_key);
                }
                removed
            }
            None => false,
        };
        drop(map);
        if removed {
            chains.mark_dirty(key);
        }
        Ok(removed)
    }

    /// Marks the version written at `lsn` committed.
    ///
    /// # Errors
    ///
    /// Never fails for a removed dictionary; returns `Ok(false)`.
    pub fn commit_version(
        &self,
        dict: DictId,
        key: &[u8],
        lsn: Lsn,
        commit_lsn: Lsn,
    ) -> CoreResult<bool> {
        let Ok(chains) = self.dict(dict) else {
            return Ok(false);
        };
        let flipped = chains
            .chains
            .write()
            .get_mut(&chains.key(key))
            .is_some_and(|chain| chain.commit_lsn(lsn, commit_lsn));
        if flipped {
            chains.mark_dirty(key);
        }
        Ok(flipped)
    }

    /// Inserts a version at its LSN position (recovery redo and image load).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DictionaryNotFound`] for an unknown dictionary.
    pub fn install(&self, dict: DictId, key: &[u8], version: Version) -> CoreResult<()> {
        let chains = self.dict(dict)?;
        chains
            .chains
            .write()
            .entry(chains.key(key))
            .or_default()
            .install(version);
        chains.mark_dirty(key);
        Ok(())
    }

    /// Replaces a key's whole chain (image load).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DictionaryNotFound`] for an unknown dictionary.
    pub fn load_chain(&self, dict: DictId, key: &[u8], chain: VersionChain) -> CoreResult<()> {
        let chains = self.dict(dict)?;
        if !chain.is_empty() {
            chains.chains.write().insert(chains.key(key), chain);
        }
        Ok(())
    }

    /// Returns a copy of a key's chain.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DictionaryNotFound`] for an unknown dictionary.
    pub fn chain(&self, dict: DictId, key: &[u8]) -> CoreResult<Option<VersionChain>> {
        let chains = self.dict(dict)?;
        let map = chains.chains.read();
        Ok(map.get(&chains.key(key)).cloned())
    }

    /// Visits every chain of every dictionary. Holds one dictionary's read
    /// latch at a time.
    pub fn for_each_chain<F>(&self, mut visit: F)
    where
        F: FnMut(DictId, &[u8], &VersionChain),
    {
        for dict in self.dict_ids() {
            if let Ok(chains) = self.dict(dict) {
                let map = chains.chains.read();
                for (key, chain) in map.iter() {
                    visit(dict, key.as_bytes(), chain);
                }
            }
        }
    }

    /// Removes every version `keep` rejects; empty chains are dropped.
    /// Returns the removed versions.
    pub fn retain_versions<F>(&self, mut keep: F) -> Vec<(DictId, Vec<u8>, Version)>
    where
        F: FnMut(DictId, &Version) -> bool,
    {
        let mut removed = Vec::new();
        for dict in self.dict_ids() {
            let Ok(chains) = self.dict(dict) else {
                continue;
            };
            let mut map = chains.chains.write();
            let mut emptied = Vec::new();
            let mut touched = Vec::new();
            for (key, chain) in map.iter_mut() {
                let doomed: Vec<Lsn> = chain
                    .iter()
                    .filter(|version| !keep(dict, version))
                    .map(|version| version.lsn)
                    .collect();
                for lsn in doomed {
                    if let Some(version) = chain.remove_lsn(lsn) {
                        touched.push((key.bytes.clone(), version));
                    }
                }
                if chain.is_empty() {
                    emptied.push(key.clone());
                }
            }
            for key in emptied {
                map.remove(&key);
            }
            drop(map);
            for (key, version) in touched {
                chains.mark_dirty(&key);
                removed.push((dict, key, version));
            }
        }
        removed
    }

    /// Runs garbage collection over one dictionary.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DictionaryNotFound`] for an unknown dictionary.
    pub fn collect_garbage(
        &self,
        dict: DictId,
        oldest_snapshot: Lsn,
    ) -> CoreResult<Vec<(Vec<u8>, Version)>> {
        let chains = self.dict(dict)?;
        let mut removed = Vec::new();
        let mut map = chains.chains.write();
        let mut emptied = Vec::new();
        for (key, chain) in map.iter_mut() {
            for version in chain.collect_garbage(oldest_snapshot) {
                removed.push((key.bytes.clone(), version));
            }
            if chain.is_empty() {
                emptied.push(key.clone());
            }
        }
        for key in emptied {
            map.remove(&key);
        }
        drop(map);
        for (key, _) in &removed {
            chains.mark_dirty(key);
        }
        Ok(removed)
    }

    /// Takes the dirty keys of every dictionary and copies their chains as
    /// they should be persisted.
    ///
    /// Provisional versions whose root already committed are captured as
    /// committed, so the image never depends on log records that precede
    /// the checkpoint. Each dictionary's read latch is held only while its
    /// chains are copied.
    pub fn capture_dirty(
        &self,
        resolver: &dyn WriterResolver,
    ) -> Vec<(DictId, Vec<CapturedChain>)> {
        let mut captured = Vec::new();
        for dict in self.dict_ids() {
            let Ok(chains) = self.dict(dict) else {
                continue;
            };
            let dirty: Vec<Vec<u8>> = chains.dirty.lock().drain().collect();
            if dirty.is_empty() {
                continue;
            }
            let map = chains.chains.read();
            let mut out = Vec::with_capacity(dirty.len());
            for key in dirty {
                let versions = map.get(&chains.key(&key)).map(|chain| {
                    chain
                        .iter()
                        .filter_map(|version| resolve_for_image(version, resolver))
                        .collect::<Vec<_>>()
                });
                out.push(CapturedChain {
                    key,
                    versions: versions.filter(|v| !v.is_empty()),
                });
            }
            captured.push((dict, out));
        }
        captured
    }

    /// Puts keys back into the dirty sets (after a failed checkpoint).
    pub fn restore_dirty(&self, captured: &[(DictId, Vec<CapturedChain>)]) {
        for (dict, chains) in captured {
            if let Ok(dict_chains) = self.dict(*dict) {
                let mut dirty = dict_chains.dirty.lock();
                for chain in chains {
                    dirty.insert(chain.key.clone());
                }
            }
        }
    }

    /// Marks every key of every dictionary dirty.
    pub fn mark_all_dirty(&self) {
        for dict in self.dict_ids() {
            if let Ok(chains) = self.dict(dict) {
                let keys: Vec<Vec<u8>> = chains
                    .chains
                    .read()
                    .keys()
                    .map(|key| key.bytes.clone())
                    .collect();
                chains.dirty.lock().extend(keys);
            }
        }
    }

    /// Total number of versions held.
    pub fn version_count(&self) -> usize {
        let mut count = 0;
        self.for_each_chain(|_, _, chain| count += chain.len());
        count
    }
}

fn resolve_for_image(version: &Version, resolver: &dyn WriterResolver) -> Option<Version> {
    if version.state != VersionState::Provisional {
        return Some(version.clone());
    }
    match resolver.status(version.writer) {
        WriterStatus::Aborted => None,
        WriterStatus::Active { .. } => Some(version.clone()),
        WriterStatus::Committed { commit_lsn } => Some(Version {
            state: VersionState::Committed { commit_lsn },
            ..version.clone()
        }),
    }
}
