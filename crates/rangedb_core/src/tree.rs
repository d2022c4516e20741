//! Tree layer seam used by checkpoints and recovery.
//!
//! The engine does not own a page format. Checkpoints hand the tree layer
//! whole version chains and ask it to make everything staged so far
//! durable; recovery reads the last durable image back. [`ImageTreeStore`]
//! is the bundled implementation: it keeps chains in memory and persists
//! them as a single CBOR image replaced atomically on every flush.

use crate::error::{CoreError, CoreResult};
use crate::mvcc::{Version, VersionChain};
use crate::types::{DictId, Lsn};
use parking_lot::Mutex;
use rangedb_storage::BackendProvider;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Name of the durable image.
pub const IMAGE_FILE: &str = "tree.img";
/// Name the image is written under before being renamed into place.
pub const IMAGE_TEMP_FILE: &str = "tree.img.tmp";

const IMAGE_FORMAT_VERSION: u16 = 1;

/// A dictionary known to the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Dictionary id.
    pub id: DictId,
    /// Dictionary name.
    pub name: String,
    /// Name of the key comparator.
    pub comparator: String,
}

/// Name → dictionary mapping persisted with each image.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Catalog {
    /// Live dictionaries.
    pub dicts: Vec<CatalogEntry>,
    /// Next id to assign.
    pub next_id: u32,
}

impl Catalog {
    /// Looks up a dictionary by name.
    #[must_use]
    pub fn by_name(&self, name: &str) -> Option<&CatalogEntry> {
        self.dicts.iter().find(|entry| entry.name == name)
    }

    /// Looks up a dictionary by id.
    #[must_use]
    pub fn by_id(&self, id: DictId) -> Option<&CatalogEntry> {
        self.dicts.iter().find(|entry| entry.id == id)
    }

    /// Adds an entry; replays of the same create are ignored.
    pub fn insert(&mut self, entry: CatalogEntry) {
        self.next_id = self.next_id.max(entry.id.0 + 1);
        if self.by_id(entry.id).is_none() {
            self.dicts.push(entry);
        }
    }

    /// Removes a dictionary.
    pub fn remove(&mut self, id: DictId) -> Option<CatalogEntry> {
        let pos = self.dicts.iter().position(|entry| entry.id == id)?;
        Some(self.dicts.remove(pos))
    }

    /// Reserves the next dictionary id.
    pub fn allocate(&mut self) -> DictId {
        let id = DictId(self.next_id.max(1));
        self.next_id = id.0 + 1;
        id
    }
}

/// Everything recovery needs from the tree layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeSnapshot {
    /// LSN passed to the last successful flush.
    pub flushed_lsn: Lsn,
    /// Dictionary catalog at that flush.
    pub catalog: Catalog,
    /// Every stored chain, newest version first.
    pub chains: Vec<(DictId, Vec<u8>, Vec<Version>)>,
}

/// Persistence interface between the engine and the tree layer.
pub trait TreeStore: Send + Sync {
    /// Stages one version of a key.
    fn store_version(&self, dict: DictId, key: &[u8], version: &Version) -> CoreResult<()>;

    /// Stages a key's whole chain; `None` removes the key.
    fn store_chain(&self, dict: DictId, key: &[u8], versions: Option<&[Version]>)
        -> CoreResult<()>;

    /// Returns the staged chain of a key.
    fn load_versions(&self, dict: DictId, key: &[u8]) -> CoreResult<Option<VersionChain>>;

    /// Stages the dictionary catalog.
    fn store_catalog(&self, catalog: &Catalog) -> CoreResult<()>;

    /// Makes everything staged so far durable as of `upto_lsn`.
    fn flush_dirty_nodes(&self, upto_lsn: Lsn) -> CoreResult<()>;

    /// Reads the last durable state.
    fn load(&self) -> CoreResult<TreeSnapshot>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TreeImage {
    format_version: u16,
    flushed_lsn: Lsn,
    catalog: Catalog,
    dicts: BTreeMap<DictId, BTreeMap<Vec<u8>, Vec<Version>>>,
}

/// Tree store persisting a CBOR image through a [`BackendProvider`].
pub struct ImageTreeStore {
    provider: Arc<dyn BackendProvider>,
    staged: Mutex<TreeImage>,
}

impl ImageTreeStore {
    /// Opens the store, loading any durable image into the staging area.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Codec`] if the image cannot be decoded.
    pub fn open(provider: Arc<dyn BackendProvider>) -> CoreResult<Self> {
        let staged = read_image(provider.as_ref())?.unwrap_or_default();
        Ok(Self {
            provider,
            staged: Mutex::new(staged),
        })
    }
}

fn read_image(provider: &dyn BackendProvider) -> CoreResult<Option<TreeImage>> {
    if !provider.exists(IMAGE_FILE) {
        return Ok(None);
    }
    let backend = provider.open(IMAGE_FILE)?;
    let size = backend.size()?;
    if size == 0 {
        return Ok(None);
    }
    let len = usize::try_from(size)
        .map_err(|_| CoreError::corruption("tree image larger than address space"))?;
    let bytes = backend.read_at(0, len)?;
    let image: TreeImage =
        ciborium::from_reader(bytes.as_slice()).map_err(|e| CoreError::codec(e.to_string()))?;
    if image.format_version != IMAGE_FORMAT_VERSION {
        return Err(CoreError::corruption(format!(
            "unsupported tree image version {}",
            image.format_version
        )));
    }
    Ok(Some(image))
}

impl TreeStore for ImageTreeStore {
    fn store_version(&self, dict: DictId, key: &[u8], version: &Version) -> CoreResult<()> {
        let mut staged = self.staged.lock();
        let chain = staged
            .dicts
            .entry(dict)
            .or_default()
            .entry(key.to_vec())
            .or_default();
        chain.retain(|existing| existing.lsn != version.lsn);
        let pos = chain
            .iter()
            .position(|existing| existing.lsn < version.lsn)
            .unwrap_or(chain.len());
        chain.insert(pos, version.clone());
        Ok(())
    }

    fn store_chain(
        &self,
        dict: DictId,
        key: &[u8],
        versions: Option<&[Version]>,
    ) -> CoreResult<()> {
        let mut staged = self.staged.lock();
        match versions {
            Some(versions) if !versions.is_empty() => {
                staged
                    .dicts
                    .entry(dict)
                    .or_default()
                    .insert(key.to_vec(), versions.to_vec());
            }
            _ => {
                if let Some(keys) = staged.dicts.get_mut(&dict) {
                    keys.remove(key);
                }
            }
        }
        Ok(())
    }

    fn load_versions(&self, dict: DictId, key: &[u8]) -> CoreResult<Option<VersionChain>> {
        let staged = self.staged.lock();
        Ok(staged
            .dicts
            .get(&dict)
            .and_then(|keys| keys.get(key))
            .map(|versions| VersionChain::from_newest_first(versions.clone())))
    }

    fn store_catalog(&self, catalog: &Catalog) -> CoreResult<()> {
        let mut staged = self.staged.lock();
        staged
            .dicts
            .retain(|dict, _| catalog.by_id(*dict).is_some());
        staged.catalog = catalog.clone();
        Ok(())
    }

    fn flush_dirty_nodes(&self, upto_lsn: Lsn) -> CoreResult<()> {
        let bytes = {
            let mut staged = self.staged.lock();
            staged.format_version = IMAGE_FORMAT_VERSION;
            staged.flushed_lsn = upto_lsn;
            let mut bytes = Vec::new();
            ciborium::into_writer(&*staged, &mut bytes)
                .map_err(|e| CoreError::codec(e.to_string()))?;
            bytes
        };

        if self.provider.exists(IMAGE_TEMP_FILE) {
            self.provider.remove(IMAGE_TEMP_FILE)?;
        }
        let mut temp = self.provider.open(IMAGE_TEMP_FILE)?;
        temp.append(&bytes)?;
        temp.sync()?;
        drop(temp);
        self.provider.rename(IMAGE_TEMP_FILE, IMAGE_FILE)?;
        debug!(upto = upto_lsn.0, bytes = bytes.len(), "tree image written");
        Ok(())
    }

    fn load(&self) -> CoreResult<TreeSnapshot> {
        let Some(image) = read_image(self.provider.as_ref())? else {
            return Ok(TreeSnapshot::default());
        };
        let mut chains = Vec::new();
        for (dict, keys) in image.dicts {
            for (key, versions) in keys {
                chains.push((dict, key, versions));
            }
        }
        Ok(TreeSnapshot {
            flushed_lsn: image.flushed_lsn,
            catalog: image.catalog,
            chains,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mvcc::VersionState;
    use crate::types::TxnId;
    use rangedb_storage::MemoryProvider;

    fn version(lsn: u64, value: &[u8]) -> Version {
        Version {
            value: Some(value.to_vec()),
            writer: TxnId(1),
            lsn: Lsn(lsn),
            state: VersionState::Committed {
                commit_lsn: Lsn(lsn + 1),
            },
        }
    }

    fn catalog() -> Catalog {
        let mut catalog = Catalog::default();
        let id = catalog.allocate();
        catalog.insert(CatalogEntry {
            id,
            name: "users".into(),
            comparator: "bytewise".into(),
        });
        catalog
    }

    #[test]
    fn staged_state_is_invisible_until_flushed() {
        let provider = Arc::new(MemoryProvider::new());
        let store = ImageTreeStore::open(provider.clone()).unwrap();
        store.store_catalog(&catalog()).unwrap();
        store.store_version(DictId(1), b"k", &version(3, b"a")).unwrap();
        assert!(store.load().unwrap().chains.is_empty());

        store.flush_dirty_nodes(Lsn(10)).unwrap();
        let snapshot = store.load().unwrap();
        assert_eq!(snapshot.flushed_lsn, Lsn(10));
        assert_eq!(snapshot.catalog.by_name("users").unwrap().id, DictId(1));
        assert_eq!(snapshot.chains.len(), 1);
        assert!(!provider.exists(IMAGE_TEMP_FILE));

        let reopened = ImageTreeStore::open(provider).unwrap();
        let chain = reopened.load_versions(DictId(1), b"k").unwrap().unwrap();
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn store_version_keeps_newest_first() {
        let store = ImageTreeStore::open(Arc::new(MemoryProvider::new())).unwrap();
        store.store_version(DictId(1), b"k", &version(5, b"b")).unwrap();
        store.store_version(DictId(1), b"k", &version(3, b"a")).unwrap();
        store.store_version(DictId(1), b"k", &version(5, b"b")).unwrap();
        let chain = store.load_versions(DictId(1), b"k").unwrap().unwrap();
        let lsns: Vec<Lsn> = chain.iter().map(|v| v.lsn).collect();
        assert_eq!(lsns, vec![Lsn(5), Lsn(3)]);
    }

    #[test]
    fn store_chain_none_removes_key() {
        let store = ImageTreeStore::open(Arc::new(MemoryProvider::new())).unwrap();
        store
            .store_chain(DictId(1), b"k", Some(&[version(3, b"a")]))
            .unwrap();
        store.store_chain(DictId(1), b"k", None).unwrap();
        assert!(store.load_versions(DictId(1), b"k").unwrap().is_none());
    }

    #[test]
    fn catalog_drops_removed_dictionaries() {
        let store = ImageTreeStore::open(Arc::new(MemoryProvider::new())).unwrap();
        store.store_version(DictId(7), b"k", &version(3, b"a")).unwrap();
        store.store_catalog(&catalog()).unwrap();
        assert!(store.load_versions(DictId(7), b"k").unwrap().is_none());
    }

    #[test]
    fn garbage_image_is_a_codec_error() {
        let provider = Arc::new(MemoryProvider::new());
        provider.open(IMAGE_FILE).unwrap().append(b"not cbor").unwrap();
        assert!(ImageTreeStore::open(provider).is_err());
    }
}
