//! Per-transaction rollback logs.
//!
//! Every write a transaction makes pushes one entry naming the version it
//! created. Commit walks the entries to mark those versions committed;
//! abort walks them newest-first to remove them. Entries are kept in memory
//! until they exceed the spill threshold, after which whole blocks are
//! appended to a side file named after the owning transaction. The order of
//! entries (in memory, and block order in the side file) is the backward
//! chain used by undo.

use crate::error::{CoreError, CoreResult};
use crate::types::{DictId, Lsn, TxnId};
use rangedb_storage::{BackendProvider, StorageBackend};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Approximate per-entry overhead counted against the spill threshold.
const ENTRY_OVERHEAD: usize = 4 + 8 + 8 + 4;

/// One undoable write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackEntry {
    /// Dictionary written.
    pub dict: DictId,
    /// Key written.
    pub key: Vec<u8>,
    /// LSN of the log record that created the version.
    pub lsn: Lsn,
    /// Transaction that performed the write (may be a merged child).
    pub writer: TxnId,
}

impl RollbackEntry {
    fn size(&self) -> usize {
        ENTRY_OVERHEAD + self.key.len()
    }

    fn encode_block(entries: &[Self]) -> CoreResult<Vec<u8>> {
        let mut block = Vec::new();
        ciborium::into_writer(entries, &mut block).map_err(|e| CoreError::codec(e.to_string()))?;
        Ok(block)
    }

    fn decode_block(data: &[u8]) -> CoreResult<Vec<Self>> {
        ciborium::from_reader(data)
            .map_err(|e| CoreError::corruption(format!("rollback spill block: {e}")))
    }
}

#[derive(Debug, Clone, Copy)]
struct SpillBlock {
    offset: u64,
    len: usize,
}

/// Returns the provider name of a transaction's spill file.
#[must_use]
pub fn spill_file_name(owner: TxnId) -> String {
    format!("rollback/txn{}.spill", owner.as_u64())
}

/// Ordered undo information for one transaction.
pub struct RollbackLog {
    owner: TxnId,
    provider: Arc<dyn BackendProvider>,
    threshold: usize,
    memory: Vec<RollbackEntry>,
    memory_bytes: usize,
    blocks: Vec<SpillBlock>,
    spill: Option<Box<dyn StorageBackend>>,
    total: u64,
}

impl fmt::Debug for RollbackLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RollbackLog")
            .field("owner", &self.owner)
            .field("entries", &self.total)
            .field("spilled_blocks", &self.blocks.len())
            .finish_non_exhaustive()
    }
}

impl RollbackLog {
    /// Creates an empty log for `owner`.
    pub fn new(owner: TxnId, provider: Arc<dyn BackendProvider>, threshold: usize) -> Self {
        Self {
            owner,
            provider,
            threshold,
            memory: Vec::new(),
            memory_bytes: 0,
            blocks: Vec::new(),
            spill: None,
            total: 0,
        }
    }

    /// Returns the number of entries.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.total
    }

    /// Returns true if nothing was logged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Returns true if some entries live in the side file.
    #[must_use]
    pub fn has_spilled(&self) -> bool {
        !self.blocks.is_empty()
    }

    /// Appends an entry. Returns true if the push spilled a block.
    ///
    /// # Errors
    ///
    /// Returns an error if the side file cannot be written.
    pub fn push(&mut self, entry: RollbackEntry) -> CoreResult<bool> {
        self.memory_bytes += entry.size();
        self.memory.push(entry);
        self.total += 1;
        if self.memory_bytes > self.threshold {
            self.spill_memory()?;
            return Ok(true);
        }
        Ok(false)
    }

    fn spill_memory(&mut self) -> CoreResult<()> {
        if self.memory.is_empty() {
            return Ok(());
        }
        let block = RollbackEntry::encode_block(&self.memory)?;
        if self.spill.is_none() {
            self.spill = Some(self.provider.open(&spill_file_name(self.owner))?);
        }
        if let Some(spill) = self.spill.as_mut() {
            let offset = spill.append(&block)?;
            spill.flush()?;
            self.blocks.push(SpillBlock {
                offset,
                len: block.len(),
            });
        }
        debug!(
            txn = %self.owner,
            entries = self.memory.len(),
            bytes = block.len(),
            "rollback log spilled"
        );
        self.memory.clear();
        self.memory_bytes = 0;
        Ok(())
    }

    fn read_block(&self, block: SpillBlock) -> CoreResult<Vec<RollbackEntry>> {
        let spill = self
            .spill
            .as_ref()
            .ok_or_else(|| CoreError::corruption("rollback spill file missing"))?;
        RollbackEntry::decode_block(&spill.read_at(block.offset, block.len)?)
    }

    /// Visits every entry, oldest first.
    ///
    /// # Errors
    ///
    /// Propagates spill read failures and errors from `visit`.
    pub fn for_each_oldest_first<F>(&self, mut visit: F) -> CoreResult<()>
    where
        F: FnMut(&RollbackEntry) -> CoreResult<()>,
    {
        for block in &self.blocks {
            for entry in self.read_block(*block)? {
                visit(&entry)?;
            }
        }
        for entry in &self.memory {
            visit(entry)?;
        }
        Ok(())
    }

    /// Visits every entry, newest first.
    ///
    /// # Errors
    ///
    /// Propagates spill read failures and errors from `visit`.
    pub fn for_each_newest_first<F>(&self, mut visit: F) -> CoreResult<()>
    where
        F: FnMut(&RollbackEntry) -> CoreResult<()>,
    {
        for entry in self.memory.iter().rev() {
            visit(entry)?;
        }
        for block in self.blocks.iter().rev() {
            for entry in self.read_block(*block)?.iter().rev() {
                visit(entry)?;
            }
        }
        Ok(())
    }

    /// Appends all of `child`'s entries (oldest first) and discards the child.
    ///
    /// # Errors
    ///
    /// Returns an error if spilling or reading spilled blocks fails.
    pub fn absorb(&mut self, child: Self) -> CoreResult<u64> {
        let mut spills = 0;
        let mut moved = Vec::new();
        child.for_each_oldest_first(|entry| {
            moved.push(entry.clone());
            Ok(())
        })?;
        for entry in moved {
            if self.push(entry)? {
                spills += 1;
            }
        }
        child.discard()?;
        Ok(spills)
    }

    /// Drops the log and removes its side file.
    ///
    /// # Errors
    ///
    /// Returns an error if the side file cannot be removed.
    pub fn discard(self) -> CoreResult<()> {
        if self.spill.is_some() {
            drop(self.spill);
            self.provider.remove(&spill_file_name(self.owner))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rangedb_storage::MemoryProvider;

    fn entry(n: u64) -> RollbackEntry {
        RollbackEntry {
            dict: DictId(1),
            key: format!("key{n:04}").into_bytes(),
            lsn: Lsn(n),
            writer: TxnId(7),
        }
    }

    fn collect_newest(log: &RollbackLog) -> Vec<u64> {
        let mut out = Vec::new();
        log.for_each_newest_first(|e| {
            out.push(e.lsn.0);
            Ok(())
        })
        .unwrap();
        out
    }

    #[test]
    fn in_memory_order() {
        let provider = Arc::new(MemoryProvider::new());
        let mut log = RollbackLog::new(TxnId(7), provider, 1 << 20);
        for n in 1..=5 {
            assert!(!log.push(entry(n)).unwrap());
        }
        assert_eq!(log.len(), 5);
        assert_eq!(collect_newest(&log), vec![5, 4, 3, 2, 1]);
        assert!(!log.has_spilled());
    }

    #[test]
    fn spilled_entries_keep_order() {
        let provider = MemoryProvider::new();
        let mut log = RollbackLog::new(TxnId(7), Arc::new(provider.clone()), 100);
        for n in 1..=20 {
            log.push(entry(n)).unwrap();
        }
        assert!(log.has_spilled());
        assert!(provider.exists(&spill_file_name(TxnId(7))));
        assert_eq!(collect_newest(&log), (1..=20).rev().collect::<Vec<_>>());

        log.discard().unwrap();
        assert!(!provider.exists(&spill_file_name(TxnId(7))));
    }

    #[test]
    fn absorb_appends_child_entries_after_parent() {
        let provider = MemoryProvider::new();
        let shared: Arc<dyn BackendProvider> = Arc::new(provider.clone());
        let mut parent = RollbackLog::new(TxnId(1), Arc::clone(&shared), 100);
        let mut child = RollbackLog::new(TxnId(2), shared, 100);
        for n in 1..=3 {
            parent.push(entry(n)).unwrap();
        }
        for n in 4..=15 {
            child.push(entry(n)).unwrap();
        }
        assert!(child.has_spilled());

        parent.absorb(child).unwrap();
        assert_eq!(parent.len(), 15);
        assert_eq!(collect_newest(&parent), (1..=15).rev().collect::<Vec<_>>());
        assert!(!provider.exists(&spill_file_name(TxnId(2))));
    }

    #[test]
    fn truncated_block_is_corruption() {
        let mut raw = RollbackEntry::encode_block(&[entry(1), entry(2)]).unwrap();
        raw.pop();
        assert!(matches!(
            RollbackEntry::decode_block(&raw),
            Err(CoreError::Corruption { .. })
        ));
    }

    #[test]
    fn block_round_trips_long_keys() {
        let long = RollbackEntry {
            key: vec![0xab; 70_000],
            ..entry(9)
        };
        let raw = RollbackEntry::encode_block(&[entry(1), long.clone()]).unwrap();
        assert_eq!(
            RollbackEntry::decode_block(&raw).unwrap(),
            vec![entry(1), long]
        );
    }
}
