//! Bulk loading and online index builds.
//!
//! Both run inside a caller transaction holding a whole-table write lock on
//! each destination, and both write through the ordinary transactional
//! path, so aborting the transaction undoes every row they wrote. Any
//! failure aborts the transaction itself.

use crate::db::Db;
use crate::env::{EnvCore, Environment};
use crate::error::{CoreError, CoreResult};
use crate::mvcc::ReadView;
use crate::types::TxnId;
use rangedb_storage::StorageBackend;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A row produced by a [`RowTransform`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformedRow {
    /// Index of the destination dictionary in the list given to the loader
    /// or indexer.
    pub dest: usize,
    /// Destination key.
    pub key: Vec<u8>,
    /// Destination value.
    pub value: Vec<u8>,
}

impl TransformedRow {
    /// A row for the destination at `dest`.
    pub fn new(dest: usize, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            dest,
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Maps one source row to destination rows.
pub trait RowTransform: Send + Sync {
    /// Produces the destination rows for `(key, value)`.
    ///
    /// # Errors
    ///
    /// Any error aborts the load.
    fn transform(&self, key: &[u8], value: &[u8]) -> CoreResult<Vec<TransformedRow>>;
}

impl<F> RowTransform for F
where
    F: Fn(&[u8], &[u8]) -> CoreResult<Vec<TransformedRow>> + Send + Sync,
{
    fn transform(&self, key: &[u8], value: &[u8]) -> CoreResult<Vec<TransformedRow>> {
        self(key, value)
    }
}

/// Identity transform into a single destination.
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl RowTransform for Identity {
    fn transform(&self, key: &[u8], value: &[u8]) -> CoreResult<Vec<TransformedRow>> {
        Ok(vec![TransformedRow::new(0, key, value)])
    }
}

fn check_dest(row: &TransformedRow, dests: usize) -> CoreResult<()> {
    if row.dest >= dests {
        return Err(CoreError::invalid_argument(format!(
            "transform produced destination {} of {dests}",
            row.dest
        )));
    }
    Ok(())
}

/// Aborts `txn` after a failure; the original error is what the caller sees.
fn abort_after(core: &EnvCore, txn: TxnId, err: &CoreError) {
    warn!(%txn, error = %err, "bulk operation failed; aborting transaction");
    if let Err(abort_err) = core.txns.abort(txn, None) {
        warn!(%txn, error = %abort_err, "abort after bulk failure failed");
    }
}

struct SpillFile {
    name: String,
    backend: Box<dyn StorageBackend>,
}

/// Loads many rows into one or more dictionaries.
///
/// Rows are transformed as they arrive and buffered; once the buffer
/// exceeds `loader_memory_limit` it is spilled to a temporary file.
/// [`BulkLoader::finish`] sorts everything by each destination's
/// comparator and writes it, the last row winning for duplicate keys.
///
/// ```rust,ignore
/// let txn = env.begin(None, IsolationLevel::Serializable)?;
/// let mut loader = BulkLoader::new(&env, txn, &[&users], Identity)?;
/// loader.put(b"alice", b"1")?;
/// loader.finish()?;
/// env.commit(txn)?;
/// ```
pub struct BulkLoader {
    core: Arc<EnvCore>,
    txn: TxnId,
    dests: Vec<Db>,
    transform: Box<dyn RowTransform>,
    buffer: Vec<TransformedRow>,
    buffered_bytes: usize,
    spills: Vec<SpillFile>,
    failed: bool,
}

impl BulkLoader {
    /// Table-locks every destination for `txn` and returns a loader.
    ///
    /// # Errors
    ///
    /// Lock errors; the transaction is aborted.
    pub fn new(
        env: &Environment,
        txn: TxnId,
        dests: &[&Db],
        transform: impl RowTransform + 'static,
    ) -> CoreResult<Self> {
        let core = Arc::clone(env.core());
        if dests.is_empty() {
            return Err(CoreError::invalid_argument("bulk loader needs a destination"));
        }
        let locked: CoreResult<()> = (|| {
            core.ensure_open()?;
            let rec = core.txns.statement(txn)?;
            for db in dests {
                core.txns.lock_table(&rec, db.id(), false)?;
            }
            Ok(())
        })();
        if let Err(err) = locked {
            abort_after(&core, txn, &err);
            return Err(err);
        }
        debug!(%txn, dests = dests.len(), "bulk loader started");
        Ok(Self {
            core,
            txn,
            dests: dests.iter().map(|db| (*db).clone()).collect(),
            transform: Box::new(transform),
            buffer: Vec::new(),
            buffered_bytes: 0,
            spills: Vec::new(),
            failed: false,
        })
    }

    /// Temporary files currently held.
    #[must_use]
    pub fn spill_files(&self) -> Vec<String> {
        self.spills.iter().map(|s| s.name.clone()).collect()
    }

    /// Transforms and buffers one source row.
    ///
    /// # Errors
    ///
    /// Transform errors and spill errors (including
    /// [`CoreError::OutOfSpace`]); the loader's temp files are removed and
    /// the transaction is aborted.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> CoreResult<()> {
        if self.failed {
            return Err(CoreError::invalid_operation("bulk loader already failed"));
        }
        let result = self.put_inner(key, value);
        self.guard(result)
    }

    fn put_inner(&mut self, key: &[u8], value: &[u8]) -> CoreResult<()> {
        for row in self.transform.transform(key, value)? {
            check_dest(&row, self.dests.len())?;
            self.buffered_bytes += row.key.len() + row.value.len();
            self.buffer.push(row);
        }
        if self.buffered_bytes > self.core.config.loader_memory_limit {
            self.spill()?;
        }
        Ok(())
    }

    fn spill(&mut self) -> CoreResult<()> {
        let name = self.core.temp_name("loader");
        let mut backend = self.core.provider.open(&name)?;
        let encoded = encode_rows(&self.buffer)?;
        let written = backend.append(&encoded).and_then(|_| backend.flush());
        // Tracked even when the append failed so cleanup removes it.
        self.spills.push(SpillFile { name, backend });
        written?;
        debug!(rows = self.buffer.len(), bytes = encoded.len(), "loader buffer spilled");
        self.buffer.clear();
        self.buffered_bytes = 0;
        Ok(())
    }

    /// Sorts and writes every buffered row; returns the rows written.
    ///
    /// # Errors
    ///
    /// Read-back and write errors; temp files are removed and the
    /// transaction is aborted.
    pub fn finish(mut self) -> CoreResult<u64> {
        if self.failed {
            return Err(CoreError::invalid_operation("bulk loader already failed"));
        }
        let result = self.finish_inner();
        let result = self.guard(result);
        self.remove_spills();
        result
    }

    fn finish_inner(&mut self) -> CoreResult<u64> {
        let mut per_dest: Vec<Vec<(Vec<u8>, Vec<u8>)>> = vec![Vec::new(); self.dests.len()];
        for spill in &self.spills {
            let size = spill.backend.size()?;
            let raw = spill.backend.read_at(0, usize::try_from(size).map_err(|_| {
                CoreError::invalid_operation("loader spill file too large")
            })?)?;
            for row in decode_rows(&raw)? {
                check_dest(&row, self.dests.len())?;
                per_dest[row.dest].push((row.key, row.value));
            }
        }
        for row in self.buffer.drain(..) {
            per_dest[row.dest].push((row.key, row.value));
        }

        let rec = self.core.txns.statement(self.txn)?;
        let mut written = 0u64;
        for (db, mut rows) in self.dests.iter().zip(per_dest) {
            let chains = self.core.mvcc.dict(db.id())?;
            let cmp = Arc::clone(chains.comparator());
            // Stable sort keeps arrival order among equal keys.
            rows.sort_by(|a, b| cmp.compare(&a.0, &b.0));
            let mut i = 0;
            while i < rows.len() {
                let mut last = i;
                while last + 1 < rows.len()
                    && cmp.compare(&rows[last + 1].0, &rows[i].0).is_eq()
                {
                    last += 1;
                }
                let (key, value) = &rows[last];
                self.core.txns.write(&rec, db.id(), key, Some(value))?;
                written += 1;
                i = last + 1;
            }
        }
        info!(txn = %self.txn, rows = written, spills = self.spills.len(), "bulk load finished");
        Ok(written)
    }

    fn guard<T>(&mut self, result: CoreResult<T>) -> CoreResult<T> {
        if let Err(err) = &result {
            self.failed = true;
            self.buffer.clear();
            self.remove_spills();
            abort_after(&self.core, self.txn, err);
        }
        result
    }

    fn remove_spills(&mut self) {
        for spill in self.spills.drain(..) {
            drop(spill.backend);
            if let Err(err) = self.core.provider.remove(&spill.name) {
                warn!(file = %spill.name, error = %err, "failed to remove loader spill");
            }
        }
    }
}

impl Drop for BulkLoader {
    fn drop(&mut self) {
        self.remove_spills();
    }
}

fn encode_rows(rows: &[TransformedRow]) -> CoreResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::into_writer(rows, &mut out).map_err(|e| CoreError::codec(e.to_string()))?;
    Ok(out)
}

fn decode_rows(raw: &[u8]) -> CoreResult<Vec<TransformedRow>> {
    ciborium::from_reader(raw)
        .map_err(|e| CoreError::corruption(format!("loader spill file: {e}")))
}

/// Builds destination dictionaries from a live source dictionary.
///
/// The source is read at the indexer transaction's snapshot without read
/// locks, so writers to the source keep running while the build proceeds.
pub struct HotIndexer;

impl HotIndexer {
    /// Scans `source` and writes the transformed rows into `dests`;
    /// returns the rows written.
    ///
    /// # Errors
    ///
    /// Lock, transform and write errors; the transaction is aborted.
    pub fn build(
        env: &Environment,
        txn: TxnId,
        source: &Db,
        dests: &[&Db],
        transform: &dyn RowTransform,
    ) -> CoreResult<u64> {
        let core = env.core();
        let result = Self::build_inner(core, txn, source, dests, transform);
        if let Err(err) = &result {
            abort_after(core, txn, err);
        }
        result
    }

    fn build_inner(
        core: &EnvCore,
        txn: TxnId,
        source: &Db,
        dests: &[&Db],
        transform: &dyn RowTransform,
    ) -> CoreResult<u64> {
        core.ensure_open()?;
        if dests.is_empty() {
            return Err(CoreError::invalid_argument("index build needs a destination"));
        }
        let rec = core.txns.statement(txn)?;
        for db in dests {
            core.txns.lock_table(&rec, db.id(), false)?;
        }

        let view = ReadView {
            isolation: rec.isolation,
            snapshot: rec.snapshot(),
            family: &rec.lineage,
        };
        let resolver = core.txns.as_ref();
        let mut from: Option<Vec<u8>> = None;
        let mut written = 0u64;
        while let Some((key, value)) =
            core.mvcc
                .next_visible(source.id(), from.as_deref(), false, &view, resolver)?
        {
            for row in transform.transform(&key, &value)? {
                check_dest(&row, dests.len())?;
                core.txns
                    .write(&rec, dests[row.dest].id(), &row.key, Some(&row.value))?;
                written += 1;
            }
            from = Some(key);
        }
        info!(%txn, source = source.name(), rows = written, "index build finished");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvConfig;
    use crate::types::IsolationLevel;

    fn env(limit: usize) -> Environment {
        Environment::open_in_memory(EnvConfig::default().loader_memory_limit(limit)).unwrap()
    }

    #[test]
    fn loader_sorts_and_keeps_last_duplicate() {
        let env = env(1 << 20);
        let db = env.open_db("t").unwrap();
        let txn = env.begin(None, IsolationLevel::Serializable).unwrap();
        let mut loader = BulkLoader::new(&env, txn, &[&db], Identity).unwrap();
        loader.put(b"b", b"1").unwrap();
        loader.put(b"a", b"1").unwrap();
        loader.put(b"b", b"2").unwrap();
        assert_eq!(loader.finish().unwrap(), 2);
        env.commit(txn).unwrap();

        let reader = env.begin(None, IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(db.get(reader, b"b").unwrap(), Some(b"2".to_vec()));
        env.commit(reader).unwrap();
    }

    #[test]
    fn loader_spills_and_reads_back() {
        let env = env(16);
        let db = env.open_db("t").unwrap();
        let txn = env.begin(None, IsolationLevel::Serializable).unwrap();
        let mut loader = BulkLoader::new(&env, txn, &[&db], Identity).unwrap();
        for n in 0..50u32 {
            loader.put(&n.to_be_bytes(), b"value").unwrap();
        }
        assert!(!loader.spill_files().is_empty());
        assert_eq!(loader.finish().unwrap(), 50);
        env.commit(txn).unwrap();
        assert!(env.core().provider.list("tmp/").unwrap().is_empty());
        assert_eq!(db.key_count().unwrap(), 50);
    }

    #[test]
    fn transform_error_aborts_transaction() {
        let env = env(1 << 20);
        let db = env.open_db("t").unwrap();
        let txn = env.begin(None, IsolationLevel::Serializable).unwrap();
        let failing = |key: &[u8], value: &[u8]| {
            if key == b"bad" {
                Err(CoreError::invalid_argument("bad row"))
            } else {
                Ok(vec![TransformedRow::new(0, key, value)])
            }
        };
        let mut loader = BulkLoader::new(&env, txn, &[&db], failing).unwrap();
        loader.put(b"ok", b"1").unwrap();
        assert!(loader.put(b"bad", b"1").is_err());
        assert!(loader.put(b"more", b"1").is_err());
        assert_eq!(env.txn_state(txn), None);
    }

    #[test]
    fn index_build_undone_by_abort() {
        let env = env(1 << 20);
        let source = env.open_db("users").unwrap();
        let index = env.open_db("users_by_value").unwrap();
        env.transaction(IsolationLevel::Serializable, |txn| {
            source.put(txn, b"alice", b"30")?;
            source.put(txn, b"bob", b"25")
        })
        .unwrap();

        let txn = env.begin(None, IsolationLevel::SnapshotRepeatableRead).unwrap();
        let by_value = |key: &[u8], value: &[u8]| {
            let mut index_key = value.to_vec();
            index_key.extend_from_slice(key);
            Ok::<_, CoreError>(vec![TransformedRow::new(0, index_key, key)])
        };
        assert_eq!(HotIndexer::build(&env, txn, &source, &[&index], &by_value).unwrap(), 2);
        assert_eq!(
            index.get(txn, b"25bob").unwrap(),
            Some(b"bob".to_vec())
        );
        env.abort(txn).unwrap();

        let reader = env.begin(None, IsolationLevel::ReadCommitted).unwrap();
        assert!(index.cursor(reader).first().unwrap().is_none());
        env.commit(reader).unwrap();
    }

    #[test]
    fn spill_codec_rejects_truncation() {
        let rows = vec![
            TransformedRow::new(1, b"key".to_vec(), b"value".to_vec()),
            TransformedRow::new(0, b"other".to_vec(), Vec::new()),
        ];
        let mut raw = encode_rows(&rows).unwrap();
        assert_eq!(decode_rows(&raw).unwrap(), rows);
        raw.pop();
        assert!(matches!(
            decode_rows(&raw),
            Err(CoreError::Corruption { .. })
        ));
    }
}
