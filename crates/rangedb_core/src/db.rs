//! Dictionary and cursor handles.
//!
//! Every data operation runs as one statement of a transaction: it takes
//! the locks its isolation level needs, then reads or writes the version
//! chains through the transaction manager.

use crate::env::EnvCore;
use crate::error::{CoreError, CoreResult};
use crate::locktree::{KeyBound, KeyRange};
use crate::mvcc::ReadView;
use crate::txn::TxnRecord;
use crate::types::{DictId, IsolationLevel, LockMode, Lsn, TxnId};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Cursor steps retried before a range read gives up on a stable answer.
const MAX_STEP_RETRIES: usize = 16;

/// Handle to one dictionary of an environment.
#[derive(Clone)]
pub struct Db {
    core: Arc<EnvCore>,
    id: DictId,
    name: Arc<str>,
}

impl fmt::Debug for Db {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Db")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

impl Db {
    pub(crate) fn new(core: Arc<EnvCore>, id: DictId, name: &str) -> Self {
        Self {
            core,
            id,
            name: Arc::from(name),
        }
    }

    /// Dictionary id.
    #[must_use]
    pub fn id(&self) -> DictId {
        self.id
    }

    /// Dictionary name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn statement(&self, txn: TxnId) -> CoreResult<Arc<TxnRecord>> {
        self.core.ensure_open()?;
        self.core.txns.statement(txn)
    }

    /// Whether reads by `rec` take range locks.
    fn locks_reads(&self, rec: &TxnRecord) -> bool {
        rec.isolation.locks_reads() && !self.core.txns.holds_table_lock(rec, self.id)
    }

    fn lock(&self, rec: &TxnRecord, range: KeyRange, mode: LockMode) -> CoreResult<()> {
        if self.core.txns.holds_table_lock(rec, self.id) {
            return Ok(());
        }
        self.core.txns.lock(rec, self.id, range, mode, false)
    }

    fn view<'a>(rec: &'a TxnRecord) -> ReadView<'a> {
        ReadView {
            isolation: rec.isolation,
            snapshot: rec.snapshot(),
            family: &rec.lineage,
        }
    }

    /// Everything committed so far plus the family's own writes. Used for
    /// existence checks made while holding the key's write lock.
    fn latest_view<'a>(rec: &'a TxnRecord) -> ReadView<'a> {
        ReadView {
            isolation: IsolationLevel::ReadCommitted,
            snapshot: Lsn(u64::MAX),
            family: &rec.lineage,
        }
    }

    /// Reads the value of `key` visible to `txn`.
    ///
    /// # Errors
    ///
    /// Lock errors under `Serializable`, and
    /// [`CoreError::DictionaryNotFound`] once the dictionary is removed.
    pub fn get(&self, txn: TxnId, key: &[u8]) -> CoreResult<Option<Vec<u8>>> {
        let rec = self.statement(txn)?;
        if self.locks_reads(&rec) {
            self.core
                .txns
                .lock(&rec, self.id, KeyRange::point(key), LockMode::Read, false)?;
        }
        self.core
            .mvcc
            .read(self.id, key, &Self::view(&rec), self.core.txns.as_ref())
    }

    /// Writes `value` under `key`, replacing any existing value.
    ///
    /// # Errors
    ///
    /// Lock errors, log errors, and [`CoreError::InvalidOperation`] once
    /// the transaction has started to commit or abort.
    pub fn put(&self, txn: TxnId, key: &[u8], value: &[u8]) -> CoreResult<()> {
        let rec = self.statement(txn)?;
        self.lock(&rec, KeyRange::point(key), LockMode::Write)?;
        self.core.txns.write(&rec, self.id, key, Some(value))?;
        Ok(())
    }

    /// Writes `value` under `key` only if no value is there.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::KeyExists`] if the key already has a value,
    /// plus the errors of [`Db::put`].
    pub fn put_unique(&self, txn: TxnId, key: &[u8], value: &[u8]) -> CoreResult<()> {
        let rec = self.statement(txn)?;
        self.lock(&rec, KeyRange::point(key), LockMode::Write)?;
        if self.exists_latest(&rec, key)? {
            return Err(CoreError::KeyExists { dict: self.id });
        }
        self.core.txns.write(&rec, self.id, key, Some(value))?;
        Ok(())
    }

    /// Deletes `key`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::KeyNotFound`] if the key has no value, plus the
    /// errors of [`Db::put`].
    pub fn delete(&self, txn: TxnId, key: &[u8]) -> CoreResult<()> {
        let rec = self.statement(txn)?;
        self.lock(&rec, KeyRange::point(key), LockMode::Write)?;
        if !self.exists_latest(&rec, key)? {
            return Err(CoreError::KeyNotFound { dict: self.id });
        }
        self.core.txns.write(&rec, self.id, key, None)?;
        Ok(())
    }

    fn exists_latest(&self, rec: &TxnRecord, key: &[u8]) -> CoreResult<bool> {
        Ok(self
            .core
            .mvcc
            .read(self.id, key, &Self::latest_view(rec), self.core.txns.as_ref())?
            .is_some())
    }

    /// Locks `range` for `txn`, waiting if needed.
    ///
    /// # Errors
    ///
    /// [`CoreError::Deadlock`] or [`CoreError::LockTimeout`];
    /// [`CoreError::InvalidArgument`] for an empty range.
    pub fn lock_range(&self, txn: TxnId, range: KeyRange, mode: LockMode) -> CoreResult<()> {
        self.lock_range_inner(txn, range, mode, false)
    }

    /// Locks `range` for `txn` without waiting.
    ///
    /// # Errors
    ///
    /// [`CoreError::LockNotGranted`] if another family holds a conflicting
    /// range.
    pub fn try_lock_range(&self, txn: TxnId, range: KeyRange, mode: LockMode) -> CoreResult<()> {
        self.lock_range_inner(txn, range, mode, true)
    }

    fn lock_range_inner(
        &self,
        txn: TxnId,
        range: KeyRange,
        mode: LockMode,
        nowait: bool,
    ) -> CoreResult<()> {
        let rec = self.statement(txn)?;
        let chains = self.core.mvcc.dict(self.id)?;
        if !range.is_valid(chains.comparator().as_ref()) {
            return Err(CoreError::invalid_argument("range low bound exceeds high bound"));
        }
        self.core.txns.lock(&rec, self.id, range, mode, nowait)
    }

    /// Opens a cursor for `txn`.
    #[must_use]
    pub fn cursor(&self, txn: TxnId) -> Cursor {
        Cursor {
            db: self.clone(),
            txn,
            position: None,
        }
    }

    /// Number of keys with at least one version, visible or not.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DictionaryNotFound`] once removed.
    pub fn key_count(&self) -> CoreResult<usize> {
        Ok(self.core.mvcc.dict(self.id)?.key_count())
    }
}

/// An ordered scan over one dictionary inside a transaction.
///
/// Under `Serializable` every step read-locks the gap it crossed, so a
/// concurrent insert into a range the cursor has seen blocks until this
/// transaction ends.
#[derive(Debug)]
pub struct Cursor {
    db: Db,
    txn: TxnId,
    position: Option<Vec<u8>>,
}

/// A key and its value.
pub type Entry = (Vec<u8>, Vec<u8>);

impl Cursor {
    /// Current key, if the cursor is positioned.
    #[must_use]
    pub fn key(&self) -> Option<&[u8]> {
        self.position.as_deref()
    }

    /// Moves to the first key.
    ///
    /// # Errors
    ///
    /// Lock errors under `Serializable`.
    pub fn first(&mut self) -> CoreResult<Option<Entry>> {
        self.step(None, true)
    }

    /// Moves to the first key at or after `key`.
    ///
    /// # Errors
    ///
    /// Lock errors under `Serializable`.
    pub fn seek(&mut self, key: &[u8]) -> CoreResult<Option<Entry>> {
        self.step(Some(key.to_vec()), true)
    }

    /// Moves past the current key; from an unpositioned cursor this is
    /// [`Cursor::first`].
    ///
    /// # Errors
    ///
    /// Lock errors under `Serializable`.
    pub fn next(&mut self) -> CoreResult<Option<Entry>> {
        match self.position.clone() {
            None => self.first(),
            Some(current) => self.step(Some(current), false),
        }
    }

    fn step(&mut self, from: Option<Vec<u8>>, inclusive: bool) -> CoreResult<Option<Entry>> {
        let db = &self.db;
        let rec = db.statement(self.txn)?;
        let view = Db::view(&rec);
        let resolver = db.core.txns.as_ref();
        let locking = db.locks_reads(&rec);

        let low = from.clone().map_or(KeyBound::NegInf, KeyBound::Key);
        let mut found =
            db.core
                .mvcc
                .next_visible(db.id, from.as_deref(), inclusive, &view, resolver)?;
        if locking {
            let mut attempts = 0;
            loop {
                let high = found
                    .as_ref()
                    .map_or(KeyBound::PosInf, |(key, _)| KeyBound::Key(key.clone()));
                db.core.txns.lock(
                    &rec,
                    db.id,
                    KeyRange::span(low.clone(), high),
                    LockMode::Read,
                    false,
                )?;
                let again =
                    db.core
                        .mvcc
                        .next_visible(db.id, from.as_deref(), inclusive, &view, resolver)?;
                if again == found {
                    break;
                }
                attempts += 1;
                if attempts >= MAX_STEP_RETRIES {
                    return Err(CoreError::invalid_operation(
                        "cursor step did not stabilize",
                    ));
                }
                found = again;
            }
        }

        match &found {
            Some((key, _)) => self.position = Some(key.clone()),
            None => self.position = from,
        }
        Ok(found)
    }

    /// Collects every live pair in `[low, high]`.
    ///
    /// Under `Serializable` the whole span is read-locked up front.
    ///
    /// # Errors
    ///
    /// Lock errors, and [`CoreError::InvalidArgument`] for an empty span.
    pub fn collect_range(&mut self, low: KeyBound, high: KeyBound) -> CoreResult<Vec<Entry>> {
        let db = &self.db;
        let rec = db.statement(self.txn)?;
        let chains = db.core.mvcc.dict(db.id)?;
        let cmp = chains.comparator().as_ref();
        let range = KeyRange::span(low.clone(), high.clone());
        if !range.is_valid(cmp) {
            return Err(CoreError::invalid_argument("range low bound exceeds high bound"));
        }
        if db.locks_reads(&rec) {
            db.core.txns.lock(&rec, db.id, range, LockMode::Read, false)?;
        }

        let view = Db::view(&rec);
        let resolver = db.core.txns.as_ref();
        let (mut from, mut inclusive) = match &low {
            KeyBound::NegInf => (None, true),
            KeyBound::Key(key) => (Some(key.clone()), true),
            KeyBound::PosInf => return Ok(Vec::new()),
        };

        let mut out = Vec::new();
        while let Some((key, value)) =
            db.core
                .mvcc
                .next_visible(db.id, from.as_deref(), inclusive, &view, resolver)?
        {
            if KeyBound::Key(key.clone()).compare(&high, cmp) == Ordering::Greater {
                break;
            }
            from = Some(key.clone());
            inclusive = false;
            out.push((key, value));
        }
        if let Some((key, _)) = out.last() {
            self.position = Some(key.clone());
        }
        Ok(out)
    }
}
