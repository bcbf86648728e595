//! The transaction table.
//!
//! One entry per transaction the engine knows about, keyed by local id. At
//! runtime an entry mirrors its live [`Transaction`]; during recovery the
//! entry is the only record of a logged transaction, and a single
//! [`RecoveryCursor`] takes on the identity of each entry in turn.
//!
//! Ids grow monotonically within a boot and restart above the largest
//! logged id, so the map's key order is the begin order the recovery
//! queries depend on.

use super::recovery::RecoveryCursor;
use super::state::{TransactionKind, XactState, XactStatus};
use super::transaction::{Transaction, XactContext};
use crate::error::{CoreError, CoreResult};
use crate::log::{decode_gid, encode_gid, read_compressed_int, write_compressed_int};
use crate::types::{ByteReader, GlobalTransactionId, LogInstant, TransactionId};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Weak;

/// A table entry.
#[derive(Debug, Clone)]
pub(crate) struct TransactionTableEntry {
    pub(crate) xid: TransactionId,
    pub(crate) gid: Option<GlobalTransactionId>,
    pub(crate) first_log: Option<LogInstant>,
    pub(crate) last_log: Option<LogInstant>,
    /// Status bits from the BeginXact record, plus `PREPARED` once prepared.
    pub(crate) status: XactStatus,
    pub(crate) update: bool,
    pub(crate) recovery: bool,
    pub(crate) exclude: bool,
    pub(crate) prepared: bool,
    pub(crate) state: XactState,
    pub(crate) kind: TransactionKind,
    pub(crate) name: String,
    pub(crate) context: Weak<Mutex<Transaction>>,
}

impl TransactionTableEntry {
    pub(crate) fn new(
        xid: TransactionId,
        kind: TransactionKind,
        exclude: bool,
        name: &str,
        context: Weak<Mutex<Transaction>>,
    ) -> Self {
        Self {
            xid,
            gid: None,
            first_log: None,
            last_log: None,
            status: XactStatus::EMPTY,
            update: false,
            recovery: false,
            exclude,
            prepared: false,
            state: XactState::Idle,
            kind,
            name: name.to_owned(),
            context,
        }
    }

    /// Entry rebuilt from a BeginXact record found during redo.
    fn recovered(
        xid: TransactionId,
        status: XactStatus,
        gid: Option<GlobalTransactionId>,
        begin: LogInstant,
    ) -> Self {
        let kind = TransactionKind::from_status(status);
        Self {
            xid,
            gid,
            first_log: Some(begin),
            last_log: Some(begin),
            status,
            update: true,
            recovery: true,
            exclude: true,
            prepared: false,
            state: XactState::Update,
            kind,
            name: kind.name().to_owned(),
            context: Weak::new(),
        }
    }

    fn info(&self) -> TransactionInfo {
        TransactionInfo {
            id: self.xid,
            global_id: self.gid.clone(),
            first_log: self.first_log,
            last_log: self.last_log,
            status: self.status,
            kind: self.kind.name(),
            state: self.state.name(),
            name: self.name.clone(),
            update: self.update,
            recovery: self.recovery,
            prepared: self.prepared,
        }
    }
}

/// Snapshot of one table entry for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionInfo {
    /// Local id.
    pub id: TransactionId,
    /// Global id, if any.
    pub global_id: Option<GlobalTransactionId>,
    /// First log record.
    pub first_log: Option<LogInstant>,
    /// Last log record.
    pub last_log: Option<LogInstant>,
    /// Status bits.
    pub status: XactStatus,
    /// Kind of transaction.
    pub kind: &'static str,
    /// State name.
    pub state: &'static str,
    /// Transaction name.
    pub name: String,
    /// Whether the transaction has logged updates.
    pub update: bool,
    /// Whether the entry was rebuilt by recovery.
    pub recovery: bool,
    /// Whether the transaction is prepared.
    pub prepared: bool,
}

/// An update transaction as recorded in a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointEntry {
    /// Local id.
    pub xid: TransactionId,
    /// Global id, if any.
    pub gid: Option<GlobalTransactionId>,
    /// First log record.
    pub first_log: Option<LogInstant>,
    /// Last log record.
    pub last_log: Option<LogInstant>,
    /// Status bits.
    pub status: XactStatus,
}

#[derive(Debug, Default)]
struct TableInner {
    entries: BTreeMap<TransactionId, TransactionTableEntry>,
    largest_update: Option<TransactionId>,
}

impl TableInner {
    /// Largest id among entries matching `pred`.
    fn most_recent(&self, pred: impl Fn(&TransactionTableEntry) -> bool) -> Option<TransactionId> {
        self.entries
            .values()
            .rev()
            .find(|entry| pred(entry))
            .map(|entry| entry.xid)
    }
}

/// Concurrent registry of transactions.
#[derive(Debug, Default)]
pub struct TransactionTable {
    inner: RwLock<TableInner>,
}

impl TransactionTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, entry: TransactionTableEntry) {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.entries.get(&entry.xid) {
            if existing.exclude != entry.exclude {
                tracing::warn!(xid = %entry.xid, "transaction re-added with a different exclusion");
            }
            return;
        }
        tracing::debug!(xid = %entry.xid, kind = entry.kind.name(), "transaction added");
        inner.entries.insert(entry.xid, entry);
    }

    /// Removes `id` and reports whether it needs exclusion during quiesce.
    ///
    /// An unknown id counts as excluded.
    pub(crate) fn remove(&self, id: TransactionId) -> bool {
        let removed = self.inner.write().entries.remove(&id);
        tracing::debug!(xid = %id, found = removed.is_some(), "transaction removed");
        removed.map_or(true, |entry| entry.exclude)
    }

    /// Moves a transaction to a new id, keeping its exclusion flag.
    pub(crate) fn reassign_id(&self, old: TransactionId, mut entry: TransactionTableEntry) {
        let mut inner = self.inner.write();
        if let Some(previous) = inner.entries.remove(&old) {
            entry.exclude = previous.exclude;
        }
        tracing::trace!(old = %old, new = %entry.xid, "transaction id reassigned");
        inner.entries.insert(entry.xid, entry);
    }

    /// Marks `xid` as an update transaction.
    ///
    /// At runtime the entry already exists. During redo it does not, and an
    /// entry is rebuilt from the BeginXact record.
    pub(crate) fn add_update_transaction(
        &self,
        xid: TransactionId,
        status: XactStatus,
        gid: Option<GlobalTransactionId>,
        begin: LogInstant,
    ) {
        let mut inner = self.inner.write();
        match inner.entries.get_mut(&xid) {
            Some(entry) => {
                entry.status = status;
                entry.update = true;
                entry.first_log = Some(begin);
                entry.last_log = Some(begin);
            }
            None => {
                inner
                    .entries
                    .insert(xid, TransactionTableEntry::recovered(xid, status, gid, begin));
            }
        }
        if inner.largest_update.map_or(true, |largest| xid > largest) {
            inner.largest_update = Some(xid);
        }
    }

    /// Turns `xid` back into a read-only transaction; recovery entries are
    /// dropped entirely.
    pub(crate) fn remove_update_transaction(&self, xid: TransactionId) {
        let mut inner = self.inner.write();
        let Some(entry) = inner.entries.get_mut(&xid) else {
            tracing::warn!(xid = %xid, "ending an update transaction that is not in the table");
            return;
        };
        if entry.recovery {
            inner.entries.remove(&xid);
            return;
        }
        entry.update = false;
        entry.prepared = false;
        entry.status = XactStatus::EMPTY;
        entry.first_log = None;
        entry.last_log = None;
    }

    pub(crate) fn prepare_transaction(&self, xid: TransactionId) {
        if let Some(entry) = self.inner.write().entries.get_mut(&xid) {
            entry.prepared = true;
            entry.status = entry.status | XactStatus::PREPARED;
        }
    }

    pub(crate) fn set_log_range(
        &self,
        xid: TransactionId,
        first: Option<LogInstant>,
        last: Option<LogInstant>,
    ) {
        if let Some(entry) = self.inner.write().entries.get_mut(&xid) {
            entry.first_log = first;
            entry.last_log = last;
        }
    }

    /// Advances the last log instant of a recovering transaction.
    pub(crate) fn set_last_log(&self, xid: TransactionId, last: LogInstant) {
        if let Some(entry) = self.inner.write().entries.get_mut(&xid) {
            entry.last_log = Some(last);
        }
    }

    pub(crate) fn set_state(&self, xid: TransactionId, state: XactState) {
        if let Some(entry) = self.inner.write().entries.get_mut(&xid) {
            entry.state = state;
        }
    }

    pub(crate) fn set_global_id(&self, xid: TransactionId, gid: Option<GlobalTransactionId>) {
        if let Some(entry) = self.inner.write().entries.get_mut(&xid) {
            entry.gid = gid;
        }
    }

    /// Finds the live transaction carrying `gid`.
    #[must_use]
    pub fn find_transaction_context_by_global_id(
        &self,
        gid: &GlobalTransactionId,
    ) -> Option<XactContext> {
        self.inner
            .read()
            .entries
            .values()
            .filter(|entry| entry.gid.as_ref() == Some(gid))
            .find_map(|entry| entry.context.upgrade())
    }

    /// Whether any transaction has logged updates and not yet ended.
    #[must_use]
    pub fn has_active_update_transaction(&self) -> bool {
        self.inner.read().entries.values().any(|entry| entry.update)
    }

    /// The oldest first log instant of any update transaction: the undo
    /// low-water mark.
    #[must_use]
    pub fn get_first_log_instant(&self) -> Option<LogInstant> {
        self.inner
            .read()
            .entries
            .values()
            .filter(|entry| entry.update)
            .filter_map(|entry| entry.first_log)
            .min()
    }

    /// The largest id that has logged a BeginXact.
    #[must_use]
    pub fn largest_update_xact_id(&self) -> Option<TransactionId> {
        self.inner.read().largest_update
    }

    /// Serializes the update transactions for a checkpoint record.
    ///
    /// The read lock is held for the whole write, so no status change can
    /// interleave with it.
    ///
    /// # Errors
    ///
    /// Returns an error if a count or status does not fit the compressed
    /// integer encoding.
    pub fn write_checkpoint(&self) -> CoreResult<Vec<u8>> {
        let inner = self.inner.read();
        let updates: Vec<_> = inner.entries.values().filter(|e| e.update).collect();
        let count = u32::try_from(updates.len())
            .map_err(|_| CoreError::invalid_argument("too many update transactions"))?;
        let mut out = Vec::new();
        write_compressed_int(&mut out, count)?;
        for entry in updates {
            out.extend_from_slice(&entry.xid.as_u64().to_le_bytes());
            encode_gid(&mut out, entry.gid.as_ref());
            put_instant(&mut out, entry.first_log);
            put_instant(&mut out, entry.last_log);
            write_compressed_int(&mut out, entry.status.bits())?;
        }
        Ok(out)
    }

    /// Decodes a table written by [`TransactionTable::write_checkpoint`].
    ///
    /// # Errors
    ///
    /// Returns `LogCorruption` for malformed input.
    pub fn read_checkpoint(bytes: &[u8]) -> CoreResult<Vec<CheckpointEntry>> {
        let mut reader = ByteReader::new(bytes);
        let count = read_compressed_int(&mut reader)?;
        let mut entries = Vec::new();
        for _ in 0..count {
            let xid = TransactionId::new(reader.u64()?);
            if xid.as_u64() == 0 {
                return Err(CoreError::log_corruption("checkpoint entry without an id"));
            }
            entries.push(CheckpointEntry {
                xid,
                gid: decode_gid(&mut reader)?,
                first_log: get_instant(&mut reader)?,
                last_log: get_instant(&mut reader)?,
                status: XactStatus::from_bits(read_compressed_int(&mut reader)?),
            });
        }
        reader.finish("checkpoint transaction table")?;
        Ok(entries)
    }

    /// Whether an internal transaction is waiting to be rolled back.
    #[must_use]
    pub fn has_rollback_first_transaction(&self) -> bool {
        self.inner.read().entries.values().any(|entry| {
            entry.recovery && entry.status.contains(XactStatus::ROLLBACK_FIRST)
        })
    }

    /// Whether recovery found a prepared transaction.
    #[must_use]
    pub fn has_prepared_recovered_xact(&self) -> bool {
        self.inner
            .read()
            .entries
            .values()
            .any(|entry| entry.recovery && entry.status.contains(XactStatus::PREPARED))
    }

    /// Makes `cursor` assume the most recent rollback-first transaction.
    ///
    /// Returns `false`, leaving the cursor idle, when there is none.
    pub(crate) fn get_most_recent_rollback_first_transaction(
        &self,
        cursor: &mut RecoveryCursor,
    ) -> CoreResult<bool> {
        let id = self.inner.read().most_recent(|entry| {
            entry.update && entry.recovery && entry.status.contains(XactStatus::ROLLBACK_FIRST)
        });
        let found = self.find_and_assume_transaction(id, cursor)?;
        if id.is_some() && !found {
            return Err(CoreError::recovery("rollback-first transaction vanished from the table"));
        }
        Ok(found)
    }

    /// Makes `cursor` assume the most recent unprepared recovery
    /// transaction. Prepared transactions are never undone.
    pub(crate) fn get_most_recent_transaction_for_rollback(
        &self,
        cursor: &mut RecoveryCursor,
    ) -> CoreResult<bool> {
        let id = {
            let inner = self.inner.read();
            if inner.entries.values().any(|entry| {
                entry.update && entry.recovery && entry.status.contains(XactStatus::ROLLBACK_FIRST)
            }) {
                return Err(CoreError::recovery(
                    "rollback-first transactions left while rolling back user transactions",
                ));
            }
            inner.most_recent(|entry| entry.update && entry.recovery && !entry.prepared)
        };
        self.find_and_assume_transaction(id, cursor)
    }

    /// Hands the most recent prepared recovery transaction over to `xact`.
    ///
    /// `xact` is a freshly started user transaction; its own entry is
    /// dropped and the prepared entry becomes a runtime entry owned by it.
    pub(crate) fn get_most_recent_prepared_recovered_xact(&self, xact: &mut Transaction) -> bool {
        let mut inner = self.inner.write();
        let Some(id) = inner.most_recent(|entry| entry.recovery && entry.prepared) else {
            return false;
        };
        if let Some(own) = xact.id() {
            inner.entries.remove(&own);
        }
        let Some(entry) = inner.entries.get_mut(&id) else {
            return false;
        };
        entry.recovery = false;
        entry.state = XactState::Prepared;
        entry.kind = TransactionKind::User;
        entry.name = xact.name().to_owned();
        entry.context = xact.self_ref();
        xact.assume_global_identity(entry);
        true
    }

    /// Makes `cursor` assume the entry for `id`, or go idle when `id` is
    /// `None` or unknown.
    ///
    /// # Errors
    ///
    /// Returns `RecoveryFailed` if the entry belongs to a live transaction.
    pub(crate) fn find_and_assume_transaction(
        &self,
        id: Option<TransactionId>,
        cursor: &mut RecoveryCursor,
    ) -> CoreResult<bool> {
        let entry = id.and_then(|id| self.inner.read().entries.get(&id).cloned());
        if let Some(entry) = &entry {
            if !entry.recovery {
                return Err(CoreError::recovery(format!(
                    "transaction {} is not a recovery transaction",
                    entry.xid
                )));
            }
        }
        let found = entry.is_some();
        cursor.assume(entry);
        Ok(found)
    }

    /// Snapshots every entry.
    #[must_use]
    pub fn transaction_info(&self) -> Vec<TransactionInfo> {
        self.inner
            .read()
            .entries
            .values()
            .map(TransactionTableEntry::info)
            .collect()
    }

    /// Snapshot of one entry.
    #[must_use]
    pub fn info(&self, id: TransactionId) -> Option<TransactionInfo> {
        self.inner.read().entries.get(&id).map(TransactionTableEntry::info)
    }

    /// Global ids of all prepared transactions.
    #[must_use]
    pub fn prepared_global_ids(&self) -> Vec<GlobalTransactionId> {
        self.inner
            .read()
            .entries
            .values()
            .filter(|entry| entry.prepared)
            .filter_map(|entry| entry.gid.clone())
            .collect()
    }

    /// Whether an excluded transaction is doing work a quiesce must wait
    /// for. Prepared transactions do not count.
    pub(crate) fn excluded_busy(&self) -> bool {
        self.inner.read().entries.values().any(|entry| {
            entry.exclude
                && !entry.recovery
                && !entry.prepared
                && matches!(entry.state, XactState::Active | XactState::Update)
        })
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    /// Whether `id` has an entry.
    #[must_use]
    pub fn contains(&self, id: TransactionId) -> bool {
        self.inner.read().entries.contains_key(&id)
    }
}

fn put_instant(out: &mut Vec<u8>, instant: Option<LogInstant>) {
    match instant {
        Some(instant) => {
            out.push(1);
            out.extend_from_slice(&instant.as_u64().to_le_bytes());
        }
        None => out.push(0),
    }
}

fn get_instant(reader: &mut ByteReader<'_>) -> CoreResult<Option<LogInstant>> {
    match reader.u8()? {
        0 => Ok(None),
        1 => Ok(Some(LogInstant(reader.u64()?))),
        other => Err(CoreError::log_corruption(format!("bad instant flag {other}"))),
    }
}
