//! The transaction factory: boot, recovery and transaction creation.

use super::context::EngineContext;
use super::recovery::{redo, RecoveryCursor, RedoSummary};
use super::state::TransactionKind;
use super::table::TransactionInfo;
use super::transaction::{Transaction, XactContext};
use super::xa::XaResourceManager;
use crate::config::Config;
use crate::data::{DataFactory, MemoryDataFactory};
use crate::error::{CoreError, CoreResult};
use crate::lock::{LockManager, LockTable};
use crate::log::{LogOp, Logger, WalLogger};
use crate::policy::{Isolation, LockingMode, LockingPolicy};
use crate::types::{GlobalTransactionId, LogInstant};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use strata_storage::LogDevice;

/// What restart recovery did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    /// Redo pass counts.
    pub redo: RedoSummary,
    /// Transactions rolled back.
    pub rolled_back: usize,
    /// Prepared transactions left in doubt.
    pub in_doubt: usize,
}

/// Creates transactions and owns the services they share.
///
/// # Example
///
/// ```rust
/// use strata_core::{Config, OpenMode, RecordHandle, XactFactory};
/// use strata_storage::MemoryDevice;
///
/// let factory = XactFactory::boot(Config::default(), Box::new(MemoryDevice::new())).unwrap();
/// let xact = factory.start_transaction("example").unwrap();
/// let mut t = xact.lock();
/// let key = t.add_container(0).unwrap();
/// let handle = t.open_container(key, OpenMode::FOR_UPDATE).unwrap().unwrap();
/// t.insert(&handle, RecordHandle::new(key, 1, 1), b"row".to_vec()).unwrap();
/// t.commit().unwrap();
/// ```
#[derive(Debug)]
pub struct XactFactory {
    ctx: Arc<EngineContext>,
    in_doubt: Arc<Mutex<Vec<XactContext>>>,
    recovery: RecoverySummary,
}

impl XactFactory {
    /// Boots an engine on `device` with the in-memory data factory and the
    /// reference lock table, running restart recovery.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read or recovery fails.
    pub fn boot(config: Config, device: Box<dyn LogDevice>) -> CoreResult<Self> {
        let data: Arc<dyn DataFactory> = Arc::new(MemoryDataFactory::new());
        let logger = WalLogger::open(device, Arc::clone(&data), config.sync_on_write)?;
        let locks: Arc<dyn LockManager> = Arc::new(LockTable::new());
        Self::boot_with(config, locks, Arc::new(logger), data)
    }

    /// Boots an engine on the given collaborators, running restart
    /// recovery.
    ///
    /// # Errors
    ///
    /// Returns an error if recovery fails.
    pub fn boot_with(
        config: Config,
        locks: Arc<dyn LockManager>,
        logger: Arc<dyn Logger>,
        data: Arc<dyn DataFactory>,
    ) -> CoreResult<Self> {
        let ctx = Arc::new(EngineContext::new(config, locks, logger, data));
        let mut factory = Self {
            ctx,
            in_doubt: Arc::new(Mutex::new(Vec::new())),
            recovery: RecoverySummary::default(),
        };
        factory.recovery = factory.recover()?;
        Ok(factory)
    }

    fn recover(&self) -> CoreResult<RecoverySummary> {
        let redo = redo(&self.ctx)?;
        self.ctx.reset_id();
        let rolled_back = self.rollback_all_transactions()?;
        let in_doubt = self.handle_prepared_xacts()?;
        tracing::info!(
            records = redo.records,
            rolled_back,
            in_doubt,
            "recovery complete"
        );
        Ok(RecoverySummary {
            redo,
            rolled_back,
            in_doubt,
        })
    }

    /// What recovery did at boot.
    #[must_use]
    pub fn recovery_summary(&self) -> RecoverySummary {
        self.recovery
    }

    /// The shared engine context.
    #[must_use]
    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Starts a user transaction.
    ///
    /// # Errors
    ///
    /// Returns `Quiesced` while the engine is quiesced.
    pub fn start_transaction(&self, name: &str) -> CoreResult<XactContext> {
        Transaction::start(&self.ctx, TransactionKind::User, None, false, name, None)
    }

    /// Starts a read-only transaction sharing `parent`'s compatibility
    /// space, so it never waits for the parent's locks. It is not held back
    /// by a quiesce.
    ///
    /// # Errors
    ///
    /// Returns `StoreCorrupt` if the store is corrupt.
    pub fn start_nested_read_only_user_transaction(
        &self,
        parent: &Transaction,
        name: &str,
    ) -> CoreResult<XactContext> {
        Transaction::start(
            &self.ctx,
            TransactionKind::NestedReadOnly,
            Some(parent.compatibility_space()),
            true,
            name,
            None,
        )
    }

    /// Starts an updating transaction sharing `parent`'s compatibility
    /// space, so it can write rows the parent has locked. It commits or
    /// aborts on its own.
    ///
    /// # Errors
    ///
    /// Returns `Quiesced` while the engine is quiesced.
    pub fn start_nested_update_user_transaction(
        &self,
        parent: &Transaction,
        name: &str,
    ) -> CoreResult<XactContext> {
        Transaction::start(
            &self.ctx,
            TransactionKind::NestedUpdate,
            Some(parent.compatibility_space()),
            false,
            name,
            None,
        )
    }

    /// Starts a global transaction.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateGlobalId` if a transaction with this id exists,
    /// or `InvalidArgument` for oversized id parts.
    pub fn start_global_transaction(
        &self,
        format_id: i32,
        global_id: &[u8],
        branch_id: &[u8],
    ) -> CoreResult<XactContext> {
        let gid = self.unused_global_id(format_id, global_id, branch_id)?;
        let name = gid.to_string();
        Transaction::start(&self.ctx, TransactionKind::User, None, false, &name, Some(gid))
    }

    /// Turns a local transaction into a global one.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateGlobalId` if a transaction with this id exists.
    pub fn create_xa_transaction_from_local(
        &self,
        xact: &mut Transaction,
        format_id: i32,
        global_id: &[u8],
        branch_id: &[u8],
    ) -> CoreResult<()> {
        let gid = self.unused_global_id(format_id, global_id, branch_id)?;
        xact.set_global_id(gid)
    }

    fn unused_global_id(
        &self,
        format_id: i32,
        global_id: &[u8],
        branch_id: &[u8],
    ) -> CoreResult<GlobalTransactionId> {
        let gid = GlobalTransactionId::new(format_id, global_id, branch_id)?;
        if self.find_transaction(&gid).is_some() {
            return Err(CoreError::DuplicateGlobalId { gid });
        }
        Ok(gid)
    }

    /// Starts an internal transaction. Its records are rolled back first
    /// at restart and it does not support savepoints.
    ///
    /// # Errors
    ///
    /// Returns `Quiesced` while the engine is quiesced.
    pub fn start_internal_transaction(&self) -> CoreResult<XactContext> {
        Transaction::start(
            &self.ctx,
            TransactionKind::Internal,
            None,
            false,
            TransactionKind::Internal.name(),
            None,
        )
    }

    /// Starts a nested top transaction. It has a compatibility space of
    /// its own, so it waits for locks held by the transaction that started
    /// it, and commits independently of it.
    ///
    /// # Errors
    ///
    /// Returns `Quiesced` while the engine is quiesced.
    pub fn start_nested_top_transaction(&self) -> CoreResult<XactContext> {
        Transaction::start(
            &self.ctx,
            TransactionKind::NestedTop,
            None,
            false,
            TransactionKind::NestedTop.name(),
            None,
        )
    }

    /// Looks up a locking policy.
    #[must_use]
    pub fn get_locking_policy(
        &self,
        mode: LockingMode,
        isolation: Isolation,
        stricter_ok: bool,
    ) -> Option<LockingPolicy> {
        self.ctx.matrix.get(mode, isolation, stricter_ok)
    }

    /// Finds the live transaction carrying `gid`.
    #[must_use]
    pub fn find_transaction(&self, gid: &GlobalTransactionId) -> Option<XactContext> {
        self.ctx.table.find_transaction_context_by_global_id(gid)
    }

    /// Rolls back every unprepared transaction recovery found: internal
    /// transactions first, then the rest, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if an undo fails.
    pub fn rollback_all_transactions(&self) -> CoreResult<usize> {
        let mut count = 0;
        let mut cursor = RecoveryCursor::new(Arc::clone(&self.ctx), TransactionKind::Internal);
        while self
            .ctx
            .table
            .get_most_recent_rollback_first_transaction(&mut cursor)?
        {
            tracing::debug!(xid = ?cursor.id(), "rolling back internal transaction");
            cursor.abort()?;
            count += 1;
        }
        let mut cursor = RecoveryCursor::new(Arc::clone(&self.ctx), TransactionKind::User);
        while self
            .ctx
            .table
            .get_most_recent_transaction_for_rollback(&mut cursor)?
        {
            tracing::debug!(xid = ?cursor.id(), "rolling back transaction");
            cursor.abort()?;
            count += 1;
        }
        Ok(count)
    }

    /// Gives every prepared transaction recovery found a live transaction
    /// with its locks reacquired, to wait for an XA commit or rollback.
    ///
    /// # Errors
    ///
    /// Returns an error if locks cannot be reacquired.
    pub fn handle_prepared_xacts(&self) -> CoreResult<usize> {
        if !self.ctx.table.has_prepared_recovered_xact() {
            return Ok(0);
        }
        let mut count = 0;
        loop {
            let xact = self.start_transaction("recovered prepared transaction")?;
            let mut guard = xact.lock();
            if !self
                .ctx
                .table
                .get_most_recent_prepared_recovered_xact(&mut guard)
            {
                guard.destroy()?;
                break;
            }
            guard.reprepare()?;
            tracing::info!(
                xid = ?guard.id(),
                gid = ?guard.global_id(),
                "prepared transaction in doubt"
            );
            drop(guard);
            self.in_doubt.lock().push(xact);
            count += 1;
        }
        Ok(count)
    }

    /// Prepared transactions recovered at boot and not yet resolved.
    #[must_use]
    pub fn in_doubt_transactions(&self) -> Vec<XactContext> {
        self.in_doubt.lock().clone()
    }

    /// First log instant of the oldest update transaction.
    #[must_use]
    pub fn first_update_instant(&self) -> Option<LogInstant> {
        self.ctx.table.get_first_log_instant()
    }

    /// Whether no transaction has unfinished logged updates.
    #[must_use]
    pub fn no_active_update_transaction(&self) -> bool {
        !self.ctx.table.has_active_update_transaction()
    }

    /// Writes and flushes a checkpoint record holding the table of update
    /// transactions.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    pub fn checkpoint(&self) -> CoreResult<LogInstant> {
        let table = self.ctx.table.write_checkpoint()?;
        let undo_low_water = self.ctx.table.get_first_log_instant();
        let at = self.ctx.logger.log_and_do(
            None,
            &LogOp::Checkpoint {
                undo_low_water,
                table,
            },
        )?;
        self.ctx.logger.flush(at)?;
        tracing::debug!(at = %at, ?undo_low_water, "checkpoint written");
        Ok(at)
    }

    /// Snapshot of every transaction.
    #[must_use]
    pub fn transaction_info(&self) -> Vec<TransactionInfo> {
        self.ctx.table.transaction_info()
    }

    /// Holds back new work and waits for running update work to finish.
    ///
    /// # Errors
    ///
    /// Returns a lock timeout, with the engine unquiesced again, if
    /// transactions are still busy after `timeout`.
    pub fn quiesce(&self, timeout: Duration) -> CoreResult<()> {
        self.ctx.gate.quiesce(&self.ctx.table, timeout)
    }

    /// Lifts a quiesce.
    pub fn unquiesce(&self) {
        self.ctx.gate.unquiesce();
    }

    /// Whether the engine is quiesced.
    #[must_use]
    pub fn is_quiesced(&self) -> bool {
        self.ctx.gate.is_quiesced()
    }

    /// Runs queued post-commit work once; returns how many items finished.
    pub fn service_post_commit(&self) -> usize {
        self.ctx.post_commit.run_pending()
    }

    /// Number of queued post-commit items.
    #[must_use]
    pub fn pending_post_commit(&self) -> usize {
        self.ctx.post_commit.len()
    }

    /// XA entry points for this engine.
    #[must_use]
    pub fn xa_resource_manager(&self) -> XaResourceManager {
        XaResourceManager::new(Arc::clone(&self.ctx), Arc::clone(&self.in_doubt))
    }

    /// Whether the store has been marked corrupt.
    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        self.ctx.is_corrupt()
    }
}
