//! Services shared by every transaction of one engine.

use super::post_commit::PostCommitQueue;
use super::table::TransactionTable;
use crate::config::Config;
use crate::data::DataFactory;
use crate::error::{CoreError, CoreResult};
use crate::lock::LockManager;
use crate::log::Logger;
use crate::policy::{LockingMode, LockingPolicy, PolicyMatrix};
use crate::types::TransactionId;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Collaborators and counters a transaction needs.
///
/// Lock order: transaction mutex, then the quiesce gate, then the
/// transaction table. Nothing may lock a transaction while holding the
/// table lock.
pub struct EngineContext {
    pub(crate) config: Config,
    pub(crate) locks: Arc<dyn LockManager>,
    pub(crate) logger: Arc<dyn Logger>,
    pub(crate) data: Arc<dyn DataFactory>,
    pub(crate) table: TransactionTable,
    pub(crate) matrix: PolicyMatrix,
    pub(crate) post_commit: PostCommitQueue,
    pub(crate) gate: QuiesceGate,
    next_id: AtomicU64,
    next_owner: AtomicU64,
    next_handle: AtomicU64,
    corrupt: Mutex<Option<String>>,
}

impl fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineContext")
            .field("config", &self.config)
            .field("transactions", &self.table.len())
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .field("corrupt", &*self.corrupt.lock())
            .finish_non_exhaustive()
    }
}

impl EngineContext {
    pub(crate) fn new(
        config: Config,
        locks: Arc<dyn LockManager>,
        logger: Arc<dyn Logger>,
        data: Arc<dyn DataFactory>,
    ) -> Self {
        let matrix = PolicyMatrix::new(Arc::clone(&locks));
        Self {
            config,
            locks,
            logger,
            data,
            table: TransactionTable::new(),
            matrix,
            post_commit: PostCommitQueue::new(),
            gate: QuiesceGate::default(),
            next_id: AtomicU64::new(1),
            next_owner: AtomicU64::new(1),
            next_handle: AtomicU64::new(1),
            corrupt: Mutex::new(None),
        }
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The transaction table.
    #[must_use]
    pub fn table(&self) -> &TransactionTable {
        &self.table
    }

    /// The lock manager.
    #[must_use]
    pub fn locks(&self) -> &Arc<dyn LockManager> {
        &self.locks
    }

    /// The data factory.
    #[must_use]
    pub fn data(&self) -> &Arc<dyn DataFactory> {
        &self.data
    }

    pub(crate) fn allocate_id(&self) -> TransactionId {
        TransactionId::new(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Restarts id allocation above the largest id recovery saw.
    pub(crate) fn reset_id(&self) {
        let next = self
            .table
            .largest_update_xact_id()
            .map_or(1, |largest| largest.as_u64() + 1);
        self.next_id.fetch_max(next, Ordering::SeqCst);
        tracing::debug!(next, "transaction ids reset");
    }

    /// Token distinguishing transaction objects; names the lock group and
    /// the default compatibility space.
    pub(crate) fn next_owner(&self) -> u64 {
        self.next_owner.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_handle_id(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    /// Marks the store corrupt and returns the error callers should raise.
    pub(crate) fn mark_corrupt(&self, cause: CoreError) -> CoreError {
        let mut corrupt = self.corrupt.lock();
        let reason = corrupt.get_or_insert_with(|| cause.to_string()).clone();
        tracing::error!(error = %cause, "store marked corrupt");
        CoreError::StoreCorrupt { reason }
    }

    pub(crate) fn check_corrupt(&self) -> CoreResult<()> {
        match &*self.corrupt.lock() {
            Some(reason) => Err(CoreError::StoreCorrupt {
                reason: reason.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Whether the store has been marked corrupt.
    #[must_use]
    pub fn is_corrupt(&self) -> bool {
        self.corrupt.lock().is_some()
    }

    /// Record-level policy for the configured default isolation.
    pub(crate) fn default_policy(&self) -> CoreResult<LockingPolicy> {
        self.matrix
            .get(LockingMode::Record, self.config.default_isolation, true)
            .ok_or_else(|| CoreError::invalid_argument("no policy for the default isolation"))
    }
}

/// Barrier that holds excluded transactions back while the engine is
/// quiesced.
#[derive(Debug, Default)]
pub(crate) struct QuiesceGate {
    quiesced: Mutex<bool>,
    idle: Condvar,
}

impl QuiesceGate {
    /// Runs `admit` unless the gate is closed to `excluded` transactions.
    pub(crate) fn admit<T>(&self, excluded: bool, admit: impl FnOnce() -> T) -> CoreResult<T> {
        let quiesced = self.quiesced.lock();
        if excluded && *quiesced {
            return Err(CoreError::Quiesced);
        }
        Ok(admit())
    }

    /// Wakes a waiting quiesce after a transaction went idle.
    pub(crate) fn notify_idle(&self) {
        let _quiesced = self.quiesced.lock();
        self.idle.notify_all();
    }

    /// Closes the gate and waits for busy excluded transactions to drain.
    ///
    /// On timeout the gate is opened again.
    pub(crate) fn quiesce(&self, table: &TransactionTable, timeout: Duration) -> CoreResult<()> {
        let deadline = Instant::now() + timeout;
        let mut quiesced = self.quiesced.lock();
        *quiesced = true;
        while table.excluded_busy() {
            if self.idle.wait_until(&mut quiesced, deadline).timed_out() && table.excluded_busy() {
                *quiesced = false;
                tracing::warn!(?timeout, "quiesce timed out");
                return Err(CoreError::lock_timeout("quiesce"));
            }
        }
        tracing::info!("engine quiesced");
        Ok(())
    }

    pub(crate) fn unquiesce(&self) {
        let mut quiesced = self.quiesced.lock();
        if *quiesced {
            *quiesced = false;
            tracing::info!("engine unquiesced");
        }
    }

    pub(crate) fn is_quiesced(&self) -> bool {
        *self.quiesced.lock()
    }
}
