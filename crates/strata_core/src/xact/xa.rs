//! Resource-manager side of the XA protocol.

use super::context::EngineContext;
use super::transaction::XactContext;
use crate::error::{CoreError, CoreResult};
use crate::types::GlobalTransactionId;
use parking_lot::Mutex;
use std::sync::Arc;

pub use super::transaction::{XA_OK, XA_RDONLY};

/// No flags.
pub const TMNOFLAGS: i32 = 0;
/// Start a recovery scan.
pub const TMSTARTRSCAN: i32 = 0x0100_0000;
/// End a recovery scan.
pub const TMENDRSCAN: i32 = 0x0080_0000;

/// Commits, rolls back and lists global transactions by global id.
///
/// Works on live global transactions as well as on the in-doubt ones
/// recovery rebuilt from prepared log records.
#[derive(Debug, Clone)]
pub struct XaResourceManager {
    ctx: Arc<EngineContext>,
    in_doubt: Arc<Mutex<Vec<XactContext>>>,
}

impl XaResourceManager {
    pub(crate) fn new(ctx: Arc<EngineContext>, in_doubt: Arc<Mutex<Vec<XactContext>>>) -> Self {
        Self { ctx, in_doubt }
    }

    /// Finds the transaction carrying `gid`.
    ///
    /// # Errors
    ///
    /// Returns `XaNotFound` for unknown ids.
    pub fn find(&self, gid: &GlobalTransactionId) -> CoreResult<XactContext> {
        self.ctx
            .table
            .find_transaction_context_by_global_id(gid)
            .ok_or_else(|| CoreError::XaNotFound { gid: gid.clone() })
    }

    /// Commits the branch and closes its transaction.
    ///
    /// # Errors
    ///
    /// Returns `XaNotFound` for unknown ids, or a protocol error if
    /// `one_phase` does not match the prepare state.
    pub fn commit(&self, gid: &GlobalTransactionId, one_phase: bool) -> CoreResult<()> {
        let xact = self.find(gid)?;
        {
            let mut guard = xact.lock();
            guard.xa_commit(one_phase)?;
            guard.close()?;
        }
        self.forget_in_doubt(&xact);
        tracing::info!(%gid, one_phase, "global transaction committed");
        Ok(())
    }

    /// Rolls back the branch and closes its transaction.
    ///
    /// # Errors
    ///
    /// Returns `XaNotFound` for unknown ids.
    pub fn rollback(&self, gid: &GlobalTransactionId) -> CoreResult<()> {
        let xact = self.find(gid)?;
        {
            let mut guard = xact.lock();
            guard.xa_rollback()?;
            guard.close()?;
        }
        self.forget_in_doubt(&xact);
        tracing::info!(%gid, "global transaction rolled back");
        Ok(())
    }

    /// Heuristic outcomes are never recorded, so there is nothing to
    /// forget.
    ///
    /// # Errors
    ///
    /// Always fails: `XaNotFound` for unknown ids, `XaProtocol` otherwise.
    pub fn forget(&self, gid: &GlobalTransactionId) -> CoreResult<()> {
        self.find(gid)?;
        Err(CoreError::XaProtocol {
            message: format!("no heuristic outcome recorded for {gid}"),
        })
    }

    /// Lists prepared branches at the start of a recovery scan; any other
    /// call of the scan returns nothing.
    #[must_use]
    pub fn recover(&self, flags: i32) -> Vec<GlobalTransactionId> {
        if flags & TMSTARTRSCAN == 0 {
            return Vec::new();
        }
        self.ctx.table.prepared_global_ids()
    }

    fn forget_in_doubt(&self, xact: &XactContext) {
        self.in_doubt
            .lock()
            .retain(|held| !Arc::ptr_eq(held, xact));
    }
}
