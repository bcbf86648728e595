//! Restart recovery: redo and the undo cursor.

use super::context::EngineContext;
use super::state::{TransactionKind, XactStatus};
use super::table::{TransactionTable, TransactionTableEntry};
use super::transaction::Transaction;
use crate::error::{CoreError, CoreResult};
use crate::log::LogOp;
use crate::types::TransactionId;
use std::sync::Arc;

/// Counts from the redo pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RedoSummary {
    /// Records replayed.
    pub records: usize,
    /// Checkpoint records seen.
    pub checkpoints: usize,
    /// Transactions still open at the end of the log.
    pub in_flight: usize,
}

/// Replays the whole log into the data factory and rebuilds the
/// transaction table from BeginXact and EndXact records.
///
/// Checkpoint tables are decoded to validate them; the full replay already
/// yields the same table.
pub(crate) fn redo(ctx: &EngineContext) -> CoreResult<RedoSummary> {
    let mut summary = RedoSummary::default();
    ctx.logger.scan(&mut |instant, record| {
        summary.records += 1;
        if let LogOp::Checkpoint { table, .. } = &record.op {
            TransactionTable::read_checkpoint(table)?;
            summary.checkpoints += 1;
            return Ok(());
        }
        let xid = record.txid.ok_or_else(|| {
            CoreError::log_corruption(format!("record at {instant} has no transaction"))
        })?;
        match &record.op {
            LogOp::BeginXact { status, gid } => {
                ctx.table
                    .add_update_transaction(xid, *status, gid.clone(), instant);
            }
            LogOp::EndXact { status, .. } => {
                if status.contains(XactStatus::PREPARED) {
                    ctx.table.prepare_transaction(xid);
                    ctx.table.set_last_log(xid, instant);
                } else {
                    ctx.table.remove_update_transaction(xid);
                }
            }
            op => {
                ctx.data.apply(op)?;
                ctx.table.set_last_log(xid, instant);
            }
        }
        Ok(())
    })?;
    summary.in_flight = ctx
        .table
        .transaction_info()
        .iter()
        .filter(|info| info.update)
        .count();
    tracing::info!(
        records = summary.records,
        checkpoints = summary.checkpoints,
        in_flight = summary.in_flight,
        "redo complete"
    );
    Ok(summary)
}

/// A detached transaction that takes on the identity of each recovered
/// transaction in turn to roll it back.
#[derive(Debug)]
pub(crate) struct RecoveryCursor {
    xact: Transaction,
}

impl RecoveryCursor {
    pub(crate) fn new(ctx: Arc<EngineContext>, kind: TransactionKind) -> Self {
        Self {
            xact: Transaction::detached(ctx, kind),
        }
    }

    pub(crate) fn assume(&mut self, entry: Option<TransactionTableEntry>) {
        self.xact.assume_identity(entry);
    }

    pub(crate) fn id(&self) -> Option<TransactionId> {
        self.xact.id()
    }

    pub(crate) fn abort(&mut self) -> CoreResult<()> {
        self.xact.abort()
    }
}
