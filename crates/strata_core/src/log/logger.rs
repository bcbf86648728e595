//! The logger contract.

use super::op::LogOp;
use super::record::LogRecord;
use crate::error::CoreResult;
use crate::types::{LogInstant, TransactionId};
use std::fmt;

/// Result of undoing a range of a transaction's log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UndoOutcome {
    /// First compensation record written.
    pub first_clr: Option<LogInstant>,
    /// Last compensation record written.
    pub last_clr: Option<LogInstant>,
    /// Number of operations undone.
    pub undone: usize,
}

/// Write-ahead log as consumed by transactions and recovery.
pub trait Logger: Send + Sync + fmt::Debug {
    /// Appends `op` for `txid` and applies it to the data factory.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written or applied.
    fn log_and_do(&self, txid: Option<TransactionId>, op: &LogOp) -> CoreResult<LogInstant>;

    /// Undoes the undoable operations of `txid` in `[from, to]`, newest
    /// first, writing a compensation record for each. Operations that
    /// already have a compensation record are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be read or written.
    fn undo(&self, txid: TransactionId, from: LogInstant, to: LogInstant)
        -> CoreResult<UndoOutcome>;

    /// Walks the records of `txid` in `[first, last]`, oldest first, so the
    /// caller can reacquire the locks a prepared transaction held.
    ///
    /// # Errors
    ///
    /// Returns an error from the log or from `reclaim`.
    fn reprepare(
        &self,
        txid: TransactionId,
        first: LogInstant,
        last: LogInstant,
        reclaim: &mut dyn FnMut(&LogOp) -> CoreResult<()>,
    ) -> CoreResult<()>;

    /// Makes the log durable at least up to and including `instant`.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be forced.
    fn flush(&self, instant: LogInstant) -> CoreResult<()>;

    /// Makes everything written so far durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the device cannot be forced.
    fn flush_all(&self) -> CoreResult<()>;

    /// Visits every record in log order.
    ///
    /// # Errors
    ///
    /// Returns an error from the log or from `visitor`.
    fn scan(&self, visitor: &mut dyn FnMut(LogInstant, LogRecord) -> CoreResult<()>)
        -> CoreResult<()>;
}
