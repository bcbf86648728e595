//! Typed transaction events.

/// Events a transaction delivers to its listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionEvent {
    /// The transaction committed.
    Commit,
    /// The transaction aborted.
    Abort,
    /// The transaction rolled back to a savepoint.
    SavepointRollback,
    /// Row locks were escalated to container locks.
    LockEscalate,
}

/// Receives events from the transaction it is registered with.
///
/// Listeners are held weakly; dropping the listener unregisters it.
pub trait TransactionListener: Send + Sync {
    /// Handles one event. Must not call back into the transaction.
    fn on_event(&self, event: TransactionEvent);
}
