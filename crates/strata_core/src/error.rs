//! Error types for the transaction core.

use crate::types::{ContainerKey, GlobalTransactionId, RecordHandle, TransactionId};
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// How far the damage of an error reaches.
///
/// Ordered from least to most severe, so `a < b` means `a` is milder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    /// Only the failing statement is affected.
    Statement,
    /// The enclosing transaction must be rolled back.
    Transaction,
    /// The caller's session is unusable.
    Session,
    /// The store must be shut down.
    Database,
    /// The whole engine must be shut down.
    System,
}

/// Errors that can occur in core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Log device error.
    #[error("storage error: {0}")]
    Storage(#[from] strata_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Operation attempted in a state that does not allow it.
    #[error("transaction protocol violation: {message}")]
    ProtocolViolation {
        /// What was attempted.
        message: String,
    },

    /// Close attempted on a transaction that is not idle.
    #[error("transaction {id} is not idle")]
    TransactionNotIdle {
        /// The transaction.
        id: TransactionId,
    },

    /// The engine is quiesced and no new transactions may start.
    #[error("engine is quiesced")]
    Quiesced,

    /// A lock could not be granted in time.
    #[error("lock timeout on {resource}")]
    LockTimeout {
        /// Description of the lockable.
        resource: String,
    },

    /// The lock manager returned an impossible reference count.
    #[error("lock accounting error on {resource}: released {released}")]
    LockAccounting {
        /// Description of the lockable.
        resource: String,
        /// The count returned by the lock manager.
        released: usize,
    },

    /// A savepoint with this name already exists.
    #[error("savepoint {name} already exists")]
    SavepointExists {
        /// Savepoint name.
        name: String,
    },

    /// No savepoint with this name and kind exists.
    #[error("savepoint {name} does not exist")]
    SavepointNotFound {
        /// Savepoint name.
        name: String,
    },

    /// SQL savepoints cannot be nested in other user savepoints.
    #[error("savepoint {name} cannot be nested inside a user savepoint")]
    SavepointNesting {
        /// Savepoint name.
        name: String,
    },

    /// Operation not supported by internal transactions.
    #[error("operation not supported in an internal transaction: {operation}")]
    NotSupportedInInternal {
        /// The rejected operation.
        operation: &'static str,
    },

    /// A global transaction with this id already exists.
    #[error("duplicate global transaction id {gid}")]
    DuplicateGlobalId {
        /// The duplicate id.
        gid: GlobalTransactionId,
    },

    /// No global transaction with this id is known.
    #[error("unknown global transaction id {gid}")]
    XaNotFound {
        /// The unknown id.
        gid: GlobalTransactionId,
    },

    /// Heuristic outcome requests or other unsupported XA calls.
    #[error("XA protocol error: {message}")]
    XaProtocol {
        /// Description.
        message: String,
    },

    /// Commit failed.
    #[error("commit failed: {source}")]
    CommitFailed {
        /// Underlying error.
        #[source]
        source: Box<CoreError>,
    },

    /// Abort or reprepare failed.
    #[error("abort failed: {source}")]
    AbortFailed {
        /// Underlying error.
        #[source]
        source: Box<CoreError>,
    },

    /// Rollback to a savepoint failed.
    #[error("rollback to savepoint failed: {source}")]
    RollbackFailed {
        /// Underlying error.
        #[source]
        source: Box<CoreError>,
    },

    /// The store has been marked corrupt and refuses further work.
    #[error("store is corrupt: {reason}")]
    StoreCorrupt {
        /// The error that caused the store to be marked corrupt.
        reason: String,
    },

    /// The log is corrupted or invalid.
    #[error("log corruption: {message}")]
    LogCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Log record checksum mismatch.
    #[error("checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },

    /// Recovery found a transaction table in an impossible shape.
    #[error("recovery failed: {message}")]
    RecoveryFailed {
        /// Description.
        message: String,
    },

    /// Container does not exist or was dropped.
    #[error("container {container} not found")]
    ContainerNotFound {
        /// The container.
        container: ContainerKey,
    },

    /// Container already exists.
    #[error("container {container} already exists")]
    ContainerExists {
        /// The container.
        container: ContainerKey,
    },

    /// Record does not exist.
    #[error("record {record} not found")]
    RecordNotFound {
        /// The record.
        record: RecordHandle,
    },

    /// Record already exists.
    #[error("record {record} already exists")]
    RecordExists {
        /// The record.
        record: RecordHandle,
    },

    /// Invalid argument passed by the caller.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description.
        message: String,
    },
}

impl CoreError {
    /// Creates a protocol violation error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            message: message.into(),
        }
    }

    /// Creates a log corruption error.
    pub fn log_corruption(message: impl Into<String>) -> Self {
        Self::LogCorruption {
            message: message.into(),
        }
    }

    /// Creates a recovery failure.
    pub fn recovery(message: impl Into<String>) -> Self {
        Self::RecoveryFailed {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a lock timeout error.
    pub fn lock_timeout(resource: impl Into<String>) -> Self {
        Self::LockTimeout {
            resource: resource.into(),
        }
    }

    /// Returns the severity of this error.
    #[must_use]
    pub fn severity(&self) -> Severity {
        match self {
            Self::SavepointExists { .. }
            | Self::SavepointNotFound { .. }
            | Self::SavepointNesting { .. }
            | Self::NotSupportedInInternal { .. }
            | Self::DuplicateGlobalId { .. }
            | Self::XaNotFound { .. }
            | Self::XaProtocol { .. }
            | Self::ContainerNotFound { .. }
            | Self::ContainerExists { .. }
            | Self::RecordNotFound { .. }
            | Self::RecordExists { .. }
            | Self::TransactionNotIdle { .. }
            | Self::Quiesced
            | Self::InvalidArgument { .. } => Severity::Statement,
            Self::ProtocolViolation { .. }
            | Self::LockTimeout { .. }
            | Self::CommitFailed { .. }
            | Self::RollbackFailed { .. } => Severity::Transaction,
            Self::Storage(_) | Self::Io(_) | Self::StoreCorrupt { .. } => Severity::Database,
            Self::AbortFailed { .. }
            | Self::LogCorruption { .. }
            | Self::ChecksumMismatch { .. }
            | Self::RecoveryFailed { .. }
            | Self::LockAccounting { .. } => Severity::System,
        }
    }

    /// Returns true for lock timeouts.
    #[must_use]
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severities_are_ordered() {
        assert!(Severity::Statement < Severity::Transaction);
        assert!(Severity::Transaction < Severity::Session);
        assert!(Severity::Database < Severity::System);
    }

    #[test]
    fn classify_common_errors() {
        assert_eq!(
            CoreError::SavepointExists { name: "a".into() }.severity(),
            Severity::Statement
        );
        assert_eq!(CoreError::protocol("x").severity(), Severity::Transaction);
        assert_eq!(CoreError::lock_timeout("x").severity(), Severity::Transaction);
        assert_eq!(CoreError::log_corruption("x").severity(), Severity::System);
        let io = CoreError::from(io::Error::other("disk"));
        assert_eq!(io.severity(), Severity::Database);
    }

    #[test]
    fn wrapped_errors_keep_source_message() {
        let err = CoreError::CommitFailed {
            source: Box::new(CoreError::lock_timeout("container 0.1")),
        };
        assert!(err.to_string().contains("lock timeout on container 0.1"));
        assert!(CoreError::lock_timeout("r").is_lock_timeout());
    }
}
