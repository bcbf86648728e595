//! # Strata Core
//!
//! Transaction and locking core for the Strata embedded storage engine.
//!
//! This crate provides:
//! - Transactions with savepoints, lazy commit and two-phase commit
//! - A transaction table with checkpoint serialization
//! - Restart recovery over a write-ahead log
//! - Locking policies for every (granularity, isolation) pair
//! - Row-to-container lock escalation
//! - Quiesce of update activity
//!
//! ## Usage
//!
//! ```rust
//! use strata_core::{Config, OpenMode, RecordHandle, SavepointKind, XactFactory};
//! use strata_storage::MemoryDevice;
//!
//! let factory = XactFactory::boot(Config::default(), Box::new(MemoryDevice::new())).unwrap();
//! let xact = factory.start_transaction("doc").unwrap();
//! let mut t = xact.lock();
//! let key = t.add_container(0).unwrap();
//! let handle = t.open_container(key, OpenMode::FOR_UPDATE).unwrap().unwrap();
//! t.insert(&handle, RecordHandle::new(key, 1, 1), b"kept".to_vec()).unwrap();
//! t.set_savepoint("sp", SavepointKind::Sql).unwrap();
//! t.insert(&handle, RecordHandle::new(key, 1, 2), b"undone".to_vec()).unwrap();
//! t.rollback_to_savepoint("sp", SavepointKind::Sql).unwrap();
//! t.commit().unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod container;
pub mod data;
pub mod error;
pub mod lock;
pub mod log;
pub mod policy;
pub mod types;
pub mod xact;

pub use config::Config;
pub use container::{ContainerHandle, OpenMode};
pub use data::{ContainerState, DataFactory, MemoryDataFactory};
pub use error::{CoreError, CoreResult, Severity};
pub use lock::{LockGroup, LockManager, LockTable, Lockable};
pub use log::{LogOp, Logger, WalLogger};
pub use policy::{Isolation, LockingMode, LockingPolicy, PolicyKind};
pub use types::{
    CompatibilitySpace, ContainerKey, GlobalTransactionId, LogInstant, RecordHandle, TransactionId,
};
pub use xact::{
    CommitFlags, RecoverySummary, RedoSummary, SavepointKind, ServiceOutcome, Serviceable,
    Transaction, TransactionEvent, TransactionInfo, TransactionKind, TransactionListener,
    XaResourceManager, XactContext, XactFactory, XactState, XactStatus, TMENDRSCAN, TMNOFLAGS,
    TMSTARTRSCAN, XA_OK, XA_RDONLY,
};
