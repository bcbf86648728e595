//! Locking primitives.
//!
//! The core consumes locks through the [`LockManager`] trait only. Lock
//! requests are keyed by compatibility space, group, lockable object and
//! qualifier. [`LockTable`] is the reference implementation used by the
//! engine context and the tests.

mod manager;
mod modes;
mod table;

pub use manager::{Latch, LockGroup, LockManager, Lockable, WaitMode};
pub use modes::{ContainerLock, LockQualifier, RowLock};
pub use table::LockTable;
