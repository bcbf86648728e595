//! The lock manager contract consumed by the core.

use super::modes::LockQualifier;
use crate::error::CoreResult;
use crate::types::{CompatibilitySpace, ContainerKey, RecordHandle};
use std::fmt;
use std::time::Duration;

/// An object that can be locked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lockable {
    /// A whole container.
    Container(ContainerKey),
    /// One record.
    Record(RecordHandle),
}

impl Lockable {
    /// Returns the container this lockable lives in.
    #[must_use]
    pub fn container(&self) -> ContainerKey {
        match self {
            Self::Container(key) => *key,
            Self::Record(record) => record.container,
        }
    }
}

impl fmt::Display for Lockable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Container(key) => write!(f, "container {key}"),
            Self::Record(record) => write!(f, "record {record}"),
        }
    }
}

/// A bucket of locks released together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockGroup {
    /// Locks held until the owning transaction ends. The value is the
    /// transaction's owner token, stable across id changes.
    Transaction(u64),
    /// Read locks tied to one open container handle.
    Container(u64),
}

/// How long a lock request may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitMode {
    /// Fail immediately (returning `false`) if the lock is not available.
    NoWait,
    /// Wait up to the given duration, then fail with a lock timeout.
    Timed(Duration),
}

impl WaitMode {
    /// Picks `Timed(timeout)` if `wait` is set, else `NoWait`.
    #[must_use]
    pub fn from_flag(wait: bool, timeout: Duration) -> Self {
        if wait {
            Self::Timed(timeout)
        } else {
            Self::NoWait
        }
    }
}

/// A page latch the lock manager may release while it waits.
///
/// `release` is called with lock manager internals held and must not call
/// back into the lock manager.
pub trait Latch {
    /// Releases the latch.
    fn release(&mut self);
}

/// Re-entrant lock table keyed by (space, group, lockable, qualifier).
///
/// Requests from the same compatibility space never conflict. Every grant
/// is counted; `unlock` removes one count.
pub trait LockManager: Send + Sync + fmt::Debug {
    /// Acquires a lock.
    ///
    /// Returns `Ok(false)` if `wait` is [`WaitMode::NoWait`] and the lock is
    /// not immediately available.
    ///
    /// # Errors
    ///
    /// Returns `LockTimeout` if a timed wait expires.
    fn lock_object(
        &self,
        space: CompatibilitySpace,
        group: LockGroup,
        lockable: Lockable,
        qualifier: LockQualifier,
        wait: WaitMode,
    ) -> CoreResult<bool>;

    /// Acquires a lock, releasing `latch` first if the request must wait.
    ///
    /// Returns `true` if the latch was released.
    ///
    /// # Errors
    ///
    /// Returns `LockTimeout` if the wait expires.
    fn lock_object_latched(
        &self,
        space: CompatibilitySpace,
        group: LockGroup,
        lockable: Lockable,
        qualifier: LockQualifier,
        timeout: Duration,
        latch: &mut dyn Latch,
    ) -> CoreResult<bool>;

    /// Waits until the lock could be granted, without keeping it.
    ///
    /// # Errors
    ///
    /// Returns `LockTimeout` if a timed wait expires.
    fn zero_duration_lock_object(
        &self,
        space: CompatibilitySpace,
        lockable: Lockable,
        qualifier: LockQualifier,
        wait: WaitMode,
    ) -> CoreResult<bool>;

    /// Removes one count of a lock and returns how many were released
    /// (0 if the lock was not held, else 1).
    fn unlock(
        &self,
        space: CompatibilitySpace,
        group: LockGroup,
        lockable: Lockable,
        qualifier: LockQualifier,
    ) -> usize;

    /// Releases every lock in a group.
    fn unlock_group(&self, space: CompatibilitySpace, group: LockGroup);

    /// Releases the locks of a group whose lockable passes `filter`.
    fn unlock_group_matching(
        &self,
        space: CompatibilitySpace,
        group: LockGroup,
        filter: &dyn Fn(&Lockable) -> bool,
    );

    /// Moves every lock of `from` into `to`.
    fn transfer(&self, space: CompatibilitySpace, from: LockGroup, to: LockGroup);

    /// Returns true if the group holds the lock.
    fn is_lock_held(
        &self,
        space: CompatibilitySpace,
        group: LockGroup,
        lockable: Lockable,
        qualifier: LockQualifier,
    ) -> bool;

    /// Lists the locks held by a group.
    fn locks_in_group(
        &self,
        space: CompatibilitySpace,
        group: LockGroup,
    ) -> Vec<(Lockable, LockQualifier)>;

    /// Arms the lock-count limit of a group.
    fn set_limit(&self, space: CompatibilitySpace, group: LockGroup, limit: usize);

    /// Disarms the lock-count limit of a group.
    fn clear_limit(&self, space: CompatibilitySpace, group: LockGroup);

    /// Returns the group size that crossed the limit, if it was crossed
    /// since the last call to [`limit_handled`](Self::limit_handled).
    fn take_limit_notice(&self, space: CompatibilitySpace, group: LockGroup) -> Option<usize>;

    /// Recomputes the next limit trigger after the owner reacted.
    fn limit_handled(&self, space: CompatibilitySpace, group: LockGroup);

    /// Returns true if any request is currently waiting.
    fn anyone_blocked(&self) -> bool;
}
