//! Open container handles.

use crate::lock::LockGroup;
use crate::policy::{LockScope, LockingMode, LockingPolicy};
use crate::types::ContainerKey;
use crate::xact::{TransactionEvent, TransactionListener};
use parking_lot::Mutex;
use std::fmt;
use std::ops::BitOr;
use std::sync::atomic::{AtomicBool, Ordering};

/// Flags a container is opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenMode(u32);

impl OpenMode {
    /// Read-only access.
    pub const NONE: Self = Self(0);
    /// The handle will be used for writes.
    pub const FOR_UPDATE: Self = Self(0x1);
    /// Take the container lock only; no record access.
    pub const LOCK_ONLY: Self = Self(0x2);
    /// Fail instead of waiting for the container lock.
    pub const NO_WAIT: Self = Self(0x4);

    /// Whether every flag in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for OpenMode {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A container opened by a transaction.
///
/// The handle carries its own locking policy, which starts as the policy it
/// was opened with and may switch to no locking once a covering container
/// lock is held. Read locks of cursor-stability policies live in the handle's
/// own lock group and go away when the handle closes. The owning transaction
/// closes its handles when it commits or aborts.
pub struct ContainerHandle {
    key: ContainerKey,
    unique_id: u64,
    mode: OpenMode,
    scope: LockScope,
    policy: Mutex<LockingPolicy>,
    open: AtomicBool,
}

impl fmt::Debug for ContainerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerHandle")
            .field("key", &self.key)
            .field("unique_id", &self.unique_id)
            .field("mode", &self.mode)
            .field("policy", &self.policy.lock().kind())
            .field("open", &self.is_open())
            .finish()
    }
}

impl ContainerHandle {
    pub(crate) fn new(
        key: ContainerKey,
        unique_id: u64,
        mode: OpenMode,
        policy: LockingPolicy,
        scope: LockScope,
    ) -> Self {
        Self {
            key,
            unique_id,
            mode,
            scope,
            policy: Mutex::new(policy),
            open: AtomicBool::new(true),
        }
    }

    /// Returns the container key.
    #[must_use]
    pub fn key(&self) -> ContainerKey {
        self.key
    }

    /// Returns the id unique to this open handle.
    #[must_use]
    pub fn unique_id(&self) -> u64 {
        self.unique_id
    }

    /// Lock group holding read locks tied to this handle.
    #[must_use]
    pub fn read_group(&self) -> LockGroup {
        LockGroup::Container(self.unique_id)
    }

    /// Returns the open mode.
    #[must_use]
    pub fn open_mode(&self) -> OpenMode {
        self.mode
    }

    /// Whether the handle was opened for writes.
    #[must_use]
    pub fn for_update(&self) -> bool {
        self.mode.contains(OpenMode::FOR_UPDATE)
    }

    /// Whether the handle only holds a lock.
    #[must_use]
    pub fn lock_only(&self) -> bool {
        self.mode.contains(OpenMode::LOCK_ONLY)
    }

    /// Returns the current locking policy.
    #[must_use]
    pub fn policy(&self) -> LockingPolicy {
        self.policy.lock().clone()
    }

    pub(crate) fn set_policy(&self, policy: LockingPolicy) {
        tracing::trace!(container = %self.key, kind = ?policy.kind(), "container policy switched");
        *self.policy.lock() = policy;
    }

    pub(crate) fn scope(&self) -> &LockScope {
        &self.scope
    }

    /// Whether the handle is still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Closes the handle, releasing the locks tied to it. Closing twice is a
    /// no-op.
    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            self.policy().unlock_container(&self.scope, self);
        }
    }
}

impl TransactionListener for ContainerHandle {
    fn on_event(&self, event: TransactionEvent) {
        match event {
            TransactionEvent::Commit | TransactionEvent::Abort => self.close(),
            TransactionEvent::LockEscalate => {
                let policy = self.policy();
                if self.is_open()
                    && policy.mode() == LockingMode::Record
                    && policy.is_covered(&self.scope, self.key, self.for_update())
                {
                    self.set_policy(policy.no_locking());
                }
            }
            TransactionEvent::SavepointRollback => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{
        ContainerLock, LockManager, LockQualifier, LockTable, Lockable, RowLock, WaitMode,
    };
    use crate::policy::PolicyKind;
    use crate::types::{CompatibilitySpace, RecordHandle};
    use std::sync::Arc;
    use std::time::Duration;

    fn scope() -> LockScope {
        LockScope {
            space: CompatibilitySpace(3),
            group: LockGroup::Transaction(3),
            timeout: Duration::from_millis(10),
        }
    }

    fn open(kind: PolicyKind, mode: OpenMode) -> (Arc<LockTable>, ContainerHandle) {
        let table = Arc::new(LockTable::new());
        let policy = LockingPolicy::new(kind, table.clone());
        let handle = ContainerHandle::new(ContainerKey::new(0, 9), 12, mode, policy, scope());
        (table, handle)
    }

    #[test]
    fn open_mode_flags() {
        let mode = OpenMode::FOR_UPDATE | OpenMode::NO_WAIT;
        assert!(mode.contains(OpenMode::FOR_UPDATE));
        assert!(mode.contains(OpenMode::NO_WAIT));
        assert!(!mode.contains(OpenMode::LOCK_ONLY));
        assert!(mode.contains(OpenMode::NONE));
    }

    #[test]
    fn commit_closes_and_releases_read_group() {
        let (table, handle) = open(PolicyKind::RowLocking2, OpenMode::NONE);
        let s = scope();
        handle.policy().lock_container(&s, &handle, false, false).unwrap();
        let record = RecordHandle::new(handle.key(), 1, 1);
        handle
            .policy()
            .lock_record_for_read(&s, &handle, record, false, false)
            .unwrap();
        assert_eq!(table.locks_in_group(s.space, handle.read_group()).len(), 2);
        handle.on_event(TransactionEvent::Commit);
        assert!(!handle.is_open());
        assert_eq!(table.lock_count(), 0);
        handle.on_event(TransactionEvent::Abort);
        assert!(!handle.is_open());
    }

    #[test]
    fn escalation_event_switches_covered_handle() {
        let (table, handle) = open(PolicyKind::RowLocking3, OpenMode::FOR_UPDATE);
        let s = scope();
        handle.on_event(TransactionEvent::LockEscalate);
        assert_eq!(handle.policy().kind(), PolicyKind::RowLocking3);

        // a shared container lock does not cover an update handle
        table
            .lock_object(
                s.space,
                s.group,
                Lockable::Container(handle.key()),
                LockQualifier::Container(ContainerLock::Cs),
                WaitMode::NoWait,
            )
            .unwrap();
        handle.on_event(TransactionEvent::LockEscalate);
        assert_eq!(handle.policy().kind(), PolicyKind::RowLocking3);

        table
            .lock_object(
                s.space,
                s.group,
                Lockable::Container(handle.key()),
                LockQualifier::Container(ContainerLock::Cx),
                WaitMode::NoWait,
            )
            .unwrap();
        handle.on_event(TransactionEvent::LockEscalate);
        assert_eq!(handle.policy().kind(), PolicyKind::NoLocking);
        assert!(handle
            .policy()
            .lock_record_for_write(&s, RecordHandle::new(handle.key(), 1, 2), false, false)
            .unwrap());
        let rows = table
            .locks_in_group(s.space, s.group)
            .into_iter()
            .filter(|(_, q)| matches!(q, LockQualifier::Row(RowLock::Rx3)))
            .count();
        assert_eq!(rows, 0);
    }
}
