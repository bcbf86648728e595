//! Locking policies.
//!
//! A [`LockingPolicy`] decides which container and row locks a transaction
//! requests for a given granularity and isolation degree. Policies are
//! immutable and cheap to clone; the only state they carry is the lock
//! manager they talk to. The nine variants are listed in [`PolicyKind`] and
//! are picked from a fixed [`PolicyMatrix`] by (mode, isolation).

mod matrix;

pub use matrix::PolicyMatrix;

use crate::container::ContainerHandle;
use crate::error::{CoreError, CoreResult};
use crate::lock::{
    ContainerLock, Latch, LockGroup, LockManager, LockQualifier, Lockable, RowLock, WaitMode,
};
use crate::types::{CompatibilitySpace, ContainerKey, RecordHandle};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Lock granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockingMode {
    /// No locking at all.
    None = 0,
    /// Row locks under container intent locks.
    Record = 1,
    /// Container locks only.
    Container = 2,
}

impl LockingMode {
    /// All modes, least strict first.
    pub const ALL: [Self; 3] = [Self::None, Self::Record, Self::Container];
}

/// Isolation degree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Isolation {
    /// No locks.
    NoLock = 0,
    /// Degree 1: dirty reads.
    ReadUncommitted = 1,
    /// Degree 2: cursor stability.
    ReadCommitted = 2,
    /// Degree 2 without holding read locks past the read.
    ReadCommittedNoHold = 3,
    /// Degree 2.99: read locks held, phantoms possible.
    RepeatableRead = 4,
    /// Degree 3.
    Serializable = 5,
}

impl Isolation {
    /// All isolation degrees, weakest first.
    pub const ALL: [Self; 6] = [
        Self::NoLock,
        Self::ReadUncommitted,
        Self::ReadCommitted,
        Self::ReadCommittedNoHold,
        Self::RepeatableRead,
        Self::Serializable,
    ];
}

/// The concrete locking strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyKind {
    /// Never locks.
    NoLocking,
    /// Container locks; read locks released with the container handle.
    ContainerLocking2,
    /// Container locks held to the end of the transaction.
    ContainerLocking3,
    /// Row locking that skips plain read locks.
    RowLocking1,
    /// Row locking with read locks released with the container handle.
    RowLocking2,
    /// Row locking with zero-duration read locks.
    RowLocking2NoHold,
    /// Row locking that drops read locks on rows failing a qualifier.
    RowLockingRR,
    /// Row locking with every lock held to the end of the transaction.
    RowLocking3,
    /// Container locking used only to escalate row locks.
    RowLocking3Escalate,
}

impl PolicyKind {
    /// Granularity of locks this strategy takes.
    #[must_use]
    pub const fn mode(self) -> LockingMode {
        match self {
            Self::NoLocking => LockingMode::None,
            Self::ContainerLocking2 | Self::ContainerLocking3 | Self::RowLocking3Escalate => {
                LockingMode::Container
            }
            Self::RowLocking1
            | Self::RowLocking2
            | Self::RowLocking2NoHold
            | Self::RowLockingRR
            | Self::RowLocking3 => LockingMode::Record,
        }
    }

    const fn is_row(self) -> bool {
        matches!(self.mode(), LockingMode::Record)
    }
}

/// Identifies who is asking for a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockScope {
    /// Compatibility space of the requesting transaction.
    pub space: CompatibilitySpace,
    /// The transaction's own lock group.
    pub group: LockGroup,
    /// Bound for timed waits.
    pub timeout: Duration,
}

impl LockScope {
    fn wait(&self, wait: bool) -> WaitMode {
        WaitMode::from_flag(wait, self.timeout)
    }
}

/// A locking strategy bound to a lock manager.
#[derive(Clone)]
pub struct LockingPolicy {
    kind: PolicyKind,
    locks: Arc<dyn LockManager>,
}

impl fmt::Debug for LockingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockingPolicy")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl LockingPolicy {
    /// Creates a policy of the given kind.
    #[must_use]
    pub fn new(kind: PolicyKind, locks: Arc<dyn LockManager>) -> Self {
        Self { kind, locks }
    }

    /// Returns the strategy.
    #[must_use]
    pub fn kind(&self) -> PolicyKind {
        self.kind
    }

    /// Returns the lock granularity.
    #[must_use]
    pub fn mode(&self) -> LockingMode {
        self.kind.mode()
    }

    /// Returns a no-locking policy sharing this policy's lock manager.
    #[must_use]
    pub fn no_locking(&self) -> Self {
        Self::new(PolicyKind::NoLocking, Arc::clone(&self.locks))
    }

    /// Locks the container behind `handle`.
    ///
    /// Row policies take an intent lock; if a covering container lock is
    /// already held by the transaction, the handle switches to no locking.
    /// Returns `false` if `wait` is unset and the lock is unavailable.
    ///
    /// # Errors
    ///
    /// Returns a lock timeout if a timed wait expires.
    pub fn lock_container(
        &self,
        scope: &LockScope,
        handle: &ContainerHandle,
        wait: bool,
        for_update: bool,
    ) -> CoreResult<bool> {
        let container = Lockable::Container(handle.key());
        match self.kind {
            PolicyKind::NoLocking => Ok(true),
            PolicyKind::ContainerLocking3 => {
                let mode = if for_update { ContainerLock::Cx } else { ContainerLock::Cs };
                self.locks.lock_object(
                    scope.space,
                    scope.group,
                    container,
                    LockQualifier::Container(mode),
                    scope.wait(wait),
                )
            }
            PolicyKind::ContainerLocking2 => {
                let (group, mode) = if for_update {
                    (scope.group, ContainerLock::Cx)
                } else {
                    (handle.read_group(), ContainerLock::Cs)
                };
                self.locks.lock_object(
                    scope.space,
                    group,
                    container,
                    LockQualifier::Container(mode),
                    scope.wait(wait),
                )
            }
            PolicyKind::RowLocking3Escalate => self.escalate_container(scope, handle, wait),
            PolicyKind::RowLocking3 | PolicyKind::RowLockingRR => {
                self.lock_intent(scope, handle, wait, for_update)
            }
            PolicyKind::RowLocking2 | PolicyKind::RowLocking1 | PolicyKind::RowLocking2NoHold => {
                if for_update {
                    return self.lock_intent(scope, handle, wait, true);
                }
                self.lock_intent_for_read(scope, handle, wait)
            }
        }
    }

    /// Intent lock in the transaction group, held to the end of the
    /// transaction.
    fn lock_intent(
        &self,
        scope: &LockScope,
        handle: &ContainerHandle,
        wait: bool,
        for_update: bool,
    ) -> CoreResult<bool> {
        let container = Lockable::Container(handle.key());
        let intent = if for_update { ContainerLock::Cix } else { ContainerLock::Cis };
        let granted = self.locks.lock_object(
            scope.space,
            scope.group,
            container,
            LockQualifier::Container(intent),
            scope.wait(wait),
        )?;
        if granted && self.is_covered(scope, handle.key(), for_update) {
            handle.set_policy(self.no_locking());
        }
        Ok(granted)
    }

    /// Shared intent lock in the handle's read group, released when the
    /// handle closes.
    fn lock_intent_for_read(
        &self,
        scope: &LockScope,
        handle: &ContainerHandle,
        wait: bool,
    ) -> CoreResult<bool> {
        let container = Lockable::Container(handle.key());
        let granted = self.locks.lock_object(
            scope.space,
            handle.read_group(),
            container,
            LockQualifier::Container(ContainerLock::Cis),
            scope.wait(wait),
        )?;
        if granted {
            if self.holds(scope, container, ContainerLock::Cx) {
                self.locks.unlock_group(scope.space, handle.read_group());
                handle.set_policy(self.no_locking());
            } else if self.holds(scope, container, ContainerLock::Cs) {
                self.locks
                    .transfer(scope.space, handle.read_group(), scope.group);
                handle.set_policy(self.no_locking());
            }
        }
        Ok(granted)
    }

    /// Trades the transaction's row locks in one container for a single
    /// container lock. Exclusive if an exclusive intent lock is held.
    fn escalate_container(
        &self,
        scope: &LockScope,
        handle: &ContainerHandle,
        wait: bool,
    ) -> CoreResult<bool> {
        let key = handle.key();
        let container = Lockable::Container(key);
        let mode = if self.holds(scope, container, ContainerLock::Cix) {
            ContainerLock::Cx
        } else {
            ContainerLock::Cs
        };
        let granted = self.locks.lock_object(
            scope.space,
            scope.group,
            container,
            LockQualifier::Container(mode),
            scope.wait(wait),
        )?;
        if !granted {
            return Ok(false);
        }
        self.locks
            .unlock_group_matching(scope.space, scope.group, &|lockable| {
                matches!(lockable, Lockable::Record(record) if record.container == key)
            });
        Ok(true)
    }

    /// Whether the transaction already holds a container lock that makes
    /// row locks in `key` redundant.
    pub(crate) fn is_covered(
        &self,
        scope: &LockScope,
        key: ContainerKey,
        for_update: bool,
    ) -> bool {
        let container = Lockable::Container(key);
        self.holds(scope, container, ContainerLock::Cx)
            || (!for_update && self.holds(scope, container, ContainerLock::Cs))
    }

    /// Checks the transaction's own group, never a read group.
    fn holds(&self, scope: &LockScope, container: Lockable, mode: ContainerLock) -> bool {
        self.locks.is_lock_held(
            scope.space,
            scope.group,
            container,
            LockQualifier::Container(mode),
        )
    }

    /// Releases locks tied to the handle.
    pub fn unlock_container(&self, scope: &LockScope, handle: &ContainerHandle) {
        match self.kind {
            PolicyKind::ContainerLocking2
            | PolicyKind::RowLocking2
            | PolicyKind::RowLocking1
            | PolicyKind::RowLocking2NoHold => {
                self.locks.unlock_group(scope.space, handle.read_group());
            }
            _ => {}
        }
    }

    fn read_lock(&self, for_update: bool) -> Option<(RowLock, bool)> {
        // (lock type, held in the transaction group)
        match self.kind {
            PolicyKind::RowLocking3 => {
                Some((if for_update { RowLock::Ru3 } else { RowLock::Rs3 }, true))
            }
            PolicyKind::RowLockingRR => {
                Some((if for_update { RowLock::Ru2 } else { RowLock::Rs2 }, true))
            }
            PolicyKind::RowLocking2 | PolicyKind::RowLocking2NoHold => {
                Some((if for_update { RowLock::Ru2 } else { RowLock::Rs2 }, false))
            }
            PolicyKind::RowLocking1 if for_update => Some((RowLock::Ru2, false)),
            _ => None,
        }
    }

    /// Locks a record for reading.
    ///
    /// # Errors
    ///
    /// Returns a lock timeout if a timed wait expires.
    pub fn lock_record_for_read(
        &self,
        scope: &LockScope,
        handle: &ContainerHandle,
        record: RecordHandle,
        wait: bool,
        for_update: bool,
    ) -> CoreResult<bool> {
        let Some((mode, in_transaction)) = self.read_lock(for_update) else {
            return Ok(true);
        };
        let lockable = Lockable::Record(record);
        let qualifier = LockQualifier::Row(mode);
        if self.kind == PolicyKind::RowLocking2NoHold {
            return self
                .locks
                .zero_duration_lock_object(scope.space, lockable, qualifier, scope.wait(wait));
        }
        let group = if in_transaction {
            scope.group
        } else {
            handle.read_group()
        };
        self.locks
            .lock_object(scope.space, group, lockable, qualifier, scope.wait(wait))
    }

    /// Locks a record for reading while a page latch is held.
    ///
    /// Always waits. Returns whether the latch was released to wait.
    ///
    /// # Errors
    ///
    /// Returns a lock timeout if the wait expires.
    pub fn lock_record_for_read_latched(
        &self,
        scope: &LockScope,
        handle: &ContainerHandle,
        record: RecordHandle,
        for_update: bool,
        latch: &mut dyn Latch,
    ) -> CoreResult<bool> {
        let Some((mode, in_transaction)) = self.read_lock(for_update) else {
            return Ok(false);
        };
        let lockable = Lockable::Record(record);
        let qualifier = LockQualifier::Row(mode);
        if self.kind == PolicyKind::RowLocking2NoHold {
            self.locks.zero_duration_lock_object(
                scope.space,
                lockable,
                qualifier,
                WaitMode::Timed(scope.timeout),
            )?;
            return Ok(false);
        }
        let group = if in_transaction {
            scope.group
        } else {
            handle.read_group()
        };
        self.locks.lock_object_latched(
            scope.space,
            group,
            lockable,
            qualifier,
            scope.timeout,
            latch,
        )
    }

    /// Locks a record for insert (`RI`) or update/delete (`RX3`), held to
    /// the end of the transaction.
    ///
    /// # Errors
    ///
    /// Returns a lock timeout if a timed wait expires.
    pub fn lock_record_for_write(
        &self,
        scope: &LockScope,
        record: RecordHandle,
        lock_for_insert: bool,
        wait: bool,
    ) -> CoreResult<bool> {
        if !self.kind.is_row() {
            return Ok(true);
        }
        let mode = if lock_for_insert { RowLock::Ri } else { RowLock::Rx3 };
        self.locks.lock_object(
            scope.space,
            scope.group,
            Lockable::Record(record),
            LockQualifier::Row(mode),
            scope.wait(wait),
        )
    }

    /// Exclusive record lock taken while a page latch is held.
    ///
    /// # Errors
    ///
    /// Returns a lock timeout if the wait expires.
    pub fn lock_record_for_write_latched(
        &self,
        scope: &LockScope,
        record: RecordHandle,
        latch: &mut dyn Latch,
    ) -> CoreResult<bool> {
        if !self.kind.is_row() {
            return Ok(false);
        }
        self.locks.lock_object_latched(
            scope.space,
            scope.group,
            Lockable::Record(record),
            LockQualifier::Row(RowLock::Rx3),
            scope.timeout,
            latch,
        )
    }

    /// Checks that an insert may proceed without keeping a lock.
    ///
    /// `previous_key` requests `RIP` on the key before the insert point,
    /// otherwise `RI` on the record itself.
    ///
    /// # Errors
    ///
    /// Returns a lock timeout if a timed wait expires.
    pub fn zero_duration_lock_record_for_write(
        &self,
        scope: &LockScope,
        record: RecordHandle,
        previous_key: bool,
        wait: bool,
    ) -> CoreResult<bool> {
        if !self.kind.is_row() {
            return Ok(true);
        }
        let mode = if previous_key { RowLock::Rip } else { RowLock::Ri };
        self.locks.zero_duration_lock_object(
            scope.space,
            Lockable::Record(record),
            LockQualifier::Row(mode),
            scope.wait(wait),
        )
    }

    /// Releases a read lock early where the isolation degree allows it.
    ///
    /// # Errors
    ///
    /// Returns `LockAccounting` if the lock manager reports more than one
    /// released grant.
    pub fn unlock_record_after_read(
        &self,
        scope: &LockScope,
        handle: &ContainerHandle,
        record: RecordHandle,
        for_update: bool,
        row_qualified: bool,
    ) -> CoreResult<()> {
        let group = match self.kind {
            PolicyKind::RowLockingRR if !row_qualified => scope.group,
            PolicyKind::RowLocking2 => handle.read_group(),
            PolicyKind::RowLocking1 if for_update => handle.read_group(),
            _ => return Ok(()),
        };
        let mode = if for_update { RowLock::Ru2 } else { RowLock::Rs2 };
        let lockable = Lockable::Record(record);
        let released = self
            .locks
            .unlock(scope.space, group, lockable, LockQualifier::Row(mode));
        // zero is legal: escalation may already have dropped the lock
        if released > 1 {
            return Err(CoreError::LockAccounting {
                resource: lockable.to_string(),
                released,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::OpenMode;
    use crate::lock::LockTable;

    const SPACE: CompatibilitySpace = CompatibilitySpace(1);
    const OTHER: CompatibilitySpace = CompatibilitySpace(2);

    fn scope() -> LockScope {
        LockScope {
            space: SPACE,
            group: LockGroup::Transaction(1),
            timeout: Duration::from_millis(20),
        }
    }

    fn fixture(kind: PolicyKind) -> (Arc<LockTable>, LockingPolicy, ContainerHandle) {
        let table = Arc::new(LockTable::new());
        let locks: Arc<dyn LockManager> = table.clone();
        let policy = LockingPolicy::new(kind, locks);
        let handle = ContainerHandle::new(
            ContainerKey::new(0, 5),
            77,
            OpenMode::NONE,
            policy.clone(),
            scope(),
        );
        (table, policy, handle)
    }

    fn record(id: u32) -> RecordHandle {
        RecordHandle::new(ContainerKey::new(0, 5), 1, id)
    }

    fn held(table: &LockTable, group: LockGroup, lockable: Lockable, q: LockQualifier) -> bool {
        table.is_lock_held(SPACE, group, lockable, q)
    }

    #[test]
    fn modes_per_kind() {
        assert_eq!(PolicyKind::NoLocking.mode(), LockingMode::None);
        assert_eq!(PolicyKind::ContainerLocking2.mode(), LockingMode::Container);
        assert_eq!(PolicyKind::RowLocking3Escalate.mode(), LockingMode::Container);
        assert_eq!(PolicyKind::RowLockingRR.mode(), LockingMode::Record);
    }

    #[test]
    fn no_locking_never_touches_the_table() {
        let (table, policy, handle) = fixture(PolicyKind::NoLocking);
        let s = scope();
        assert!(policy.lock_container(&s, &handle, false, true).unwrap());
        assert!(policy.lock_record_for_read(&s, &handle, record(1), false, true).unwrap());
        assert!(policy.lock_record_for_write(&s, record(1), false, false).unwrap());
        assert_eq!(table.lock_count(), 0);
    }

    #[test]
    fn row_locking3_takes_intent_and_row_locks() {
        let (table, policy, handle) = fixture(PolicyKind::RowLocking3);
        let s = scope();
        let container = Lockable::Container(handle.key());
        assert!(policy.lock_container(&s, &handle, false, true).unwrap());
        assert!(held(&table, s.group, container, LockQualifier::Container(ContainerLock::Cix)));
        assert!(policy.lock_record_for_write(&s, record(1), false, false).unwrap());
        assert!(held(
            &table,
            s.group,
            Lockable::Record(record(1)),
            LockQualifier::Row(RowLock::Rx3),
        ));
        assert!(policy.lock_record_for_read(&s, &handle, record(2), false, false).unwrap());
        assert!(held(
            &table,
            s.group,
            Lockable::Record(record(2)),
            LockQualifier::Row(RowLock::Rs3),
        ));
        assert_eq!(handle.policy().kind(), PolicyKind::RowLocking3);
    }

    #[test]
    fn covering_container_lock_switches_handle_to_no_locking() {
        let (table, policy, handle) = fixture(PolicyKind::RowLocking3);
        let s = scope();
        table
            .lock_object(
                SPACE,
                s.group,
                Lockable::Container(handle.key()),
                LockQualifier::Container(ContainerLock::Cx),
                WaitMode::NoWait,
            )
            .unwrap();
        assert!(policy.lock_container(&s, &handle, false, true).unwrap());
        assert_eq!(handle.policy().kind(), PolicyKind::NoLocking);
    }

    #[test]
    fn covering_lock_in_read_group_is_ignored() {
        let (table, policy, handle) = fixture(PolicyKind::RowLocking3);
        let s = scope();
        table
            .lock_object(
                SPACE,
                handle.read_group(),
                Lockable::Container(handle.key()),
                LockQualifier::Container(ContainerLock::Cs),
                WaitMode::NoWait,
            )
            .unwrap();
        assert!(policy.lock_container(&s, &handle, false, false).unwrap());
        assert_eq!(handle.policy().kind(), PolicyKind::RowLocking3);
    }

    #[test]
    fn row_locking2_reads_live_in_the_handle_group() {
        let (table, policy, handle) = fixture(PolicyKind::RowLocking2);
        let s = scope();
        let container = Lockable::Container(handle.key());
        assert!(policy.lock_container(&s, &handle, false, false).unwrap());
        assert!(held(
            &table,
            handle.read_group(),
            container,
            LockQualifier::Container(ContainerLock::Cis),
        ));
        assert!(policy.lock_record_for_read(&s, &handle, record(3), false, false).unwrap());
        let row = Lockable::Record(record(3));
        assert!(held(&table, handle.read_group(), row, LockQualifier::Row(RowLock::Rs2)));
        policy
            .unlock_record_after_read(&s, &handle, record(3), false, true)
            .unwrap();
        assert!(!held(&table, handle.read_group(), row, LockQualifier::Row(RowLock::Rs2)));
        policy.unlock_container(&s, &handle);
        assert_eq!(table.lock_count(), 0);
    }

    #[test]
    fn row_locking2_shared_container_lock_is_transferred() {
        let (table, policy, handle) = fixture(PolicyKind::RowLocking2);
        let s = scope();
        let container = Lockable::Container(handle.key());
        table
            .lock_object(
                SPACE,
                s.group,
                container,
                LockQualifier::Container(ContainerLock::Cs),
                WaitMode::NoWait,
            )
            .unwrap();
        assert!(policy.lock_container(&s, &handle, false, false).unwrap());
        assert!(held(&table, s.group, container, LockQualifier::Container(ContainerLock::Cis)));
        assert!(!held(
            &table,
            handle.read_group(),
            container,
            LockQualifier::Container(ContainerLock::Cis),
        ));
        assert_eq!(handle.policy().kind(), PolicyKind::NoLocking);
    }

    #[test]
    fn read_uncommitted_skips_plain_reads() {
        let (table, policy, handle) = fixture(PolicyKind::RowLocking1);
        let s = scope();
        assert!(policy.lock_record_for_read(&s, &handle, record(1), false, false).unwrap());
        assert_eq!(table.lock_count(), 0);
        assert!(policy.lock_record_for_read(&s, &handle, record(1), false, true).unwrap());
        assert!(held(
            &table,
            handle.read_group(),
            Lockable::Record(record(1)),
            LockQualifier::Row(RowLock::Ru2),
        ));
    }

    #[test]
    fn no_hold_reads_are_zero_duration() {
        let (table, policy, handle) = fixture(PolicyKind::RowLocking2NoHold);
        let s = scope();
        assert!(policy.lock_record_for_read(&s, &handle, record(1), false, false).unwrap());
        assert_eq!(table.lock_count(), 0);
        table
            .lock_object(
                OTHER,
                LockGroup::Transaction(2),
                Lockable::Record(record(1)),
                LockQualifier::Row(RowLock::Rx3),
                WaitMode::NoWait,
            )
            .unwrap();
        assert!(!policy.lock_record_for_read(&s, &handle, record(1), false, false).unwrap());
    }

    #[test]
    fn repeatable_read_drops_only_unqualified_rows() {
        let (table, policy, handle) = fixture(PolicyKind::RowLockingRR);
        let s = scope();
        for id in [1, 2] {
            policy.lock_record_for_read(&s, &handle, record(id), false, false).unwrap();
        }
        policy.unlock_record_after_read(&s, &handle, record(1), false, true).unwrap();
        policy.unlock_record_after_read(&s, &handle, record(2), false, false).unwrap();
        assert!(held(
            &table,
            s.group,
            Lockable::Record(record(1)),
            LockQualifier::Row(RowLock::Rs2),
        ));
        assert!(!held(
            &table,
            s.group,
            Lockable::Record(record(2)),
            LockQualifier::Row(RowLock::Rs2),
        ));
    }

    #[test]
    fn container_locking2_reads_release_with_handle() {
        let (table, policy, handle) = fixture(PolicyKind::ContainerLocking2);
        let s = scope();
        assert!(policy.lock_container(&s, &handle, false, false).unwrap());
        assert_eq!(table.locks_in_group(SPACE, handle.read_group()).len(), 1);
        policy.unlock_container(&s, &handle);
        assert_eq!(table.lock_count(), 0);
        assert!(policy.lock_container(&s, &handle, false, true).unwrap());
        policy.unlock_container(&s, &handle);
        assert!(held(
            &table,
            s.group,
            Lockable::Container(handle.key()),
            LockQualifier::Container(ContainerLock::Cx),
        ));
    }

    #[test]
    fn escalation_swaps_row_locks_for_container_lock() {
        let (table, policy, handle) = fixture(PolicyKind::RowLocking3);
        let s = scope();
        policy.lock_container(&s, &handle, false, true).unwrap();
        for id in 0..10 {
            policy.lock_record_for_write(&s, record(id), false, false).unwrap();
        }
        let escalate = LockingPolicy::new(PolicyKind::RowLocking3Escalate, table.clone());
        let escalating = ContainerHandle::new(
            handle.key(),
            78,
            OpenMode::LOCK_ONLY,
            escalate.clone(),
            scope(),
        );
        assert!(escalate.lock_container(&s, &escalating, false, true).unwrap());
        let container = Lockable::Container(handle.key());
        assert!(held(&table, s.group, container, LockQualifier::Container(ContainerLock::Cx)));
        let rows = table
            .locks_in_group(SPACE, s.group)
            .into_iter()
            .filter(|(l, _)| matches!(l, Lockable::Record(_)))
            .count();
        assert_eq!(rows, 0);
    }

    #[test]
    fn escalation_fails_without_waiting() {
        let (table, policy, handle) = fixture(PolicyKind::RowLocking3);
        let s = scope();
        policy.lock_container(&s, &handle, false, false).unwrap();
        policy.lock_record_for_read(&s, &handle, record(1), false, false).unwrap();
        table
            .lock_object(
                OTHER,
                LockGroup::Transaction(2),
                Lockable::Container(handle.key()),
                LockQualifier::Container(ContainerLock::Cix),
                WaitMode::NoWait,
            )
            .unwrap();
        let escalate = LockingPolicy::new(PolicyKind::RowLocking3Escalate, table.clone());
        let escalating = ContainerHandle::new(
            handle.key(),
            79,
            OpenMode::LOCK_ONLY,
            escalate.clone(),
            scope(),
        );
        assert!(!escalate.lock_container(&s, &escalating, false, false).unwrap());
        assert!(held(
            &table,
            s.group,
            Lockable::Record(record(1)),
            LockQualifier::Row(RowLock::Rs3),
        ));
    }

    #[test]
    fn zero_duration_write_uses_previous_key_lock() {
        let (table, policy, _handle) = fixture(PolicyKind::RowLocking3);
        let s = scope();
        let other = LockGroup::Transaction(2);
        table
            .lock_object(
                OTHER,
                other,
                Lockable::Record(record(4)),
                LockQualifier::Row(RowLock::Rs3),
                WaitMode::NoWait,
            )
            .unwrap();
        table
            .lock_object(
                OTHER,
                other,
                Lockable::Record(record(5)),
                LockQualifier::Row(RowLock::Rs2),
                WaitMode::NoWait,
            )
            .unwrap();
        assert!(!policy.zero_duration_lock_record_for_write(&s, record(4), true, false).unwrap());
        assert!(policy.zero_duration_lock_record_for_write(&s, record(5), true, false).unwrap());
        assert!(!policy.zero_duration_lock_record_for_write(&s, record(5), false, false).unwrap());
        assert_eq!(table.locks_in_group(SPACE, s.group).len(), 0);
    }
}
