//! Reference lock manager.

use super::manager::{Latch, LockGroup, LockManager, Lockable, WaitMode};
use super::modes::LockQualifier;
use crate::error::{CoreError, CoreResult};
use crate::types::CompatibilitySpace;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashMap;
use std::time::{Duration, Instant};

type GroupKey = (CompatibilitySpace, LockGroup);
type LockKey = (Lockable, LockQualifier);

#[derive(Debug)]
struct Limit {
    limit: usize,
    next_call: usize,
    notice: Option<usize>,
}

#[derive(Debug, Default)]
struct TableState {
    /// Grant counts per group.
    groups: HashMap<GroupKey, HashMap<LockKey, u32>>,
    /// Holders per lockable, one entry per distinct grant.
    holders: HashMap<Lockable, Vec<(CompatibilitySpace, LockGroup, LockQualifier)>>,
    limits: HashMap<GroupKey, Limit>,
    waiters: usize,
}

impl TableState {
    fn grantable(
        &self,
        space: CompatibilitySpace,
        lockable: &Lockable,
        qualifier: LockQualifier,
    ) -> bool {
        self.holders.get(lockable).map_or(true, |holders| {
            holders
                .iter()
                .all(|(owner, _, held)| *owner == space || qualifier.is_compatible(*held))
        })
    }

    fn grant(
        &mut self,
        space: CompatibilitySpace,
        group: LockGroup,
        lockable: Lockable,
        qualifier: LockQualifier,
    ) {
        let locks = self.groups.entry((space, group)).or_default();
        let count = locks.entry((lockable, qualifier)).or_insert(0);
        if *count == 0 {
            self.holders
                .entry(lockable)
                .or_default()
                .push((space, group, qualifier));
        }
        *count += 1;
        let size = locks.len();
        if let Some(limit) = self.limits.get_mut(&(space, group)) {
            if size > limit.next_call && limit.notice.is_none() {
                limit.notice = Some(size);
            }
        }
    }

    fn forget_holder(
        &mut self,
        space: CompatibilitySpace,
        group: LockGroup,
        lockable: &Lockable,
        qualifier: LockQualifier,
    ) {
        if let Some(holders) = self.holders.get_mut(lockable) {
            holders.retain(|entry| *entry != (space, group, qualifier));
            if holders.is_empty() {
                self.holders.remove(lockable);
            }
        }
    }

    fn release_where(
        &mut self,
        space: CompatibilitySpace,
        group: LockGroup,
        filter: &dyn Fn(&Lockable) -> bool,
    ) -> usize {
        let Some(locks) = self.groups.get_mut(&(space, group)) else {
            return 0;
        };
        let doomed: Vec<LockKey> = locks.keys().filter(|(l, _)| filter(l)).copied().collect();
        for key in &doomed {
            locks.remove(key);
        }
        if locks.is_empty() {
            self.groups.remove(&(space, group));
        }
        for (lockable, qualifier) in &doomed {
            self.forget_holder(space, group, lockable, *qualifier);
        }
        doomed.len()
    }
}

/// Condvar-based [`LockManager`].
///
/// Deadlocks are not detected; a waiting request simply times out.
///
/// # Example
///
/// ```rust
/// use strata_core::lock::{
///     ContainerLock, LockGroup, LockManager, LockQualifier, LockTable, Lockable, WaitMode,
/// };
/// use strata_core::types::{CompatibilitySpace, ContainerKey};
///
/// let locks = LockTable::new();
/// let table = Lockable::Container(ContainerKey::new(0, 1));
/// let cx = LockQualifier::Container(ContainerLock::Cx);
/// let a = CompatibilitySpace(1);
/// let b = CompatibilitySpace(2);
///
/// assert!(locks.lock_object(a, LockGroup::Transaction(1), table, cx, WaitMode::NoWait).unwrap());
/// assert!(!locks.lock_object(b, LockGroup::Transaction(2), table, cx, WaitMode::NoWait).unwrap());
/// ```
#[derive(Debug, Default)]
pub struct LockTable {
    state: Mutex<TableState>,
    released: Condvar,
}

impl LockTable {
    /// Creates an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until `lockable` is grantable or the deadline passes.
    fn wait_grantable(
        &self,
        state: &mut MutexGuard<'_, TableState>,
        space: CompatibilitySpace,
        lockable: &Lockable,
        qualifier: LockQualifier,
        timeout: Duration,
    ) -> CoreResult<()> {
        let deadline = Instant::now() + timeout;
        state.waiters += 1;
        loop {
            let timed_out = self.released.wait_until(state, deadline).timed_out();
            if state.grantable(space, lockable, qualifier) {
                state.waiters -= 1;
                return Ok(());
            }
            if timed_out {
                state.waiters -= 1;
                tracing::debug!(%lockable, %qualifier, "lock wait timed out");
                return Err(CoreError::lock_timeout(format!("{lockable} ({qualifier})")));
            }
        }
    }

    /// Returns the total number of distinct grants, for diagnostics.
    #[must_use]
    pub fn lock_count(&self) -> usize {
        self.state.lock().groups.values().map(HashMap::len).sum()
    }
}

impl LockManager for LockTable {
    fn lock_object(
        &self,
        space: CompatibilitySpace,
        group: LockGroup,
        lockable: Lockable,
        qualifier: LockQualifier,
        wait: WaitMode,
    ) -> CoreResult<bool> {
        let mut state = self.state.lock();
        if !state.grantable(space, &lockable, qualifier) {
            match wait {
                WaitMode::NoWait => return Ok(false),
                WaitMode::Timed(timeout) => {
                    self.wait_grantable(&mut state, space, &lockable, qualifier, timeout)?;
                }
            }
        }
        state.grant(space, group, lockable, qualifier);
        Ok(true)
    }

    fn lock_object_latched(
        &self,
        space: CompatibilitySpace,
        group: LockGroup,
        lockable: Lockable,
        qualifier: LockQualifier,
        timeout: Duration,
        latch: &mut dyn Latch,
    ) -> CoreResult<bool> {
        let mut state = self.state.lock();
        if state.grantable(space, &lockable, qualifier) {
            state.grant(space, group, lockable, qualifier);
            return Ok(false);
        }
        latch.release();
        self.wait_grantable(&mut state, space, &lockable, qualifier, timeout)?;
        state.grant(space, group, lockable, qualifier);
        Ok(true)
    }

    fn zero_duration_lock_object(
        &self,
        space: CompatibilitySpace,
        lockable: Lockable,
        qualifier: LockQualifier,
        wait: WaitMode,
    ) -> CoreResult<bool> {
        let mut state = self.state.lock();
        if state.grantable(space, &lockable, qualifier) {
            return Ok(true);
        }
        match wait {
            WaitMode::NoWait => Ok(false),
            WaitMode::Timed(timeout) => {
                self.wait_grantable(&mut state, space, &lockable, qualifier, timeout)?;
                Ok(true)
            }
        }
    }

    fn unlock(
        &self,
        space: CompatibilitySpace,
        group: LockGroup,
        lockable: Lockable,
        qualifier: LockQualifier,
    ) -> usize {
        let mut state = self.state.lock();
        let key = (space, group);
        let Some(locks) = state.groups.get_mut(&key) else {
            return 0;
        };
        let Some(count) = locks.get_mut(&(lockable, qualifier)) else {
            return 0;
        };
        *count -= 1;
        if *count == 0 {
            locks.remove(&(lockable, qualifier));
            if locks.is_empty() {
                state.groups.remove(&key);
            }
            state.forget_holder(space, group, &lockable, qualifier);
            self.released.notify_all();
        }
        1
    }

    fn unlock_group(&self, space: CompatibilitySpace, group: LockGroup) {
        let mut state = self.state.lock();
        if state.release_where(space, group, &|_| true) > 0 {
            self.released.notify_all();
        }
    }

    fn unlock_group_matching(
        &self,
        space: CompatibilitySpace,
        group: LockGroup,
        filter: &dyn Fn(&Lockable) -> bool,
    ) {
        let mut state = self.state.lock();
        if state.release_where(space, group, filter) > 0 {
            self.released.notify_all();
        }
    }

    fn transfer(&self, space: CompatibilitySpace, from: LockGroup, to: LockGroup) {
        if from == to {
            return;
        }
        let mut state = self.state.lock();
        let Some(moved) = state.groups.remove(&(space, from)) else {
            return;
        };
        for ((lockable, qualifier), count) in moved {
            state.forget_holder(space, from, &lockable, qualifier);
            let target = state.groups.entry((space, to)).or_default();
            let slot = target.entry((lockable, qualifier)).or_insert(0);
            let fresh = *slot == 0;
            *slot += count;
            if fresh {
                state
                    .holders
                    .entry(lockable)
                    .or_default()
                    .push((space, to, qualifier));
            }
        }
    }

    fn is_lock_held(
        &self,
        space: CompatibilitySpace,
        group: LockGroup,
        lockable: Lockable,
        qualifier: LockQualifier,
    ) -> bool {
        self.state
            .lock()
            .groups
            .get(&(space, group))
            .is_some_and(|locks| locks.contains_key(&(lockable, qualifier)))
    }

    fn locks_in_group(
        &self,
        space: CompatibilitySpace,
        group: LockGroup,
    ) -> Vec<(Lockable, LockQualifier)> {
        self.state
            .lock()
            .groups
            .get(&(space, group))
            .map(|locks| locks.keys().copied().collect())
            .unwrap_or_default()
    }

    fn set_limit(&self, space: CompatibilitySpace, group: LockGroup, limit: usize) {
        self.state.lock().limits.insert(
            (space, group),
            Limit {
                limit,
                next_call: limit,
                notice: None,
            },
        );
    }

    fn clear_limit(&self, space: CompatibilitySpace, group: LockGroup) {
        self.state.lock().limits.remove(&(space, group));
    }

    fn take_limit_notice(&self, space: CompatibilitySpace, group: LockGroup) -> Option<usize> {
        let mut state = self.state.lock();
        state
            .limits
            .get_mut(&(space, group))
            .and_then(|limit| limit.notice.take())
    }

    fn limit_handled(&self, space: CompatibilitySpace, group: LockGroup) {
        let mut state = self.state.lock();
        let size = state.groups.get(&(space, group)).map_or(0, HashMap::len);
        if let Some(limit) = state.limits.get_mut(&(space, group)) {
            if size < limit.limit / 2 {
                limit.next_call = limit.limit;
            } else if size < limit.next_call / 2 {
                limit.next_call -= limit.limit;
            } else {
                limit.next_call += limit.limit;
            }
            limit.notice = None;
        }
    }

    fn anyone_blocked(&self) -> bool {
        self.state.lock().waiters > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{ContainerLock, RowLock};
    use crate::types::{ContainerKey, RecordHandle};
    use std::sync::Arc;
    use std::thread;

    const A: CompatibilitySpace = CompatibilitySpace(1);
    const B: CompatibilitySpace = CompatibilitySpace(2);
    const GA: LockGroup = LockGroup::Transaction(1);
    const GB: LockGroup = LockGroup::Transaction(2);

    fn container() -> Lockable {
        Lockable::Container(ContainerKey::new(0, 7))
    }

    fn record(id: u32) -> Lockable {
        Lockable::Record(RecordHandle::new(ContainerKey::new(0, 7), 1, id))
    }

    fn cont(mode: ContainerLock) -> LockQualifier {
        LockQualifier::Container(mode)
    }

    fn row(mode: RowLock) -> LockQualifier {
        LockQualifier::Row(mode)
    }

    struct FlagLatch(bool);

    impl Latch for FlagLatch {
        fn release(&mut self) {
            self.0 = false;
        }
    }

    #[test]
    fn same_space_never_conflicts() {
        let locks = LockTable::new();
        assert!(locks
            .lock_object(A, GA, container(), cont(ContainerLock::Cx), WaitMode::NoWait)
            .unwrap());
        assert!(locks
            .lock_object(
                A,
                LockGroup::Transaction(9),
                container(),
                cont(ContainerLock::Cx),
                WaitMode::NoWait,
            )
            .unwrap());
        assert!(!locks
            .lock_object(B, GB, container(), cont(ContainerLock::Cis), WaitMode::NoWait)
            .unwrap());
    }

    #[test]
    fn grants_are_counted() {
        let locks = LockTable::new();
        let q = row(RowLock::Rs2);
        locks.lock_object(A, GA, record(1), q, WaitMode::NoWait).unwrap();
        locks.lock_object(A, GA, record(1), q, WaitMode::NoWait).unwrap();
        assert_eq!(locks.unlock(A, GA, record(1), q), 1);
        assert!(locks.is_lock_held(A, GA, record(1), q));
        assert_eq!(locks.unlock(A, GA, record(1), q), 1);
        assert!(!locks.is_lock_held(A, GA, record(1), q));
        assert_eq!(locks.unlock(A, GA, record(1), q), 0);
    }

    #[test]
    fn timed_wait_times_out() {
        let locks = LockTable::new();
        locks
            .lock_object(A, GA, record(1), row(RowLock::Rx3), WaitMode::NoWait)
            .unwrap();
        let err = locks
            .lock_object(
                B,
                GB,
                record(1),
                row(RowLock::Rs3),
                WaitMode::Timed(Duration::from_millis(20)),
            )
            .unwrap_err();
        assert!(err.is_lock_timeout());
        assert!(!locks.anyone_blocked());
    }

    #[test]
    fn waiter_is_woken_by_group_release() {
        let locks = Arc::new(LockTable::new());
        locks
            .lock_object(A, GA, record(1), row(RowLock::Rx3), WaitMode::NoWait)
            .unwrap();
        let waiter = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || {
                locks.lock_object(
                    B,
                    GB,
                    record(1),
                    row(RowLock::Rs3),
                    WaitMode::Timed(Duration::from_secs(5)),
                )
            })
        };
        while !locks.anyone_blocked() {
            thread::yield_now();
        }
        locks.unlock_group(A, GA);
        assert!(waiter.join().unwrap().unwrap());
        assert!(locks.is_lock_held(B, GB, record(1), row(RowLock::Rs3)));
    }

    #[test]
    fn zero_duration_lock_is_not_kept() {
        let locks = LockTable::new();
        assert!(locks
            .zero_duration_lock_object(A, record(3), row(RowLock::Ri), WaitMode::NoWait)
            .unwrap());
        assert_eq!(locks.lock_count(), 0);
        locks
            .lock_object(B, GB, record(3), row(RowLock::Rx3), WaitMode::NoWait)
            .unwrap();
        assert!(!locks
            .zero_duration_lock_object(A, record(3), row(RowLock::Rip), WaitMode::NoWait)
            .unwrap());
    }

    #[test]
    fn latch_is_kept_when_lock_is_free() {
        let locks = LockTable::new();
        let mut latch = FlagLatch(true);
        let released = locks
            .lock_object_latched(
                A,
                GA,
                record(1),
                row(RowLock::Rs2),
                Duration::from_millis(10),
                &mut latch,
            )
            .unwrap();
        assert!(!released);
        assert!(latch.0);
    }

    #[test]
    fn latch_is_released_before_waiting() {
        let locks = LockTable::new();
        locks
            .lock_object(B, GB, record(1), row(RowLock::Rx3), WaitMode::NoWait)
            .unwrap();
        let mut latch = FlagLatch(true);
        let result = locks.lock_object_latched(
            A,
            GA,
            record(1),
            row(RowLock::Rs2),
            Duration::from_millis(10),
            &mut latch,
        );
        assert!(result.unwrap_err().is_lock_timeout());
        assert!(!latch.0);
    }

    #[test]
    fn transfer_moves_locks_between_groups() {
        let locks = LockTable::new();
        let read_group = LockGroup::Container(40);
        locks
            .lock_object(A, read_group, container(), cont(ContainerLock::Cis), WaitMode::NoWait)
            .unwrap();
        locks.transfer(A, read_group, GA);
        assert!(!locks.is_lock_held(A, read_group, container(), cont(ContainerLock::Cis)));
        assert!(locks.is_lock_held(A, GA, container(), cont(ContainerLock::Cis)));
        locks.unlock_group(A, read_group);
        assert!(locks.is_lock_held(A, GA, container(), cont(ContainerLock::Cis)));
    }

    #[test]
    fn matching_unlock_keeps_other_locks() {
        let locks = LockTable::new();
        locks
            .lock_object(A, GA, container(), cont(ContainerLock::Cix), WaitMode::NoWait)
            .unwrap();
        for id in 0..3 {
            locks
                .lock_object(A, GA, record(id), row(RowLock::Rx3), WaitMode::NoWait)
                .unwrap();
        }
        locks.unlock_group_matching(A, GA, &|l| matches!(l, Lockable::Record(_)));
        assert_eq!(locks.locks_in_group(A, GA), vec![(container(), cont(ContainerLock::Cix))]);
    }

    #[test]
    fn limit_notice_and_recalculation() {
        let locks = LockTable::new();
        locks.set_limit(A, GA, 4);
        for id in 0..4 {
            locks
                .lock_object(A, GA, record(id), row(RowLock::Rs3), WaitMode::NoWait)
                .unwrap();
        }
        assert_eq!(locks.take_limit_notice(A, GA), None);
        locks
            .lock_object(A, GA, record(4), row(RowLock::Rs3), WaitMode::NoWait)
            .unwrap();
        assert_eq!(locks.take_limit_notice(A, GA), Some(5));
        // group still large: next trigger moves up one limit
        locks.limit_handled(A, GA);
        for id in 5..8 {
            locks
                .lock_object(A, GA, record(id), row(RowLock::Rs3), WaitMode::NoWait)
                .unwrap();
        }
        assert_eq!(locks.take_limit_notice(A, GA), None);
        locks
            .lock_object(A, GA, record(8), row(RowLock::Rs3), WaitMode::NoWait)
            .unwrap();
        assert_eq!(locks.take_limit_notice(A, GA), Some(9));
        // after shrinking below half the limit the trigger resets
        locks.unlock_group(A, GA);
        locks.limit_handled(A, GA);
        for id in 0..5 {
            locks
                .lock_object(A, GA, record(id), row(RowLock::Rs3), WaitMode::NoWait)
                .unwrap();
        }
        assert_eq!(locks.take_limit_notice(A, GA), Some(5));
        locks.clear_limit(A, GA);
        assert_eq!(locks.take_limit_notice(A, GA), None);
    }
}
