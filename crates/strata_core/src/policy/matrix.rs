//! The (mode, isolation) table of policy singletons.

use super::{Isolation, LockingMode, LockingPolicy, PolicyKind};
use crate::lock::LockManager;
use std::sync::Arc;

const MODES: usize = LockingMode::ALL.len();
const LEVELS: usize = Isolation::ALL.len();

/// Policies indexed by mode and isolation.
///
/// Built once per engine context. Cells that have no policy of their own
/// can be skipped with `stricter_ok` in [`PolicyMatrix::get`].
#[derive(Debug, Clone)]
pub struct PolicyMatrix {
    cells: [[Option<LockingPolicy>; LEVELS]; MODES],
    escalate: LockingPolicy,
}

impl PolicyMatrix {
    /// Builds the standard matrix.
    #[must_use]
    pub fn new(locks: Arc<dyn LockManager>) -> Self {
        use Isolation as I;
        use PolicyKind as K;

        let policy = |kind| Some(LockingPolicy::new(kind, Arc::clone(&locks)));
        let mut cells: [[Option<LockingPolicy>; LEVELS]; MODES] = Default::default();

        cells[LockingMode::None as usize][I::NoLock as usize] = policy(K::NoLocking);

        let row = &mut cells[LockingMode::Record as usize];
        // answers with mode None, not Record
        row[I::NoLock as usize] = policy(K::NoLocking);
        row[I::ReadUncommitted as usize] = policy(K::RowLocking1);
        row[I::ReadCommitted as usize] = policy(K::RowLocking2);
        row[I::ReadCommittedNoHold as usize] = policy(K::RowLocking2NoHold);
        row[I::RepeatableRead as usize] = policy(K::RowLockingRR);
        row[I::Serializable as usize] = policy(K::RowLocking3);

        let row = &mut cells[LockingMode::Container as usize];
        // answers with mode None, not Container
        row[I::NoLock as usize] = policy(K::NoLocking);
        row[I::ReadUncommitted as usize] = policy(K::ContainerLocking2);
        row[I::ReadCommitted as usize] = policy(K::ContainerLocking2);
        row[I::ReadCommittedNoHold as usize] = policy(K::ContainerLocking2);
        row[I::RepeatableRead as usize] = policy(K::ContainerLocking3);
        row[I::Serializable as usize] = policy(K::ContainerLocking3);

        Self {
            cells,
            escalate: LockingPolicy::new(K::RowLocking3Escalate, locks),
        }
    }

    /// Looks up the policy for `mode` and `isolation`.
    ///
    /// Mode `None` always means isolation `NoLock`. If the cell is empty
    /// and `stricter_ok` is set, the cells of stricter modes are searched,
    /// continuing from the requested isolation.
    #[must_use]
    pub fn get(
        &self,
        mode: LockingMode,
        isolation: Isolation,
        stricter_ok: bool,
    ) -> Option<LockingPolicy> {
        let mut level = if mode == LockingMode::None {
            Isolation::NoLock as usize
        } else {
            isolation as usize
        };
        let mut mode = mode as usize;
        if let Some(policy) = &self.cells[mode][level] {
            return Some(policy.clone());
        }
        if !stricter_ok {
            return None;
        }
        mode += 1;
        while mode < MODES {
            while level < LEVELS {
                if let Some(policy) = &self.cells[mode][level] {
                    return Some(policy.clone());
                }
                level += 1;
            }
            mode += 1;
        }
        None
    }

    /// The policy used to escalate row locks to a container lock.
    #[must_use]
    pub fn escalation(&self) -> &LockingPolicy {
        &self.escalate
    }

    #[cfg(test)]
    pub(crate) fn clear_cell(&mut self, mode: LockingMode, isolation: Isolation) {
        self.cells[mode as usize][isolation as usize] = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockTable;
    use proptest::prelude::*;

    fn matrix() -> PolicyMatrix {
        PolicyMatrix::new(Arc::new(LockTable::new()))
    }

    fn any_mode() -> impl Strategy<Value = LockingMode> {
        prop::sample::select(LockingMode::ALL.to_vec())
    }

    fn any_isolation() -> impl Strategy<Value = Isolation> {
        prop::sample::select(Isolation::ALL.to_vec())
    }

    #[test]
    fn standard_cells() {
        let m = matrix();
        let kind = |mode, iso| m.get(mode, iso, false).map(|p| p.kind());
        assert_eq!(
            kind(LockingMode::Record, Isolation::Serializable),
            Some(PolicyKind::RowLocking3)
        );
        assert_eq!(
            kind(LockingMode::Record, Isolation::ReadCommittedNoHold),
            Some(PolicyKind::RowLocking2NoHold)
        );
        assert_eq!(
            kind(LockingMode::Container, Isolation::ReadCommitted),
            Some(PolicyKind::ContainerLocking2)
        );
        assert_eq!(
            kind(LockingMode::Container, Isolation::RepeatableRead),
            Some(PolicyKind::ContainerLocking3)
        );
        assert_eq!(kind(LockingMode::None, Isolation::Serializable), Some(PolicyKind::NoLocking));
        assert_eq!(m.escalation().kind(), PolicyKind::RowLocking3Escalate);
    }

    #[test]
    fn empty_cell_without_stricter_is_none() {
        let mut m = matrix();
        m.clear_cell(LockingMode::Record, Isolation::RepeatableRead);
        assert!(m.get(LockingMode::Record, Isolation::RepeatableRead, false).is_none());
        let stricter = m.get(LockingMode::Record, Isolation::RepeatableRead, true).unwrap();
        assert_eq!(stricter.kind(), PolicyKind::ContainerLocking3);
    }

    #[test]
    fn nothing_stricter_than_container() {
        let mut m = matrix();
        m.clear_cell(LockingMode::Container, Isolation::Serializable);
        assert!(m.get(LockingMode::Container, Isolation::Serializable, true).is_none());
    }

    proptest! {
        #[test]
        fn mode_matches_or_is_stricter(
            mode in any_mode(),
            iso in any_isolation(),
            cleared in prop::sample::select(Isolation::ALL[1..].to_vec()),
        ) {
            let mut m = matrix();
            m.clear_cell(LockingMode::Record, cleared);
            if let Some(policy) = m.get(mode, iso, true) {
                let exact = m.get(mode, iso, false).is_some();
                if exact {
                    // the no-lock column maps to the no-locking policy in every mode
                    let expected = if iso == Isolation::NoLock || mode == LockingMode::None {
                        LockingMode::None
                    } else {
                        mode
                    };
                    prop_assert_eq!(policy.mode(), expected);
                } else {
                    prop_assert!(policy.mode() > mode);
                }
            }
        }
    }
}
