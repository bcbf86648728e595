//! Lock types and their compatibility.

use std::fmt;

/// Container-level lock types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ContainerLock {
    /// Intent shared.
    Cis = 0,
    /// Intent exclusive.
    Cix = 1,
    /// Shared.
    Cs = 2,
    /// Update.
    Cu = 3,
    /// Exclusive.
    Cx = 4,
}

const CONTAINER_COMPAT: [[bool; 5]; 5] = [
    // CIS    CIX    CS     CU     CX
    [true, true, true, false, false],    // CIS
    [true, true, false, false, false],   // CIX
    [true, false, true, false, false],   // CS
    [false, false, true, false, false],  // CU
    [false, false, false, false, false], // CX
];

impl ContainerLock {
    /// Returns true if `self` can be granted while `held` is held by
    /// another compatibility space.
    #[must_use]
    pub const fn is_compatible(self, held: Self) -> bool {
        CONTAINER_COMPAT[self as usize][held as usize]
    }
}

/// Row-level lock types.
///
/// The numeric suffix is the isolation degree the lock serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RowLock {
    /// Shared, degree 2.
    Rs2 = 0,
    /// Shared, degree 3.
    Rs3 = 1,
    /// Update, degree 2.
    Ru2 = 2,
    /// Update, degree 3.
    Ru3 = 3,
    /// Insert previous key.
    Rip = 4,
    /// Insert.
    Ri = 5,
    /// Exclusive, degree 3.
    Rx3 = 6,
}

const ROW_COMPAT: [[bool; 7]; 7] = [
    // RS2   RS3    RU2    RU3    RIP    RI     RX3
    [true, true, true, true, true, false, false],       // RS2
    [true, true, true, true, false, false, false],      // RS3
    [true, true, false, false, true, false, false],     // RU2
    [true, true, false, false, false, false, false],    // RU3
    [true, false, true, false, true, true, false],      // RIP
    [false, false, false, false, true, false, false],   // RI
    [false, false, false, false, false, false, false],  // RX3
];

impl RowLock {
    /// Returns true if `self` can be granted while `held` is held by
    /// another compatibility space.
    #[must_use]
    pub const fn is_compatible(self, held: Self) -> bool {
        ROW_COMPAT[self as usize][held as usize]
    }
}

/// The mode of a lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockQualifier {
    /// A container lock.
    Container(ContainerLock),
    /// A row lock.
    Row(RowLock),
}

impl LockQualifier {
    /// Returns true if `self` can coexist with `held` owned by another space.
    #[must_use]
    pub fn is_compatible(self, held: Self) -> bool {
        match (self, held) {
            (Self::Container(a), Self::Container(b)) => a.is_compatible(b),
            (Self::Row(a), Self::Row(b)) => a.is_compatible(b),
            _ => false,
        }
    }
}

impl fmt::Display for LockQualifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Container(mode) => write!(f, "{mode:?}"),
            Self::Row(mode) => write!(f, "{mode:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTAINER: [ContainerLock; 5] = [
        ContainerLock::Cis,
        ContainerLock::Cix,
        ContainerLock::Cs,
        ContainerLock::Cu,
        ContainerLock::Cx,
    ];

    const ROW: [RowLock; 7] = [
        RowLock::Rs2,
        RowLock::Rs3,
        RowLock::Ru2,
        RowLock::Ru3,
        RowLock::Rip,
        RowLock::Ri,
        RowLock::Rx3,
    ];

    #[test]
    fn container_matrix_is_symmetric() {
        for a in CONTAINER {
            for b in CONTAINER {
                assert_eq!(a.is_compatible(b), b.is_compatible(a), "{a:?}/{b:?}");
            }
        }
    }

    #[test]
    fn row_matrix_is_symmetric() {
        for a in ROW {
            for b in ROW {
                assert_eq!(a.is_compatible(b), b.is_compatible(a), "{a:?}/{b:?}");
            }
        }
    }

    #[test]
    fn exclusive_locks_conflict_with_everything() {
        assert!(CONTAINER.iter().all(|m| !ContainerLock::Cx.is_compatible(*m)));
        assert!(ROW.iter().all(|m| !RowLock::Rx3.is_compatible(*m)));
    }

    #[test]
    fn intent_locks_coexist() {
        assert!(ContainerLock::Cis.is_compatible(ContainerLock::Cix));
        assert!(ContainerLock::Cix.is_compatible(ContainerLock::Cix));
        assert!(!ContainerLock::Cix.is_compatible(ContainerLock::Cs));
    }

    #[test]
    fn insert_previous_key_blocks_degree_three_readers_only() {
        assert!(RowLock::Rip.is_compatible(RowLock::Rs2));
        assert!(!RowLock::Rip.is_compatible(RowLock::Rs3));
        assert!(RowLock::Rip.is_compatible(RowLock::Ri));
    }

    #[test]
    fn container_and_row_qualifiers_never_mix() {
        let c = LockQualifier::Container(ContainerLock::Cis);
        let r = LockQualifier::Row(RowLock::Rs2);
        assert!(!c.is_compatible(r));
    }
}
