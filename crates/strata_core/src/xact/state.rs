//! Transaction states, status bits and commit flags.

use std::fmt;
use std::ops::BitOr;

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum XactState {
    /// Closed; no further use.
    Closed,
    /// Created or completed; holds no log records.
    Idle,
    /// Has read or opened something.
    Active,
    /// Has written at least one log record.
    Update,
    /// Prepared for two-phase commit.
    Prepared,
}

impl XactState {
    /// Upper-case state name used in diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Idle => "IDLE",
            Self::Active => "ACTIVE",
            Self::Update => "UPDATE",
            Self::Prepared => "PREPARED",
        }
    }
}

impl fmt::Display for XactState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Status bits carried by BeginXact and EndXact records and by transaction
/// table entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct XactStatus(u32);

impl XactStatus {
    /// No bits set.
    pub const EMPTY: Self = Self(0);
    /// The transaction aborted.
    pub const ABORTED: Self = Self(0x1);
    /// The transaction is prepared.
    pub const PREPARED: Self = Self(0x2);
    /// The transaction committed.
    pub const COMMITTED: Self = Self(0x4);
    /// Roll back before ordinary transactions during recovery.
    pub const ROLLBACK_FIRST: Self = Self(0x10);
    /// Internal transaction.
    pub const INTERNAL: Self = Self(0x20);
    /// Nested top transaction.
    pub const NESTED_TOP: Self = Self(0x40);

    /// Creates a status from raw bits.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Returns the raw bits.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether every bit of `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for XactStatus {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// The flavours of transaction the factory hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionKind {
    /// Ordinary user transaction, possibly global.
    User,
    /// Read-only transaction sharing its parent's compatibility space.
    NestedReadOnly,
    /// Updating transaction sharing its parent's compatibility space.
    NestedUpdate,
    /// Short system transaction, rolled back first during recovery.
    Internal,
    /// Nested top transaction with a compatibility space of its own.
    NestedTop,
}

impl TransactionKind {
    /// Status bits added to BeginXact and EndXact records.
    #[must_use]
    pub const fn status_extras(self) -> XactStatus {
        match self {
            Self::Internal => XactStatus(XactStatus::ROLLBACK_FIRST.0 | XactStatus::INTERNAL.0),
            Self::NestedTop => XactStatus::NESTED_TOP,
            Self::User | Self::NestedReadOnly | Self::NestedUpdate => XactStatus::EMPTY,
        }
    }

    /// Whether a quiesce has to wait for transactions of this kind.
    #[must_use]
    pub const fn excluded_from_quiesce(self) -> bool {
        !matches!(self, Self::NestedReadOnly)
    }

    /// Whether completion work is deferred until locks are released.
    #[must_use]
    pub const fn post_complete_mode(self) -> bool {
        matches!(self, Self::Internal | Self::NestedTop)
    }

    /// Kind recorded in the status bits of a recovered BeginXact.
    #[must_use]
    pub const fn from_status(status: XactStatus) -> Self {
        if status.contains(XactStatus::INTERNAL) {
            Self::Internal
        } else if status.contains(XactStatus::NESTED_TOP) {
            Self::NestedTop
        } else {
            Self::User
        }
    }

    /// Name used in diagnostics.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::User => "UserTransaction",
            Self::NestedReadOnly => "NestedReadOnlyUserTransaction",
            Self::NestedUpdate => "NestedUpdateUserTransaction",
            Self::Internal => "InternalTransaction",
            Self::NestedTop => "NestedTopTransaction",
        }
    }
}

/// Flags controlling commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommitFlags(u32);

impl CommitFlags {
    /// Plain commit: release locks, flush per configuration.
    pub const NONE: Self = Self(0);
    /// Keep locks after the commit.
    pub const KEEP_LOCKS: Self = Self(0x2);
    /// Commit of a transaction that only initialised read-only state.
    pub const READONLY_TRANSACTION_INITIALIZATION: Self = Self(0x4);
    /// Flush the log now.
    pub const SYNC: Self = Self(0x1_0000);
    /// Defer the log flush to a later sync commit or abort.
    pub const NO_SYNC: Self = Self(0x2_0000);
    /// Write a prepared rather than committed EndXact.
    pub const PREPARE: Self = Self(0x4_0000);

    /// Whether every flag in `other` is set.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for CommitFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn status_bit_values() {
        assert_eq!(XactStatus::ABORTED.bits(), 0x1);
        assert_eq!(XactStatus::PREPARED.bits(), 0x2);
        assert_eq!(XactStatus::COMMITTED.bits(), 0x4);
        assert_eq!(XactStatus::ROLLBACK_FIRST.bits(), 0x10);
        assert_eq!(XactStatus::INTERNAL.bits(), 0x20);
        assert_eq!(XactStatus::NESTED_TOP.bits(), 0x40);
    }

    #[test]
    fn kind_extras_roundtrip_through_status() {
        for kind in [TransactionKind::User, TransactionKind::Internal, TransactionKind::NestedTop] {
            let status = XactStatus::COMMITTED | kind.status_extras();
            assert_eq!(TransactionKind::from_status(status), kind);
        }
        assert!(TransactionKind::Internal
            .status_extras()
            .contains(XactStatus::ROLLBACK_FIRST));
    }

    #[test]
    fn quiesce_exclusion() {
        assert!(TransactionKind::User.excluded_from_quiesce());
        assert!(TransactionKind::NestedUpdate.excluded_from_quiesce());
        assert!(!TransactionKind::NestedReadOnly.excluded_from_quiesce());
    }

    proptest! {
        #[test]
        fn status_union_contains_both(a in 0u32..0x80, b in 0u32..0x80) {
            let joined = XactStatus::from_bits(a) | XactStatus::from_bits(b);
            prop_assert!(joined.contains(XactStatus::from_bits(a)));
            prop_assert!(joined.contains(XactStatus::from_bits(b)));
            prop_assert_eq!(joined.bits(), a | b);
        }
    }
}
