//! Crash recovery scenarios.
//!
//! Each [`CrashPoint`] runs one transaction up to a point, crashes the
//! engine (dropping every unforced log byte) and boots it again. The
//! [`CrashRecoveryResult`] records what restart recovery made of it.
//!
//! ## Usage
//!
//! ```rust
//! use strata_testkit::crash::{simulate_crash, CrashPoint};
//!
//! for point in CrashPoint::ALL {
//!     assert!(simulate_crash(point).passed(), "{point:?}");
//! }
//! ```

use strata_core::{CommitFlags, ContainerKey, OpenMode, XA_OK};

use crate::fixtures::{row, TestEngine};

const SLOT: u32 = 1;
const VALUE: &[u8] = b"crash-test";

/// Points at which a crash can be simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPoint {
    /// The row was written and the log forced, but never committed.
    BeforeCommit,
    /// Committed without forcing the log.
    AfterLazyCommit,
    /// Committed and forced.
    AfterCommit,
    /// A global transaction was prepared.
    AfterPrepare,
}

impl CrashPoint {
    /// Every crash point.
    pub const ALL: [Self; 4] = [
        Self::BeforeCommit,
        Self::AfterLazyCommit,
        Self::AfterCommit,
        Self::AfterPrepare,
    ];

    /// Whether the row should be readable after restart.
    #[must_use]
    pub const fn survives(self) -> bool {
        matches!(self, Self::AfterCommit)
    }

    /// Transactions recovery is expected to roll back.
    #[must_use]
    pub const fn expected_rollbacks(self) -> usize {
        match self {
            Self::BeforeCommit => 1,
            _ => 0,
        }
    }

    /// Prepared transactions expected to be left in doubt.
    #[must_use]
    pub const fn expected_in_doubt(self) -> usize {
        match self {
            Self::AfterPrepare => 1,
            _ => 0,
        }
    }
}

/// Result of a crash recovery run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashRecoveryResult {
    /// Where the crash happened.
    pub point: CrashPoint,
    /// The row after restart, or `None` if missing or still locked by an
    /// in-doubt transaction.
    pub visible: Option<Vec<u8>>,
    /// Transactions rolled back by recovery.
    pub rolled_back: usize,
    /// Prepared transactions left in doubt.
    pub in_doubt: usize,
}

impl CrashRecoveryResult {
    /// Whether recovery did what the crash point calls for.
    #[must_use]
    pub fn passed(&self) -> bool {
        let expected_row = self.point.survives().then(|| VALUE.to_vec());
        self.visible == expected_row
            && self.rolled_back == self.point.expected_rollbacks()
            && self.in_doubt == self.point.expected_in_doubt()
    }
}

/// Runs one crash scenario on a fresh engine.
pub fn simulate_crash(point: CrashPoint) -> CrashRecoveryResult {
    let engine = TestEngine::new();
    let key = engine.create_container();
    let pending = match point {
        CrashPoint::BeforeCommit => {
            let xact = engine.pending_row(key, SLOT, VALUE);
            engine.checkpoint().expect("Failed to checkpoint");
            Some(xact)
        }
        CrashPoint::AfterLazyCommit => {
            let xact = engine.pending_row(key, SLOT, VALUE);
            xact.lock()
                .commit_no_sync(CommitFlags::NONE)
                .expect("Failed to commit");
            None
        }
        CrashPoint::AfterCommit => {
            engine.commit_row(key, SLOT, VALUE);
            None
        }
        CrashPoint::AfterPrepare => Some(prepare_global(&engine, key)),
    };

    let engine = engine.crash();
    drop(pending);
    let summary = engine.recovery_summary();
    let visible = if summary.in_doubt == 0 {
        engine.read_row(key, SLOT)
    } else {
        None
    };
    CrashRecoveryResult {
        point,
        visible,
        rolled_back: summary.rolled_back,
        in_doubt: summary.in_doubt,
    }
}

fn prepare_global(engine: &TestEngine, key: ContainerKey) -> strata_core::XactContext {
    let xact = engine
        .start_global_transaction(1, b"crash", b"branch")
        .expect("Failed to start global transaction");
    {
        let mut t = xact.lock();
        let handle = t
            .open_container(key, OpenMode::FOR_UPDATE)
            .expect("Failed to open container")
            .expect("Container lock not granted");
        t.insert(&handle, row(key, SLOT), VALUE.to_vec())
            .expect("Failed to insert row");
        assert_eq!(t.xa_prepare().expect("Failed to prepare"), XA_OK);
    }
    xact
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expectations() {
        assert!(CrashPoint::AfterCommit.survives());
        assert!(!CrashPoint::AfterLazyCommit.survives());
        assert_eq!(CrashPoint::BeforeCommit.expected_rollbacks(), 1);
        assert_eq!(CrashPoint::AfterPrepare.expected_in_doubt(), 1);
    }

    #[test]
    fn test_every_crash_point_recovers() {
        for point in CrashPoint::ALL {
            let result = simulate_crash(point);
            assert!(result.passed(), "{result:?}");
        }
    }
}
