//! Property-based workload generators using proptest.
//!
//! A workload is a list of [`RowOp`]s run inside one transaction. The
//! [`RowModel`] tracks what the container should hold after each step,
//! including savepoints, so a property test can compare the engine with
//! the model at any point.

use std::collections::BTreeMap;

use proptest::prelude::*;
use strata_core::{ContainerHandle, ContainerKey, CoreResult, SavepointKind, Transaction};

use crate::fixtures::row;

/// Number of distinct slots a workload touches.
pub const WORKLOAD_SLOTS: u32 = 16;

/// One step of a workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOp {
    /// Inserts a row, or updates it if it already exists.
    Put {
        /// Target slot.
        slot: u32,
        /// New value.
        value: Vec<u8>,
    },
    /// Deletes a row if it exists.
    Delete {
        /// Target slot.
        slot: u32,
    },
    /// Sets a new savepoint.
    Savepoint,
    /// Rolls back to the newest savepoint, if any.
    Rollback,
    /// Releases the newest savepoint, if any.
    Release,
}

/// Strategy for row values.
pub fn row_value_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop::collection::vec(any::<u8>(), 0..32)
}

/// Strategy for a single workload step.
pub fn row_op_strategy() -> impl Strategy<Value = RowOp> {
    prop_oneof![
        4 => (0..WORKLOAD_SLOTS, row_value_strategy())
            .prop_map(|(slot, value)| RowOp::Put { slot, value }),
        2 => (0..WORKLOAD_SLOTS).prop_map(|slot| RowOp::Delete { slot }),
        1 => Just(RowOp::Savepoint),
        1 => Just(RowOp::Rollback),
        1 => Just(RowOp::Release),
    ]
}

/// Strategy for a workload of up to `max_len` steps.
pub fn workload_strategy(max_len: usize) -> impl Strategy<Value = Vec<RowOp>> {
    prop::collection::vec(row_op_strategy(), 0..max_len)
}

/// Expected container contents, with one snapshot per open savepoint.
#[derive(Debug, Clone, Default)]
pub struct RowModel {
    rows: BTreeMap<u32, Vec<u8>>,
    savepoints: Vec<(String, BTreeMap<u32, Vec<u8>>)>,
    next_savepoint: usize,
}

impl RowModel {
    /// Creates an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current expected rows.
    pub fn rows(&self) -> &BTreeMap<u32, Vec<u8>> {
        &self.rows
    }

    /// Applies `op` to the transaction and to the model.
    ///
    /// # Errors
    ///
    /// Returns whatever the transaction returns.
    pub fn apply(
        &mut self,
        t: &mut Transaction,
        handle: &ContainerHandle,
        op: &RowOp,
    ) -> CoreResult<()> {
        let key = handle.key();
        match op {
            RowOp::Put { slot, value } => {
                if self.rows.contains_key(slot) {
                    t.update(handle, row(key, *slot), value.clone())?;
                } else {
                    t.insert(handle, row(key, *slot), value.clone())?;
                }
                self.rows.insert(*slot, value.clone());
            }
            RowOp::Delete { slot } => {
                if self.rows.remove(slot).is_some() {
                    t.delete(handle, row(key, *slot))?;
                }
            }
            RowOp::Savepoint => {
                let name = format!("sp{}", self.next_savepoint);
                self.next_savepoint += 1;
                t.set_savepoint(&name, SavepointKind::Jdbc)?;
                self.savepoints.push((name, self.rows.clone()));
            }
            RowOp::Rollback => {
                if let Some((name, snapshot)) = self.savepoints.last() {
                    t.rollback_to_savepoint(name, SavepointKind::Jdbc)?;
                    self.rows = snapshot.clone();
                }
            }
            RowOp::Release => {
                if let Some((name, _)) = self.savepoints.pop() {
                    t.release_savepoint(&name, SavepointKind::Jdbc)?;
                }
            }
        }
        Ok(())
    }
}

/// Reads every workload slot of `key` through `t`.
///
/// # Errors
///
/// Returns whatever the transaction returns.
pub fn read_slots(
    t: &mut Transaction,
    handle: &ContainerHandle,
    key: ContainerKey,
) -> CoreResult<BTreeMap<u32, Vec<u8>>> {
    let mut rows = BTreeMap::new();
    for slot in 0..WORKLOAD_SLOTS {
        if let Some(value) = t.fetch(handle, row(key, slot))? {
            rows.insert(slot, value);
        }
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::TestEngine;
    use strata_core::OpenMode;

    proptest! {
        #[test]
        fn test_row_ops_stay_in_range(op in row_op_strategy()) {
            match op {
                RowOp::Put { slot, value } => {
                    prop_assert!(slot < WORKLOAD_SLOTS);
                    prop_assert!(value.len() < 32);
                }
                RowOp::Delete { slot } => prop_assert!(slot < WORKLOAD_SLOTS),
                _ => {}
            }
        }
    }

    #[test]
    fn test_model_follows_savepoints() {
        let engine = TestEngine::new();
        let key = engine.create_container();
        let xact = engine.start_transaction("model").unwrap();
        let mut t = xact.lock();
        let handle = t.open_container(key, OpenMode::FOR_UPDATE).unwrap().unwrap();
        let mut model = RowModel::new();
        let ops = [
            RowOp::Put { slot: 1, value: b"a".to_vec() },
            RowOp::Savepoint,
            RowOp::Put { slot: 1, value: b"b".to_vec() },
            RowOp::Put { slot: 2, value: b"c".to_vec() },
            RowOp::Rollback,
            RowOp::Delete { slot: 1 },
        ];
        for op in &ops {
            model.apply(&mut t, &handle, op).unwrap();
        }
        assert!(model.rows().is_empty());
        assert_eq!(&read_slots(&mut t, &handle, key).unwrap(), model.rows());
    }
}
