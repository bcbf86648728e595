//! The data factory collaborator.
//!
//! The core only needs a narrow view of container storage: apply a logged
//! change, say whether a container exists, read a record, and hand out
//! container ids. [`MemoryDataFactory`] keeps everything in memory and is
//! rebuilt from the log on restart.

use crate::error::{CoreError, CoreResult};
use crate::log::LogOp;
use crate::types::{ContainerKey, RecordHandle};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Lifecycle of a container as recorded in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContainerState {
    /// Never created.
    Absent,
    /// Created and not dropped.
    Live,
    /// Dropped; the id is not reused.
    Dropped,
}

impl ContainerState {
    pub(crate) const fn tag(self) -> u8 {
        match self {
            Self::Absent => 0,
            Self::Live => 1,
            Self::Dropped => 2,
        }
    }

    pub(crate) fn from_tag(tag: u8) -> CoreResult<Self> {
        match tag {
            0 => Ok(Self::Absent),
            1 => Ok(Self::Live),
            2 => Ok(Self::Dropped),
            other => Err(CoreError::log_corruption(format!(
                "unknown container state {other}"
            ))),
        }
    }
}

/// Container storage as seen by the transaction core.
pub trait DataFactory: Send + Sync + fmt::Debug {
    /// Applies the effect of a logged operation. Used for do, undo and redo,
    /// so it must be idempotent.
    fn apply(&self, op: &LogOp) -> CoreResult<()>;

    /// Returns the state of a container.
    fn container_state(&self, key: ContainerKey) -> ContainerState;

    /// Reads a record from a live container.
    fn read(&self, record: RecordHandle) -> CoreResult<Option<Vec<u8>>>;

    /// Returns every record of a live container in handle order.
    fn records(&self, key: ContainerKey) -> CoreResult<Vec<(RecordHandle, Vec<u8>)>>;

    /// Reserves a fresh container id in `segment`.
    fn allocate_container_id(&self, segment: u32) -> ContainerKey;

    /// Creates an unlogged temporary container holding `rows`.
    fn add_stream_container(&self, segment: u32, rows: Vec<Vec<u8>>) -> ContainerKey;

    /// Reads back a stream container.
    fn read_stream_container(&self, key: ContainerKey) -> CoreResult<Vec<Vec<u8>>>;

    /// Removes a stream container.
    fn drop_stream_container(&self, key: ContainerKey) -> CoreResult<()>;
}

#[derive(Debug, Default)]
struct Store {
    containers: HashMap<ContainerKey, ContainerState>,
    rows: HashMap<ContainerKey, BTreeMap<(u64, u32), Vec<u8>>>,
    next_id: HashMap<u32, u64>,
    streams: HashMap<ContainerKey, Vec<Vec<u8>>>,
}

impl Store {
    fn bump_next_id(&mut self, key: ContainerKey) {
        let next = self.next_id.entry(key.segment).or_insert(1);
        if *next <= key.container {
            *next = key.container + 1;
        }
    }

    fn live(&self, key: ContainerKey) -> CoreResult<()> {
        match self.containers.get(&key) {
            Some(ContainerState::Live) => Ok(()),
            _ => Err(CoreError::ContainerNotFound {
                container: key,
            }),
        }
    }
}

/// In-memory [`DataFactory`].
///
/// # Example
///
/// ```rust
/// use strata_core::data::{ContainerState, DataFactory, MemoryDataFactory};
/// use strata_core::log::LogOp;
/// use strata_core::types::RecordHandle;
///
/// let data = MemoryDataFactory::new();
/// let key = data.allocate_container_id(0);
/// data.apply(&LogOp::ContainerChange {
///     container: key,
///     before: ContainerState::Absent,
///     after: ContainerState::Live,
/// })
/// .unwrap();
///
/// let record = RecordHandle::new(key, 1, 1);
/// data.apply(&LogOp::RowChange { record, before: None, after: Some(b"row".to_vec()) })
///     .unwrap();
/// assert_eq!(data.read(record).unwrap(), Some(b"row".to_vec()));
/// ```
#[derive(Debug, Default)]
pub struct MemoryDataFactory {
    store: RwLock<Store>,
}

impl MemoryDataFactory {
    /// Creates an empty factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl DataFactory for MemoryDataFactory {
    fn apply(&self, op: &LogOp) -> CoreResult<()> {
        let mut store = self.store.write();
        match op {
            LogOp::RowChange { record, after, .. } => {
                store.live(record.container)?;
                let rows = store.rows.entry(record.container).or_default();
                let slot = (record.page, record.id);
                match after {
                    Some(value) => {
                        rows.insert(slot, value.clone());
                    }
                    None => {
                        rows.remove(&slot);
                    }
                }
            }
            LogOp::ContainerChange {
                container, after, ..
            } => {
                store.containers.insert(*container, *after);
                store.bump_next_id(*container);
                if *after != ContainerState::Live {
                    store.rows.remove(container);
                }
            }
            LogOp::Compensation { op, .. } => {
                drop(store);
                return self.apply(op);
            }
            LogOp::BeginXact { .. } | LogOp::EndXact { .. } | LogOp::Checkpoint { .. } => {}
        }
        Ok(())
    }

    fn container_state(&self, key: ContainerKey) -> ContainerState {
        self.store
            .read()
            .containers
            .get(&key)
            .copied()
            .unwrap_or(ContainerState::Absent)
    }

    fn read(&self, record: RecordHandle) -> CoreResult<Option<Vec<u8>>> {
        let store = self.store.read();
        store.live(record.container)?;
        Ok(store
            .rows
            .get(&record.container)
            .and_then(|rows| rows.get(&(record.page, record.id)))
            .cloned())
    }

    fn records(&self, key: ContainerKey) -> CoreResult<Vec<(RecordHandle, Vec<u8>)>> {
        let store = self.store.read();
        store.live(key)?;
        Ok(store
            .rows
            .get(&key)
            .map(|rows| {
                rows.iter()
                    .map(|((page, id), value)| (RecordHandle::new(key, *page, *id), value.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    fn allocate_container_id(&self, segment: u32) -> ContainerKey {
        let mut store = self.store.write();
        let next = store.next_id.entry(segment).or_insert(1);
        let key = ContainerKey::new(segment, *next);
        *next += 1;
        key
    }

    fn add_stream_container(&self, segment: u32, rows: Vec<Vec<u8>>) -> ContainerKey {
        let key = self.allocate_container_id(segment);
        self.store.write().streams.insert(key, rows);
        key
    }

    fn read_stream_container(&self, key: ContainerKey) -> CoreResult<Vec<Vec<u8>>> {
        self.store
            .read()
            .streams
            .get(&key)
            .cloned()
            .ok_or_else(|| CoreError::ContainerNotFound {
                container: key,
            })
    }

    fn drop_stream_container(&self, key: ContainerKey) -> CoreResult<()> {
        self.store
            .write()
            .streams
            .remove(&key)
            .map(|_| ())
            .ok_or_else(|| CoreError::ContainerNotFound {
                container: key,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create(data: &MemoryDataFactory, segment: u32) -> ContainerKey {
        let key = data.allocate_container_id(segment);
        data.apply(&LogOp::ContainerChange {
            container: key,
            before: ContainerState::Absent,
            after: ContainerState::Live,
        })
        .unwrap();
        key
    }

    #[test]
    fn ids_are_per_segment() {
        let data = MemoryDataFactory::new();
        assert_eq!(data.allocate_container_id(0), ContainerKey::new(0, 1));
        assert_eq!(data.allocate_container_id(0), ContainerKey::new(0, 2));
        assert_eq!(data.allocate_container_id(4), ContainerKey::new(4, 1));
    }

    #[test]
    fn redo_of_container_creation_advances_ids() {
        let data = MemoryDataFactory::new();
        data.apply(&LogOp::ContainerChange {
            container: ContainerKey::new(0, 7),
            before: ContainerState::Absent,
            after: ContainerState::Live,
        })
        .unwrap();
        assert_eq!(data.allocate_container_id(0), ContainerKey::new(0, 8));
    }

    #[test]
    fn row_changes_apply_and_reverse() {
        let data = MemoryDataFactory::new();
        let key = create(&data, 0);
        let record = RecordHandle::new(key, 1, 3);
        let insert = LogOp::RowChange {
            record,
            before: None,
            after: Some(vec![1]),
        };
        data.apply(&insert).unwrap();
        assert_eq!(data.read(record).unwrap(), Some(vec![1]));
        data.apply(&insert.inverse().unwrap()).unwrap();
        assert_eq!(data.read(record).unwrap(), None);
    }

    #[test]
    fn dropped_containers_are_unreadable() {
        let data = MemoryDataFactory::new();
        let key = create(&data, 0);
        data.apply(&LogOp::ContainerChange {
            container: key,
            before: ContainerState::Live,
            after: ContainerState::Dropped,
        })
        .unwrap();
        assert_eq!(data.container_state(key), ContainerState::Dropped);
        assert!(matches!(
            data.read(RecordHandle::new(key, 1, 1)),
            Err(CoreError::ContainerNotFound { .. })
        ));
    }

    #[test]
    fn stream_containers_are_unlogged() {
        let data = MemoryDataFactory::new();
        let key = data.add_stream_container(2, vec![vec![1], vec![2]]);
        assert_eq!(data.read_stream_container(key).unwrap().len(), 2);
        assert_eq!(data.container_state(key), ContainerState::Absent);
        data.drop_stream_container(key).unwrap();
        assert!(data.drop_stream_container(key).is_err());
    }
}
