//! Engine fixtures and helpers.
//!
//! Provides engines over a shared in-memory log that can be crashed and
//! rebooted, engines over a temporary file log, and a few shortcuts for
//! the common "write a row, read it back" steps of a scenario.

use std::ops::Deref;
use std::path::PathBuf;
use std::sync::Once;

use strata_core::{Config, ContainerKey, OpenMode, RecordHandle, XactContext, XactFactory};
use strata_storage::{FileDevice, LogDevice, MemoryDevice};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

/// Installs a test log subscriber once per process.
///
/// Output is filtered by `RUST_LOG` and captured by the test harness.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// The record handle used by the row helpers for `slot`.
#[must_use]
pub fn row(key: ContainerKey, slot: u32) -> RecordHandle {
    RecordHandle::new(key, 1, slot)
}

/// An engine booted over an in-memory log.
pub struct TestEngine {
    /// The booted factory.
    pub factory: XactFactory,
    device: MemoryDevice,
    config: Config,
}

impl TestEngine {
    /// Boots an engine with the default configuration.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Boots an engine with `config` over an empty log.
    pub fn with_config(config: Config) -> Self {
        Self::boot(config, MemoryDevice::new())
    }

    /// Boots an engine over a copy of `image`, as if it were the log a
    /// previous engine left on disk.
    pub fn from_image(config: Config, image: Vec<u8>) -> Self {
        Self::boot(config, MemoryDevice::from_image(image))
    }

    fn boot(config: Config, device: MemoryDevice) -> Self {
        init_tracing();
        let factory = XactFactory::boot(config.clone(), Box::new(device.clone()))
            .expect("Failed to boot engine");
        Self {
            factory,
            device,
            config,
        }
    }

    /// The log device shared with the engine.
    pub fn device(&self) -> &MemoryDevice {
        &self.device
    }

    /// Simulates a crash: everything not forced is lost and the engine
    /// boots again from what survived.
    pub fn crash(self) -> Self {
        let image = self.device.crash_image();
        let config = self.config.clone();
        drop(self.factory);
        Self::from_image(config, image)
    }

    /// Boots a fresh engine over every byte appended so far, forced or not.
    pub fn restart(self) -> Self {
        let image = self.device.contents();
        let config = self.config.clone();
        drop(self.factory);
        Self::from_image(config, image)
    }

    /// Bytes appended to the log but not yet forced.
    pub fn unforced_len(&self) -> u64 {
        self.device.len() - self.device.forced_len()
    }

    /// Creates and commits a container.
    pub fn create_container(&self) -> ContainerKey {
        create_container(&self.factory)
    }

    /// Inserts `value` at `slot` in a committed transaction.
    pub fn commit_row(&self, key: ContainerKey, slot: u32, value: &[u8]) {
        commit_row(&self.factory, key, slot, value);
    }

    /// Reads `slot` in a short transaction of its own.
    pub fn read_row(&self, key: ContainerKey, slot: u32) -> Option<Vec<u8>> {
        read_row(&self.factory, key, slot)
    }

    /// Starts a transaction that has inserted `value` at `slot` and is
    /// left open.
    pub fn pending_row(&self, key: ContainerKey, slot: u32, value: &[u8]) -> XactContext {
        let xact = self
            .factory
            .start_transaction("pending")
            .expect("Failed to start transaction");
        {
            let mut t = xact.lock();
            let handle = t
                .open_container(key, OpenMode::FOR_UPDATE)
                .expect("Failed to open container")
                .expect("Container lock not granted");
            t.insert(&handle, row(key, slot), value.to_vec())
                .expect("Failed to insert row");
        }
        xact
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for TestEngine {
    type Target = XactFactory;

    fn deref(&self) -> &Self::Target {
        &self.factory
    }
}

/// An engine over a log file in a temporary directory.
pub struct FileEngine {
    /// The booted factory.
    pub factory: XactFactory,
    config: Config,
    /// Kept alive to prevent cleanup.
    dir: TempDir,
}

impl FileEngine {
    /// Boots an engine over a new empty log file.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        Self::boot(Config::default(), dir)
    }

    fn boot(config: Config, dir: TempDir) -> Self {
        init_tracing();
        let device =
            FileDevice::open(&dir.path().join("strata.log")).expect("Failed to open log file");
        let factory =
            XactFactory::boot(config.clone(), Box::new(device)).expect("Failed to boot engine");
        Self {
            factory,
            config,
            dir,
        }
    }

    /// Path of the log file.
    pub fn log_path(&self) -> PathBuf {
        self.dir.path().join("strata.log")
    }

    /// Drops the engine and boots a new one over the same file.
    pub fn reopen(self) -> Self {
        let Self {
            factory,
            config,
            dir,
        } = self;
        drop(factory);
        Self::boot(config, dir)
    }
}

impl Default for FileEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Deref for FileEngine {
    type Target = XactFactory;

    fn deref(&self) -> &Self::Target {
        &self.factory
    }
}

/// Creates and commits a container.
pub fn create_container(factory: &XactFactory) -> ContainerKey {
    let xact = factory
        .start_transaction("create container")
        .expect("Failed to start transaction");
    let mut t = xact.lock();
    let key = t.add_container(0).expect("Failed to add container");
    t.commit().expect("Failed to commit");
    key
}

/// Inserts `value` at `slot` in a committed transaction.
pub fn commit_row(factory: &XactFactory, key: ContainerKey, slot: u32, value: &[u8]) {
    let xact = factory
        .start_transaction("commit row")
        .expect("Failed to start transaction");
    let mut t = xact.lock();
    let handle = t
        .open_container(key, OpenMode::FOR_UPDATE)
        .expect("Failed to open container")
        .expect("Container lock not granted");
    t.insert(&handle, row(key, slot), value.to_vec())
        .expect("Failed to insert row");
    t.commit().expect("Failed to commit");
}

/// Reads `slot` in a short transaction of its own.
pub fn read_row(factory: &XactFactory, key: ContainerKey, slot: u32) -> Option<Vec<u8>> {
    let xact = factory
        .start_transaction("read row")
        .expect("Failed to start transaction");
    let mut t = xact.lock();
    let handle = t
        .open_container(key, OpenMode::NONE)
        .expect("Failed to open container")
        .expect("Container lock not granted");
    let value = t.fetch(&handle, row(key, slot)).expect("Failed to fetch row");
    t.commit().expect("Failed to commit");
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_round_trip() {
        let engine = TestEngine::new();
        let key = engine.create_container();
        engine.commit_row(key, 7, b"seven");
        assert_eq!(engine.read_row(key, 7), Some(b"seven".to_vec()));
        assert_eq!(engine.read_row(key, 8), None);
    }

    #[test]
    fn test_restart_keeps_unforced_bytes() {
        let engine = TestEngine::with_config(Config::default().flush_log_on_commit(false));
        let key = engine.create_container();
        engine.commit_row(key, 1, b"lazy");
        assert!(engine.unforced_len() > 0);

        let engine = engine.restart();
        assert_eq!(engine.read_row(key, 1), Some(b"lazy".to_vec()));
    }

    #[test]
    fn test_file_engine_reopen() {
        let engine = FileEngine::new();
        let key = create_container(&engine);
        commit_row(&engine, key, 1, b"on disk");
        assert!(engine.log_path().exists());

        let engine = engine.reopen();
        assert_eq!(read_row(&engine, key, 1), Some(b"on disk".to_vec()));
    }
}
