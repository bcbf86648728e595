//! In-memory log device.

use crate::device::LogDevice;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug, Default)]
struct Inner {
    bytes: Vec<u8>,
    forced: u64,
}

/// A log device held entirely in memory.
///
/// Clones share the same bytes, so a test can keep one handle while the
/// logger owns another and later take a [`crash_image`](Self::crash_image)
/// of what a real disk would have kept.
///
/// # Example
///
/// ```rust
/// use strata_storage::{LogDevice, MemoryDevice};
///
/// let mut device = MemoryDevice::new();
/// let observer = device.clone();
/// device.append(b"forced").unwrap();
/// device.force().unwrap();
/// device.append(b"lost").unwrap();
///
/// assert_eq!(observer.crash_image(), b"forced");
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryDevice {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryDevice {
    /// Creates a new empty device.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a device whose content is `bytes`, all of it forced.
    ///
    /// This is how a restarted engine sees the image left by a crash.
    #[must_use]
    pub fn from_image(bytes: Vec<u8>) -> Self {
        let forced = bytes.len() as u64;
        Self {
            inner: Arc::new(RwLock::new(Inner { bytes, forced })),
        }
    }

    /// Returns every byte appended so far, forced or not.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.inner.read().bytes.clone()
    }

    /// Returns the bytes a crash right now would leave behind.
    #[must_use]
    pub fn crash_image(&self) -> Vec<u8> {
        let inner = self.inner.read();
        inner.bytes[..inner.forced as usize].to_vec()
    }
}

impl LogDevice for MemoryDevice {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let inner = self.inner.read();
        let end = inner.bytes.len() as u64;
        let stop = offset.saturating_add(len as u64);
        if offset > end || stop > end {
            return Err(StorageError::ReadPastEnd { offset, len, end });
        }
        Ok(inner.bytes[offset as usize..stop as usize].to_vec())
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let mut inner = self.inner.write();
        let offset = inner.bytes.len() as u64;
        inner.bytes.extend_from_slice(data);
        Ok(offset)
    }

    fn force(&mut self) -> StorageResult<()> {
        let mut inner = self.inner.write();
        inner.forced = inner.bytes.len() as u64;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.inner.read().bytes.len() as u64
    }

    fn forced_len(&self) -> u64 {
        self.inner.read().forced
    }

    fn truncate(&mut self, new_len: u64) -> StorageResult<()> {
        let mut inner = self.inner.write();
        let end = inner.bytes.len() as u64;
        if new_len > end {
            return Err(StorageError::TruncatePastEnd {
                requested: new_len,
                end,
            });
        }
        inner.bytes.truncate(new_len as usize);
        inner.forced = inner.forced.min(new_len);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn new_device_is_empty() {
        let device = MemoryDevice::new();
        assert!(device.is_empty());
        assert_eq!(device.forced_len(), 0);
        assert!(device.crash_image().is_empty());
    }

    #[test]
    fn append_returns_running_offsets() {
        let mut device = MemoryDevice::new();
        assert_eq!(device.append(b"abc").unwrap(), 0);
        assert_eq!(device.append(b"de").unwrap(), 3);
        assert_eq!(device.len(), 5);
        assert_eq!(device.read_at(1, 3).unwrap(), b"bcd");
    }

    #[test]
    fn read_past_end_fails() {
        let mut device = MemoryDevice::new();
        device.append(b"abc").unwrap();
        assert!(matches!(
            device.read_at(2, 5),
            Err(StorageError::ReadPastEnd { .. })
        ));
        assert!(matches!(
            device.read_at(9, 0),
            Err(StorageError::ReadPastEnd { .. })
        ));
    }

    #[test]
    fn unforced_tail_is_lost_in_crash_image() {
        let mut device = MemoryDevice::new();
        device.append(b"kept").unwrap();
        device.force().unwrap();
        device.append(b"gone").unwrap();
        assert_eq!(device.forced_len(), 4);
        assert_eq!(device.crash_image(), b"kept");
        assert_eq!(device.contents(), b"keptgone");
    }

    #[test]
    fn clones_share_content() {
        let mut device = MemoryDevice::new();
        let observer = device.clone();
        device.append(b"x").unwrap();
        assert_eq!(observer.len(), 1);
    }

    #[test]
    fn from_image_is_fully_forced() {
        let device = MemoryDevice::from_image(b"restart".to_vec());
        assert_eq!(device.forced_len(), 7);
        assert_eq!(device.crash_image(), b"restart");
    }

    #[test]
    fn truncate_clamps_forced_prefix() {
        let mut device = MemoryDevice::new();
        device.append(b"0123456789").unwrap();
        device.force().unwrap();
        device.truncate(4).unwrap();
        assert_eq!(device.len(), 4);
        assert_eq!(device.forced_len(), 4);
        assert!(matches!(
            device.truncate(5),
            Err(StorageError::TruncatePastEnd { .. })
        ));
    }

    proptest! {
        #[test]
        fn forced_len_never_exceeds_len(chunks in prop::collection::vec(
            (prop::collection::vec(any::<u8>(), 0..16), any::<bool>()), 0..20)
        ) {
            let mut device = MemoryDevice::new();
            for (chunk, force) in &chunks {
                device.append(chunk).unwrap();
                if *force {
                    device.force().unwrap();
                }
                prop_assert!(device.forced_len() <= device.len());
            }
        }
    }
}
