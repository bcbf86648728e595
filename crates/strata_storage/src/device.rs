//! The log device trait.

use crate::error::StorageResult;

/// An append-only byte device used as the home of a write-ahead log.
///
/// Offsets handed out by [`append`](LogDevice::append) are stable for the
/// lifetime of the device and are used directly as log instants by the
/// transaction core.
///
/// # Invariants
///
/// - `append` returns the offset of the first written byte
/// - `read_at` returns exactly the bytes previously appended at that offset
/// - after `force` returns, `forced_len() == len()`
/// - `forced_len() <= len()` at all times
pub trait LogDevice: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::ReadPastEnd`] if the range is not
    /// fully inside the device, or an I/O error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends `data` at the end of the device and returns its offset.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Makes every appended byte durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the data cannot be made durable.
    fn force(&mut self) -> StorageResult<()>;

    /// Returns the offset at which the next append will land.
    fn len(&self) -> u64;

    /// Returns the length of the prefix that survives a crash.
    fn forced_len(&self) -> u64;

    /// Returns true if nothing was ever appended.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discards every byte at or after `new_len`.
    ///
    /// Used when restart recovery finds a torn record at the tail.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StorageError::TruncatePastEnd`] if `new_len` is
    /// larger than the device, or an I/O error.
    fn truncate(&mut self, new_len: u64) -> StorageResult<()>;
}
