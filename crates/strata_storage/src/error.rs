//! Error types for log devices.

use std::io;
use thiserror::Error;

/// Result type for device operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors raised by a [`crate::LogDevice`].
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of the device.
    #[error("read beyond end of device: offset {offset}, len {len}, end {end}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current end of the device.
        end: u64,
    },

    /// Attempted to truncate to a length larger than the device.
    #[error("cannot truncate device of length {end} to {requested}")]
    TruncatePastEnd {
        /// The requested new length.
        requested: u64,
        /// The current end of the device.
        end: u64,
    },
}
