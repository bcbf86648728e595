//! # Strata Storage
//!
//! Append-only byte devices that back the write-ahead log of the Strata
//! transaction core.
//!
//! A device is an opaque byte store. It knows nothing about log records,
//! transactions or containers; it only tracks two positions:
//!
//! - the **end** of the device, where the next append lands
//! - the **forced** prefix, which is guaranteed to survive a crash
//!
//! Everything appended past the forced prefix may be lost when the process
//! dies. [`MemoryDevice::crash_image`] exposes exactly that view so that
//! tests can simulate a crash followed by restart recovery.
//!
//! ## Available Devices
//!
//! - [`MemoryDevice`] - For tests and ephemeral engines
//! - [`FileDevice`] - For persistent logs using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use strata_storage::{LogDevice, MemoryDevice};
//!
//! let mut device = MemoryDevice::new();
//! let offset = device.append(b"begin").unwrap();
//! device.force().unwrap();
//! assert_eq!(device.read_at(offset, 5).unwrap(), b"begin");
//! assert_eq!(device.forced_len(), 5);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod device;
mod error;
mod file;
mod memory;

pub use device::LogDevice;
pub use error::{StorageError, StorageResult};
pub use file::FileDevice;
pub use memory::MemoryDevice;
