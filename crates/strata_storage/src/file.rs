//! File-backed log device.

use crate::device::LogDevice;
use crate::error::{StorageError, StorageResult};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A log device stored in a single OS file.
///
/// `force` calls `File::sync_data`, so the forced prefix is whatever the
/// OS has acknowledged as durable. On open the whole file counts as forced.
///
/// # Example
///
/// ```no_run
/// use strata_storage::{FileDevice, LogDevice};
/// use std::path::Path;
///
/// let mut device = FileDevice::open(Path::new("strata.log")).unwrap();
/// device.append(b"record").unwrap();
/// device.force().unwrap();
/// ```
#[derive(Debug)]
pub struct FileDevice {
    path: PathBuf,
    file: Mutex<File>,
    end: u64,
    forced: u64,
}

impl FileDevice {
    /// Opens or creates the log file at `path`, creating parent
    /// directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories or the file cannot be created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let end = file.metadata()?.len();
        tracing::debug!(path = %path.display(), end, "opened log file");
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
            end,
            forced: end,
        })
    }

    /// Returns the path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogDevice for FileDevice {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let stop = offset.saturating_add(len as u64);
        if offset > self.end || stop > self.end {
            return Err(StorageError::ReadPastEnd {
                offset,
                len,
                end: self.end,
            });
        }
        let mut buffer = vec![0u8; len];
        if len > 0 {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buffer)?;
        }
        Ok(buffer)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let offset = self.end;
        if !data.is_empty() {
            let mut file = self.file.lock();
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(data)?;
            self.end += data.len() as u64;
        }
        Ok(offset)
    }

    fn force(&mut self) -> StorageResult<()> {
        if self.forced == self.end {
            return Ok(());
        }
        let mut file = self.file.lock();
        file.flush()?;
        file.sync_data()?;
        self.forced = self.end;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.end
    }

    fn forced_len(&self) -> u64 {
        self.forced
    }

    fn truncate(&mut self, new_len: u64) -> StorageResult<()> {
        if new_len > self.end {
            return Err(StorageError::TruncatePastEnd {
                requested: new_len,
                end: self.end,
            });
        }
        let file = self.file.lock();
        file.set_len(new_len)?;
        file.sync_all()?;
        self.end = new_len;
        self.forced = new_len;
        Ok(())
    }
}
