//! The reference write-ahead log.

use super::logger::{Logger, UndoOutcome};
use super::op::LogOp;
use super::record::{LogRecord, CRC_SIZE, HEADER_SIZE};
use crate::data::DataFactory;
use crate::error::CoreResult;
use crate::types::{LogInstant, TransactionId};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use strata_storage::LogDevice;

/// Write-ahead log over a [`LogDevice`].
///
/// Every `log_and_do` appends a framed record and then applies the
/// operation through the [`DataFactory`]. Records become durable only when
/// flushed, unless `sync_on_write` is set.
pub struct WalLogger {
    device: Mutex<Box<dyn LogDevice>>,
    data: Arc<dyn DataFactory>,
    sync_on_write: bool,
}

impl fmt::Debug for WalLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalLogger")
            .field("sync_on_write", &self.sync_on_write)
            .finish_non_exhaustive()
    }
}

impl WalLogger {
    /// Opens the log on `device`, cutting off a torn record at the tail.
    ///
    /// # Errors
    ///
    /// Returns an error if a complete record fails its checksum or the
    /// device cannot be read or truncated.
    pub fn open(
        device: Box<dyn LogDevice>,
        data: Arc<dyn DataFactory>,
        sync_on_write: bool,
    ) -> CoreResult<Self> {
        let logger = Self {
            device: Mutex::new(device),
            data,
            sync_on_write,
        };
        let (valid_end, records) = {
            let mut iter = logger.iter()?;
            let mut records = 0usize;
            for entry in iter.by_ref() {
                entry?;
                records += 1;
            }
            (iter.position(), records)
        };
        let mut device = logger.device.lock();
        if valid_end < device.len() {
            tracing::warn!(
                valid_end,
                device_len = device.len(),
                "truncating torn log tail"
            );
            device.truncate(valid_end)?;
        }
        drop(device);
        tracing::debug!(records, end = valid_end, "log opened");
        Ok(logger)
    }

    /// Returns a streaming iterator over all records.
    ///
    /// The iterator holds the device lock; do not log while iterating.
    ///
    /// # Errors
    ///
    /// Currently infallible; kept fallible for devices that need setup.
    pub fn iter(&self) -> CoreResult<LogIterator<'_>> {
        Ok(LogIterator::new(self.device.lock(), 0))
    }

    /// Reads every record into memory.
    ///
    /// # Errors
    ///
    /// Returns an error if a record is corrupt.
    pub fn read_all(&self) -> CoreResult<Vec<(LogInstant, LogRecord)>> {
        self.iter()?.collect()
    }

    /// Returns the instant the next record will get.
    #[must_use]
    pub fn end(&self) -> LogInstant {
        LogInstant(self.device.lock().len())
    }

    /// Collects the records of `txid` in `[from, to]`.
    fn records_of(
        &self,
        txid: TransactionId,
        from: LogInstant,
        to: LogInstant,
    ) -> CoreResult<Vec<(LogInstant, LogOp)>> {
        let mut out = Vec::new();
        let iter = LogIterator::new(self.device.lock(), from.as_u64());
        for entry in iter {
            let (instant, record) = entry?;
            if instant > to {
                break;
            }
            if record.txid == Some(txid) {
                out.push((instant, record.op));
            }
        }
        Ok(out)
    }
}

impl Logger for WalLogger {
    fn log_and_do(&self, txid: Option<TransactionId>, op: &LogOp) -> CoreResult<LogInstant> {
        let frame = LogRecord {
            txid,
            op: op.clone(),
        }
        .encode()?;
        let instant = {
            let mut device = self.device.lock();
            let offset = device.append(&frame)?;
            if self.sync_on_write {
                device.force()?;
            }
            LogInstant(offset)
        };
        self.data.apply(op)?;
        tracing::trace!(%instant, ?txid, op = ?op.op_type(), "logged");
        Ok(instant)
    }

    fn undo(
        &self,
        txid: TransactionId,
        from: LogInstant,
        to: LogInstant,
    ) -> CoreResult<UndoOutcome> {
        let records = self.records_of(txid, from, to)?;
        let compensated: HashSet<LogInstant> = records
            .iter()
            .filter_map(|(_, op)| match op {
                LogOp::Compensation { undoes, .. } => Some(*undoes),
                _ => None,
            })
            .collect();

        let mut outcome = UndoOutcome::default();
        for (instant, op) in records.into_iter().rev() {
            if compensated.contains(&instant) {
                continue;
            }
            let Some(inverse) = op.inverse() else {
                continue;
            };
            let clr = self.log_and_do(
                Some(txid),
                &LogOp::Compensation {
                    undoes: instant,
                    op: Box::new(inverse),
                },
            )?;
            outcome.first_clr.get_or_insert(clr);
            outcome.last_clr = Some(clr);
            outcome.undone += 1;
        }
        tracing::debug!(%txid, %from, %to, undone = outcome.undone, "undo complete");
        Ok(outcome)
    }

    fn reprepare(
        &self,
        txid: TransactionId,
        first: LogInstant,
        last: LogInstant,
        reclaim: &mut dyn FnMut(&LogOp) -> CoreResult<()>,
    ) -> CoreResult<()> {
        for (_, op) in self.records_of(txid, first, last)? {
            reclaim(&op)?;
        }
        Ok(())
    }

    fn flush(&self, instant: LogInstant) -> CoreResult<()> {
        let mut device = self.device.lock();
        if device.forced_len() <= instant.as_u64() {
            device.force()?;
        }
        Ok(())
    }

    fn flush_all(&self) -> CoreResult<()> {
        self.device.lock().force()?;
        Ok(())
    }

    fn scan(
        &self,
        visitor: &mut dyn FnMut(LogInstant, LogRecord) -> CoreResult<()>,
    ) -> CoreResult<()> {
        for entry in self.iter()? {
            let (instant, record) = entry?;
            visitor(instant, record)?;
        }
        Ok(())
    }
}

/// Streaming iterator over log records.
///
/// Yields `(instant, record)` pairs. A record that runs past the end of the
/// device is treated as the end of the log; checksum failures and bad
/// headers are errors.
pub struct LogIterator<'a> {
    device: MutexGuard<'a, Box<dyn LogDevice>>,
    offset: u64,
    end: u64,
    finished: bool,
}

impl<'a> LogIterator<'a> {
    fn new(device: MutexGuard<'a, Box<dyn LogDevice>>, start: u64) -> Self {
        let end = device.len();
        Self {
            device,
            offset: start,
            end,
            finished: false,
        }
    }

    /// Offset just past the last complete record returned.
    #[must_use]
    pub fn position(&self) -> u64 {
        self.offset
    }

    fn read_next(&mut self) -> CoreResult<Option<(LogInstant, LogRecord)>> {
        let start = self.offset;
        let header_end = start + HEADER_SIZE as u64;
        if header_end > self.end {
            return Ok(None);
        }
        let header = self.device.read_at(start, HEADER_SIZE)?;
        let (_, len) = LogRecord::parse_header(&header)?;
        let frame_len = HEADER_SIZE + len + CRC_SIZE;
        if start + frame_len as u64 > self.end {
            return Ok(None);
        }
        let frame = self.device.read_at(start, frame_len)?;
        let record = LogRecord::decode_frame(&frame)?;
        self.offset = start + frame_len as u64;
        Ok(Some((LogInstant(start), record)))
    }
}

impl Iterator for LogIterator<'_> {
    type Item = CoreResult<(LogInstant, LogRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_next() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}
