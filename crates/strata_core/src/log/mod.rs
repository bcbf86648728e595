//! Write-ahead logging.
//!
//! The transaction core talks to the log through the [`Logger`] trait:
//! log-and-do an operation, undo a transaction's range, flush, reprepare and
//! scan. [`WalLogger`] is the reference implementation on top of a
//! [`strata_storage::LogDevice`]; log instants are byte offsets into the
//! device.

mod logger;
mod op;
mod record;
mod wal;

pub use logger::{Logger, UndoOutcome};
pub use op::{write_compressed_int, LogOp, LogOpType, MAX_COMPRESSED_INT};
pub(crate) use op::{decode_gid, encode_gid, read_compressed_int};
pub use record::{compute_crc32, LogRecord, LOG_MAGIC, LOG_VERSION};
pub use wal::{LogIterator, WalLogger};
