//! Loggable operations and their payload encoding.

use crate::data::ContainerState;
use crate::error::{CoreError, CoreResult};
use crate::types::{ByteReader, ContainerKey, GlobalTransactionId, LogInstant, RecordHandle};
use crate::xact::XactStatus;

/// Largest value [`write_compressed_int`] accepts.
pub const MAX_COMPRESSED_INT: u32 = 0x7fff_ffff;

/// Writes `value` in 1, 2 or 4 bytes.
///
/// Values up to `0x3f` take one byte, up to `0x3fff` two bytes (first byte
/// tagged `0x40`), anything larger four bytes (first byte tagged `0x80`).
///
/// # Errors
///
/// Returns `InvalidArgument` above [`MAX_COMPRESSED_INT`].
pub fn write_compressed_int(out: &mut Vec<u8>, value: u32) -> CoreResult<()> {
    if value <= 0x3f {
        out.push(value as u8);
    } else if value <= 0x3fff {
        out.push(0x40 | (value >> 8) as u8);
        out.push(value as u8);
    } else if value <= MAX_COMPRESSED_INT {
        out.push(0x80 | (value >> 24) as u8);
        out.push((value >> 16) as u8);
        out.push((value >> 8) as u8);
        out.push(value as u8);
    } else {
        return Err(CoreError::invalid_argument(format!(
            "{value} does not fit a compressed int"
        )));
    }
    Ok(())
}

pub(crate) fn read_compressed_int(reader: &mut ByteReader<'_>) -> CoreResult<u32> {
    let first = u32::from(reader.u8()?);
    if first & 0xc0 == 0 {
        return Ok(first);
    }
    if first & 0x80 == 0 {
        let low = u32::from(reader.u8()?);
        return Ok(((first & 0x3f) << 8) | low);
    }
    let rest = reader.array::<3>()?;
    Ok(((first & 0x7f) << 24)
        | (u32::from(rest[0]) << 16)
        | (u32::from(rest[1]) << 8)
        | u32::from(rest[2]))
}

/// Record type byte in the log envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LogOpType {
    /// Transaction begin.
    BeginXact = 1,
    /// Transaction end.
    EndXact = 2,
    /// Record change.
    RowChange = 3,
    /// Container create or drop.
    ContainerChange = 4,
    /// Compensation of an earlier change.
    Compensation = 5,
    /// Checkpoint.
    Checkpoint = 6,
}

impl LogOpType {
    /// Converts a byte to a record type.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::BeginXact),
            2 => Some(Self::EndXact),
            3 => Some(Self::RowChange),
            4 => Some(Self::ContainerChange),
            5 => Some(Self::Compensation),
            6 => Some(Self::Checkpoint),
            _ => None,
        }
    }

    /// Converts the record type to a byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// An operation written to the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOp {
    /// First record of an updating transaction.
    BeginXact {
        /// Status bits describing the transaction kind.
        status: XactStatus,
        /// Global id, if the transaction is global.
        gid: Option<GlobalTransactionId>,
    },
    /// Commit, abort or prepare of an updating transaction.
    EndXact {
        /// Outcome bits plus kind bits.
        status: XactStatus,
        /// Global id, if the transaction is global.
        gid: Option<GlobalTransactionId>,
    },
    /// Insert (`before` empty), delete (`after` empty) or update of a record.
    RowChange {
        /// The record.
        record: RecordHandle,
        /// Image before the change.
        before: Option<Vec<u8>>,
        /// Image after the change.
        after: Option<Vec<u8>>,
    },
    /// Create or drop of a container.
    ContainerChange {
        /// The container.
        container: ContainerKey,
        /// State before the change.
        before: ContainerState,
        /// State after the change.
        after: ContainerState,
    },
    /// Undo of an earlier change, never undone itself.
    Compensation {
        /// The record being compensated.
        undoes: LogInstant,
        /// The inverse operation that was applied.
        op: Box<LogOp>,
    },
    /// Checkpoint with the serialized transaction table.
    Checkpoint {
        /// Oldest first log instant of any active update transaction.
        undo_low_water: Option<LogInstant>,
        /// Serialized transaction table.
        table: Vec<u8>,
    },
}

impl LogOp {
    /// Returns the record type.
    #[must_use]
    pub fn op_type(&self) -> LogOpType {
        match self {
            Self::BeginXact { .. } => LogOpType::BeginXact,
            Self::EndXact { .. } => LogOpType::EndXact,
            Self::RowChange { .. } => LogOpType::RowChange,
            Self::ContainerChange { .. } => LogOpType::ContainerChange,
            Self::Compensation { .. } => LogOpType::Compensation,
            Self::Checkpoint { .. } => LogOpType::Checkpoint,
        }
    }

    /// The operation that reverses this one, if it can be undone.
    #[must_use]
    pub fn inverse(&self) -> Option<Self> {
        match self {
            Self::RowChange {
                record,
                before,
                after,
            } => Some(Self::RowChange {
                record: *record,
                before: after.clone(),
                after: before.clone(),
            }),
            Self::ContainerChange {
                container,
                before,
                after,
            } => Some(Self::ContainerChange {
                container: *container,
                before: *after,
                after: *before,
            }),
            Self::BeginXact { .. }
            | Self::EndXact { .. }
            | Self::Compensation { .. }
            | Self::Checkpoint { .. } => None,
        }
    }

    /// Encodes the operation body (without the record type).
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for images over 4 GiB or nested
    /// compensations.
    pub fn encode_into(&self, out: &mut Vec<u8>) -> CoreResult<()> {
        match self {
            Self::BeginXact { status, gid } => {
                out.extend_from_slice(&status.bits().to_le_bytes());
                encode_gid(out, gid.as_ref());
            }
            Self::EndXact { status, gid } => {
                encode_gid(out, gid.as_ref());
                write_compressed_int(out, status.bits())?;
            }
            Self::RowChange {
                record,
                before,
                after,
            } => {
                encode_container(out, record.container);
                out.extend_from_slice(&record.page.to_le_bytes());
                out.extend_from_slice(&record.id.to_le_bytes());
                encode_image(out, before.as_deref())?;
                encode_image(out, after.as_deref())?;
            }
            Self::ContainerChange {
                container,
                before,
                after,
            } => {
                encode_container(out, *container);
                out.push(before.tag());
                out.push(after.tag());
            }
            Self::Compensation { undoes, op } => {
                if matches!(**op, Self::Compensation { .. }) {
                    return Err(CoreError::invalid_argument("nested compensation"));
                }
                out.extend_from_slice(&undoes.as_u64().to_le_bytes());
                out.push(op.op_type().as_byte());
                op.encode_into(out)?;
            }
            Self::Checkpoint {
                undo_low_water,
                table,
            } => {
                match undo_low_water {
                    Some(instant) => {
                        out.push(1);
                        out.extend_from_slice(&instant.as_u64().to_le_bytes());
                    }
                    None => out.push(0),
                }
                encode_image(out, Some(table))?;
            }
        }
        Ok(())
    }

    /// Decodes an operation body of the given type.
    pub(crate) fn decode_from(op_type: LogOpType, reader: &mut ByteReader<'_>) -> CoreResult<Self> {
        Ok(match op_type {
            LogOpType::BeginXact => {
                let status = XactStatus::from_bits(reader.u32()?);
                let gid = decode_gid(reader)?;
                Self::BeginXact { status, gid }
            }
            LogOpType::EndXact => {
                let gid = decode_gid(reader)?;
                let status = XactStatus::from_bits(read_compressed_int(reader)?);
                Self::EndXact { status, gid }
            }
            LogOpType::RowChange => {
                let container = decode_container(reader)?;
                let page = reader.u64()?;
                let id = reader.u32()?;
                Self::RowChange {
                    record: RecordHandle::new(container, page, id),
                    before: decode_image(reader)?,
                    after: decode_image(reader)?,
                }
            }
            LogOpType::ContainerChange => Self::ContainerChange {
                container: decode_container(reader)?,
                before: ContainerState::from_tag(reader.u8()?)?,
                after: ContainerState::from_tag(reader.u8()?)?,
            },
            LogOpType::Compensation => {
                let undoes = LogInstant(reader.u64()?);
                let inner = reader.u8()?;
                let inner = LogOpType::from_byte(inner)
                    .filter(|t| *t != LogOpType::Compensation)
                    .ok_or_else(|| {
                        CoreError::log_corruption(format!("bad compensated type {inner}"))
                    })?;
                Self::Compensation {
                    undoes,
                    op: Box::new(Self::decode_from(inner, reader)?),
                }
            }
            LogOpType::Checkpoint => {
                let undo_low_water = match reader.u8()? {
                    0 => None,
                    _ => Some(LogInstant(reader.u64()?)),
                };
                let table = decode_image(reader)?
                    .ok_or_else(|| CoreError::log_corruption("checkpoint without table"))?;
                Self::Checkpoint {
                    undo_low_water,
                    table,
                }
            }
        })
    }
}

pub(crate) fn encode_gid(out: &mut Vec<u8>, gid: Option<&GlobalTransactionId>) {
    match gid {
        Some(gid) => {
            out.push(1);
            gid.encode_into(out);
        }
        None => out.push(0),
    }
}

pub(crate) fn decode_gid(reader: &mut ByteReader<'_>) -> CoreResult<Option<GlobalTransactionId>> {
    match reader.u8()? {
        0 => Ok(None),
        1 => GlobalTransactionId::decode_from(reader).map(Some),
        other => Err(CoreError::log_corruption(format!("bad gid flag {other}"))),
    }
}

fn encode_container(out: &mut Vec<u8>, key: ContainerKey) {
    out.extend_from_slice(&key.segment.to_le_bytes());
    out.extend_from_slice(&key.container.to_le_bytes());
}

fn decode_container(reader: &mut ByteReader<'_>) -> CoreResult<ContainerKey> {
    let segment = reader.u32()?;
    let container = reader.u64()?;
    Ok(ContainerKey::new(segment, container))
}

fn encode_image(out: &mut Vec<u8>, image: Option<&[u8]>) -> CoreResult<()> {
    match image {
        Some(bytes) => {
            let len = u32::try_from(bytes.len())
                .map_err(|_| CoreError::invalid_argument("record image too large"))?;
            out.push(1);
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(bytes);
        }
        None => out.push(0),
    }
    Ok(())
}

fn decode_image(reader: &mut ByteReader<'_>) -> CoreResult<Option<Vec<u8>>> {
    match reader.u8()? {
        0 => Ok(None),
        1 => {
            let len = reader.u32()? as usize;
            Ok(Some(reader.bytes(len)?.to_vec()))
        }
        other => Err(CoreError::log_corruption(format!("bad image flag {other}"))),
    }
}
