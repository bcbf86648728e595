//! Log record framing.
//!
//! ```text
//! magic (4) | version (2) | type (1) | length (4) | payload | crc32 (4)
//! ```
//!
//! The payload is the owning transaction id (8 bytes, zero for records
//! without one) followed by the operation body. The CRC covers everything
//! before it.

use super::op::{LogOp, LogOpType};
use crate::error::{CoreError, CoreResult};
use crate::types::{ByteReader, TransactionId};

/// Magic bytes identifying a log record.
pub const LOG_MAGIC: [u8; 4] = *b"SLOG";

/// Current log format version.
pub const LOG_VERSION: u16 = 1;

/// magic (4) + version (2) + type (1) + length (4)
pub(crate) const HEADER_SIZE: usize = 11;

pub(crate) const CRC_SIZE: usize = 4;

/// One framed log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Owning transaction; `None` for checkpoints.
    pub txid: Option<TransactionId>,
    /// The logged operation.
    pub op: LogOp,
}

impl LogRecord {
    /// Encodes the record with its envelope.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if the operation cannot be encoded or the
    /// payload exceeds 4 GiB.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&self.txid.map_or(0, TransactionId::as_u64).to_le_bytes());
        self.op.encode_into(&mut payload)?;

        let len = u32::try_from(payload.len())
            .map_err(|_| CoreError::invalid_argument("log record payload too large"))?;
        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        data.extend_from_slice(&LOG_MAGIC);
        data.extend_from_slice(&LOG_VERSION.to_le_bytes());
        data.push(self.op.op_type().as_byte());
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(&payload);
        let crc = compute_crc32(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        Ok(data)
    }

    /// Parses a header, returning the record type and payload length.
    pub(crate) fn parse_header(header: &[u8]) -> CoreResult<(LogOpType, usize)> {
        let mut reader = ByteReader::new(header);
        let magic = reader.array::<4>()?;
        if magic != LOG_MAGIC {
            return Err(CoreError::log_corruption(format!("bad magic {magic:02x?}")));
        }
        let version = u16::from_le_bytes(reader.array()?);
        if version != LOG_VERSION {
            return Err(CoreError::log_corruption(format!(
                "unsupported log version {version}"
            )));
        }
        let type_byte = reader.u8()?;
        let op_type = LogOpType::from_byte(type_byte)
            .ok_or_else(|| CoreError::log_corruption(format!("unknown record type {type_byte}")))?;
        let len = reader.u32()? as usize;
        Ok((op_type, len))
    }

    /// Verifies the CRC of a complete frame and decodes it.
    pub(crate) fn decode_frame(frame: &[u8]) -> CoreResult<Self> {
        if frame.len() < HEADER_SIZE + CRC_SIZE {
            return Err(CoreError::log_corruption("short log frame"));
        }
        let (op_type, len) = Self::parse_header(&frame[..HEADER_SIZE])?;
        if frame.len() != HEADER_SIZE + len + CRC_SIZE {
            return Err(CoreError::log_corruption("frame length mismatch"));
        }
        let body_end = HEADER_SIZE + len;
        let mut crc = [0u8; CRC_SIZE];
        crc.copy_from_slice(&frame[body_end..]);
        let expected = u32::from_le_bytes(crc);
        let actual = compute_crc32(&frame[..body_end]);
        if expected != actual {
            return Err(CoreError::ChecksumMismatch { expected, actual });
        }

        let mut reader = ByteReader::new(&frame[HEADER_SIZE..body_end]);
        let txid = match reader.u64()? {
            0 => None,
            id => Some(TransactionId::new(id)),
        };
        let op = LogOp::decode_from(op_type, &mut reader)?;
        reader.finish("log record")?;
        Ok(Self { txid, op })
    }
}

/// Computes the IEEE CRC32 of `data`.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xact::XactStatus;

    fn begin(id: u64) -> LogRecord {
        LogRecord {
            txid: Some(TransactionId::new(id)),
            op: LogOp::BeginXact {
                status: XactStatus::EMPTY,
                gid: None,
            },
        }
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn frame_roundtrip() {
        let record = begin(7);
        let frame = record.encode().unwrap();
        assert_eq!(&frame[..4], b"SLOG");
        assert_eq!(LogRecord::decode_frame(&frame).unwrap(), record);
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let mut frame = begin(7).encode().unwrap();
        frame[HEADER_SIZE] ^= 0xff;
        assert!(matches!(
            LogRecord::decode_frame(&frame),
            Err(CoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn bad_magic_is_corruption() {
        let mut frame = begin(1).encode().unwrap();
        frame[0] = b'X';
        assert!(matches!(
            LogRecord::decode_frame(&frame),
            Err(CoreError::LogCorruption { .. })
        ));
    }

    #[test]
    fn checkpoint_has_no_owner() {
        let record = LogRecord {
            txid: None,
            op: LogOp::Checkpoint {
                undo_low_water: None,
                table: vec![0],
            },
        };
        let frame = record.encode().unwrap();
        assert_eq!(LogRecord::decode_frame(&frame).unwrap().txid, None);
    }
}
