//! Identity types shared across the core.

use crate::error::{CoreError, CoreResult};
use std::fmt;

/// Local transaction id.
///
/// Unique only within one run of the engine. Ids grow strictly within a
/// boot and restart from `largest logged id + 1` after recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Creates a new transaction id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xid:{}", self.0)
    }
}

/// Maximum length of the global and branch parts of an XA id.
pub const MAX_GID_PART_LEN: usize = 64;

/// Global (XA) transaction id: format id, global id and branch qualifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GlobalTransactionId {
    format_id: i32,
    global_id: Vec<u8>,
    branch_id: Vec<u8>,
}

impl GlobalTransactionId {
    /// Creates a global id.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if either part is longer than
    /// [`MAX_GID_PART_LEN`] bytes.
    pub fn new(
        format_id: i32,
        global_id: impl Into<Vec<u8>>,
        branch_id: impl Into<Vec<u8>>,
    ) -> CoreResult<Self> {
        let global_id = global_id.into();
        let branch_id = branch_id.into();
        if global_id.len() > MAX_GID_PART_LEN || branch_id.len() > MAX_GID_PART_LEN {
            return Err(CoreError::invalid_argument(format!(
                "global id parts are limited to {MAX_GID_PART_LEN} bytes"
            )));
        }
        Ok(Self {
            format_id,
            global_id,
            branch_id,
        })
    }

    /// Returns the format id.
    #[must_use]
    pub fn format_id(&self) -> i32 {
        self.format_id
    }

    /// Returns the global transaction id bytes.
    #[must_use]
    pub fn global_id(&self) -> &[u8] {
        &self.global_id
    }

    /// Returns the branch qualifier bytes.
    #[must_use]
    pub fn branch_id(&self) -> &[u8] {
        &self.branch_id
    }

    pub(crate) fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.format_id.to_le_bytes());
        // lengths fit in a byte, checked in `new`
        out.push(self.global_id.len() as u8);
        out.extend_from_slice(&self.global_id);
        out.push(self.branch_id.len() as u8);
        out.extend_from_slice(&self.branch_id);
    }

    pub(crate) fn decode_from(reader: &mut ByteReader<'_>) -> CoreResult<Self> {
        let format_id = i32::from_le_bytes(reader.array()?);
        let global_len = reader.u8()? as usize;
        let global_id = reader.bytes(global_len)?.to_vec();
        let branch_len = reader.u8()? as usize;
        let branch_id = reader.bytes(branch_len)?.to_vec();
        Self::new(format_id, global_id, branch_id)
            .map_err(|_| CoreError::log_corruption("oversized global id"))
    }
}

impl fmt::Display for GlobalTransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gid:{}:", self.format_id)?;
        for b in &self.global_id {
            write!(f, "{b:02x}")?;
        }
        f.write_str(":")?;
        for b in &self.branch_id {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Position of a record in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogInstant(pub u64);

impl LogInstant {
    /// Returns the raw log offset.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for LogInstant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "log:{}", self.0)
    }
}

/// Identity of a container: segment plus container number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContainerKey {
    /// Segment holding the container.
    pub segment: u32,
    /// Container number within the segment.
    pub container: u64,
}

impl ContainerKey {
    /// Creates a container key.
    #[must_use]
    pub const fn new(segment: u32, container: u64) -> Self {
        Self { segment, container }
    }
}

impl fmt::Display for ContainerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.segment, self.container)
    }
}

/// Handle of one record inside a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordHandle {
    /// Owning container.
    pub container: ContainerKey,
    /// Page number.
    pub page: u64,
    /// Record id within the page.
    pub id: u32,
}

impl RecordHandle {
    /// Creates a record handle.
    #[must_use]
    pub const fn new(container: ContainerKey, page: u64, id: u32) -> Self {
        Self {
            container,
            page,
            id,
        }
    }
}

impl fmt::Display for RecordHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({},{})", self.container, self.page, self.id)
    }
}

/// Token such that lock owners sharing it never conflict with each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CompatibilitySpace(pub u64);

/// Cursor over an encoded byte slice.
pub(crate) struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn bytes(&mut self, len: usize) -> CoreResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                CoreError::log_corruption(format!(
                    "need {len} bytes at offset {}, have {}",
                    self.pos,
                    self.data.len() - self.pos
                ))
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn array<const N: usize>(&mut self) -> CoreResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> CoreResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub(crate) fn u32(&mut self) -> CoreResult<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub(crate) fn u64(&mut self) -> CoreResult<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn finish(&self, what: &str) -> CoreResult<()> {
        if self.remaining() != 0 {
            return Err(CoreError::log_corruption(format!(
                "{} trailing bytes in {what}",
                self.remaining()
            )));
        }
        Ok(())
    }
}
