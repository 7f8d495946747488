//! On-disk framing for one fragment, and the checksum convention shared by
//! fragment headers and the aggregate block header (§3, §4.3, §6).
//!
//! Unlike the teacher's `disk_v2::record::Record`, which archives an
//! arbitrary user-supplied payload type via `rkyv`, a fragment header here
//! is a small, fully fixed-size C-struct-like record (key, range, length,
//! checksum, back-link) — a manual `to_le_bytes`/`from_le_bytes` encoding
//! expresses that more directly than an archive would, while keeping the
//! same checksum convention (CRC32 over the header fields followed by the
//! payload) and the same [`RecordStatus`]-shaped verification result.

use crc32fast::Hasher;

use crate::key::{ObjectKey, OBJECT_KEY_LEN};

/// Encoded size of one [`FragmentHeader`], excluding the payload.
pub const FRAGMENT_HEADER_LEN: usize = OBJECT_KEY_LEN + 8 + 8 + 8 + 4 + 4;

/// The header stored alongside one fragment's payload, both inline in an
/// aggregate block's metadata area (§4.3) and replicated into the
/// on-disk `FS-Table` persistence format's per-entry record (§4.2).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FragmentHeader {
    pub key: ObjectKey,
    pub logical_offset: u64,
    pub logical_len: u64,
    /// Offset of the payload within the aggregate block, in bytes from the
    /// start of the fragment area (i.e. relative to `AGG_META_SIZE`).
    pub offset_in_block: u64,
    pub payload_len: u32,
    pub checksum: u32,
}

impl FragmentHeader {
    pub fn encode(&self) -> [u8; FRAGMENT_HEADER_LEN] {
        let mut buf = [0u8; FRAGMENT_HEADER_LEN];
        let mut w = 0;
        buf[w..w + OBJECT_KEY_LEN].copy_from_slice(self.key.as_bytes());
        w += OBJECT_KEY_LEN;
        buf[w..w + 8].copy_from_slice(&self.logical_offset.to_le_bytes());
        w += 8;
        buf[w..w + 8].copy_from_slice(&self.logical_len.to_le_bytes());
        w += 8;
        buf[w..w + 8].copy_from_slice(&self.offset_in_block.to_le_bytes());
        w += 8;
        buf[w..w + 4].copy_from_slice(&self.payload_len.to_le_bytes());
        w += 4;
        buf[w..w + 4].copy_from_slice(&self.checksum.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < FRAGMENT_HEADER_LEN {
            return None;
        }
        let key = ObjectKey::from_slice(&buf[0..OBJECT_KEY_LEN])?;
        let mut r = OBJECT_KEY_LEN;
        let logical_offset = u64::from_le_bytes(buf[r..r + 8].try_into().ok()?);
        r += 8;
        let logical_len = u64::from_le_bytes(buf[r..r + 8].try_into().ok()?);
        r += 8;
        let offset_in_block = u64::from_le_bytes(buf[r..r + 8].try_into().ok()?);
        r += 8;
        let payload_len = u32::from_le_bytes(buf[r..r + 4].try_into().ok()?);
        r += 4;
        let checksum = u32::from_le_bytes(buf[r..r + 4].try_into().ok()?);
        Some(Self {
            key,
            logical_offset,
            logical_len,
            offset_in_block,
            payload_len,
            checksum,
        })
    }

    /// Computes the checksum over the header's identifying fields plus the
    /// payload, the same convention `disk_v2::record` uses: a fresh
    /// checksum covering everything except the checksum field itself,
    /// followed by the payload bytes.
    pub fn compute_checksum(
        key: &ObjectKey,
        logical_offset: u64,
        logical_len: u64,
        payload: &[u8],
    ) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(key.as_bytes());
        hasher.update(&logical_offset.to_le_bytes());
        hasher.update(&logical_len.to_le_bytes());
        hasher.update(payload);
        hasher.finalize()
    }

    pub fn with_checksum(
        key: ObjectKey,
        logical_offset: u64,
        logical_len: u64,
        offset_in_block: u64,
        payload: &[u8],
    ) -> Self {
        let checksum = Self::compute_checksum(&key, logical_offset, logical_len, payload);
        Self {
            key,
            logical_offset,
            logical_len,
            offset_in_block,
            payload_len: payload.len() as u32,
            checksum,
        }
    }

    pub fn verify(&self, payload: &[u8]) -> RecordStatus {
        if payload.len() as u32 != self.payload_len {
            return RecordStatus::FailedDeserialization;
        }
        let calculated =
            Self::compute_checksum(&self.key, self.logical_offset, self.logical_len, payload);
        if calculated == self.checksum {
            RecordStatus::Valid
        } else {
            RecordStatus::Corrupted {
                calculated,
                actual: self.checksum,
            }
        }
    }
}

/// Result of checking a fragment's payload against its header checksum.
/// Mirrors the shape of `disk_v2::record::RecordStatus`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordStatus {
    Valid,
    Corrupted { calculated: u32, actual: u32 },
    FailedDeserialization,
}
