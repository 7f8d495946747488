//! FS-Metadata (C3): the write head, sync counter, UUID, and fragment
//! index, serialized to one of two fixed on-disk slots (§3, §4.7, §6).
//!
//! Grounded on `vector_buffers::disk_v2::ledger::LedgerState`/`Ledger` for
//! the general shape of a small atomically-tracked header record, and on
//! `examples/original_source/xproxy-beta/cache/cache_fs.cpp`'s
//! `init`/`init_reset`/`sync_metadata`/`async_sync_metadata` for the exact
//! slot-selection and dirty/serial semantics: both slots are written
//! identically on reset so either is valid after a crash right after
//! reset, the slot written on each sync is `sync_serial & 1`, and a failed
//! sync decrements the serial back.

use uuid::Uuid;

use crate::error::{
    BadFooterMagicSnafu, BadHeaderMagicSnafu, MetadataError, WriteHeadOutOfRangeSnafu,
};
use crate::index::FragmentIndex;

/// Magic identifying a metadata slot's header.
pub const SLOT_HEADER_MAGIC: u64 = 0xFEED_CAFE_DEAD_BEEF;
/// Magic identifying a metadata slot's footer.
pub const SLOT_FOOTER_MAGIC: u64 = 0x0BAD_F00D_5CA1_AB1E;

/// Fixed-size portion of a metadata slot: everything except the
/// serialized fragment index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MetadataHeader {
    pub uuid: Uuid,
    pub flags: u32,
    pub sync_serial: u64,
    pub write_position: u64,
    pub write_lap: u64,
}

const HEADER_LEN: usize = 8 /* magic */ + 16 /* uuid */ + 4 /* flags */ + 8 + 8 + 8;

impl MetadataHeader {
    pub fn fresh(write_position: u64) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            flags: 0,
            sync_serial: 0,
            write_position,
            write_lap: 0,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&SLOT_HEADER_MAGIC.to_le_bytes());
        out.extend_from_slice(self.uuid.as_bytes());
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.sync_serial.to_le_bytes());
        out.extend_from_slice(&self.write_position.to_le_bytes());
        out.extend_from_slice(&self.write_lap.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Result<Self, MetadataError> {
        snafu::ensure!(bytes.len() >= HEADER_LEN, BadHeaderMagicSnafu);
        let magic = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        snafu::ensure!(magic == SLOT_HEADER_MAGIC, BadHeaderMagicSnafu);
        let uuid = Uuid::from_slice(&bytes[8..24]).map_err(|_| MetadataError::BadHeaderMagic)?;
        let flags = u32::from_le_bytes(bytes[24..28].try_into().unwrap());
        let sync_serial = u64::from_le_bytes(bytes[28..36].try_into().unwrap());
        let write_position = u64::from_le_bytes(bytes[36..44].try_into().unwrap());
        let write_lap = u64::from_le_bytes(bytes[44..52].try_into().unwrap());
        Ok(Self {
            uuid,
            flags,
            sync_serial,
            write_position,
            write_lap,
        })
    }
}

/// Which fixed slot (A=0, B=1) the next sync should target, given the
/// sync serial that will be in effect for that sync. Mirrors
/// `cache_fs.cpp`: `md.inc_sync_serial(); return md.sync_serial() & 1U`.
pub fn slot_for_serial(sync_serial: u64) -> usize {
    (sync_serial & 1) as usize
}

/// Serializes one metadata slot: header, then the fragment index's own
/// `[header][entries][footer]` framing, then the slot-level footer magic,
/// padded to `slot_size` bytes. Panics if the serialized content does not
/// fit in `slot_size` — callers size slots generously (§6) specifically so
/// this cannot happen in practice; a table that grows past its configured
/// slot size is a configuration error, not a runtime one.
pub fn encode_slot(header: &MetadataHeader, table: &FragmentIndex, slot_size: usize) -> Vec<u8> {
    let mut buf = Vec::with_capacity(slot_size);
    header.encode(&mut buf);
    table.save(&mut buf);
    buf.extend_from_slice(&SLOT_FOOTER_MAGIC.to_le_bytes());
    assert!(
        buf.len() <= slot_size,
        "serialized metadata slot ({} bytes) exceeds configured slot size ({slot_size})",
        buf.len()
    );
    buf.resize(slot_size, 0);
    buf
}

/// Parses a metadata slot written by [`encode_slot`]. Validates both the
/// slot-level header/footer magics and the nested fragment-index magics;
/// any failure is reported as a [`MetadataError`] so the caller
/// (`orchestrator::load`) can fall through to the other slot or to reset.
pub fn decode_slot(
    bytes: &[u8],
    avail_disk_space: u64,
    min_avg_obj_size: u32,
) -> Result<(MetadataHeader, FragmentIndex), MetadataError> {
    let header = MetadataHeader::decode(bytes)?;
    let table_start = HEADER_LEN;
    // The table's own serialization ends with its footer magic; we don't
    // know its length up front, so `FragmentIndex::load` consumes exactly
    // what it needs and we locate the slot-level footer immediately after.
    let table = FragmentIndex::load(&bytes[table_start..], avail_disk_space, min_avg_obj_size)?;

    let mut probe = Vec::new();
    table.save(&mut probe);
    let footer_start = table_start + probe.len();
    snafu::ensure!(bytes.len() >= footer_start + 8, BadFooterMagicSnafu);
    let footer = u64::from_le_bytes(bytes[footer_start..footer_start + 8].try_into().unwrap());
    snafu::ensure!(footer == SLOT_FOOTER_MAGIC, BadFooterMagicSnafu);

    Ok((header, table))
}

/// Validates that a loaded write position actually falls inside the data
/// region, the extra check `cache_fs.cpp::init` performs beyond the
/// magic/footer checks (kept per `SPEC_FULL.md`'s supplemented-features
/// section).
pub fn validate_write_position(
    write_position: u64,
    data_start: u64,
    data_end: u64,
) -> Result<(), MetadataError> {
    snafu::ensure!(
        write_position >= data_start && write_position < data_end,
        WriteHeadOutOfRangeSnafu {
            write_pos: write_position,
            data_start,
            data_end,
        }
    );
    Ok(())
}
