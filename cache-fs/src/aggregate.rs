//! The aggregate write block (C4) and aggregate writer task (C5): §4.3.
//!
//! Grounded on `vector_buffers::disk_v2::writer::{RecordWriter, Writer}`
//! for the general shape of a buffered writer that accumulates records and
//! rolls over once full — generalized here from "roll to a new data file"
//! to "flush a fixed-size block and advance the circular write head."

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{instrument, trace, warn};

use crate::config::VolumeConfig;
use crate::error::{HandleError, MetadataError};
use crate::index::{AddResult, FragmentIndex, OverwritePolicy};
use crate::key::ObjectKey;
use crate::range::{Range, RangeElem};
use crate::record::FragmentHeader;
use crate::volume::Volume;

/// One staged fragment inside the current in-RAM aggregate block.
struct StagedEntry {
    key: ObjectKey,
    range: Range,
    offset_in_block: u64,
    payload_len: u32,
}

/// The 1 MiB in-RAM staging area (§3, §4.3). Holds pending fragments as a
/// contiguous payload area plus the list of entries that will become the
/// block's metadata header on flush.
struct AggregateBlock {
    entries: Vec<StagedEntry>,
    payload: Vec<u8>,
}

impl AggregateBlock {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
            payload: Vec::new(),
        }
    }

    fn payload_capacity(cfg: &VolumeConfig) -> u64 {
        cfg.agg_write_block_size - cfg.agg_meta_size
    }

    fn aligned_len(cfg: &VolumeConfig, len: usize) -> u64 {
        let block = u64::from(cfg.store_block_size);
        let len = len as u64;
        ((len + block - 1) / block) * block
    }

    fn remaining(&self, cfg: &VolumeConfig) -> u64 {
        Self::payload_capacity(cfg) - self.payload.len() as u64
    }

    fn has_overlap_for_key(&self, key: &ObjectKey, range: &Range) -> bool {
        self.entries
            .iter()
            .any(|e| &e.key == key && e.range.overlaps(range))
    }

    /// Appends `payload` as a new fragment. Caller has already checked
    /// capacity via [`AggregateBlock::remaining`].
    fn stage(&mut self, cfg: &VolumeConfig, key: ObjectKey, range: Range, payload: &[u8]) {
        let offset_in_block = self.payload.len() as u64;
        self.payload.extend_from_slice(payload);
        let padded = Self::aligned_len(cfg, payload.len()) as usize;
        self.payload.resize(self.payload.len().max(offset_in_block as usize + padded), 0);
        self.entries.push(StagedEntry {
            key,
            range,
            offset_in_block,
            payload_len: payload.len() as u32,
        });
    }

    /// Serializes the block's meta header followed by the (already
    /// padded) payload area, zero-padding out to the full block size
    /// (§4.3's "Layout of a flushed block").
    fn serialize(&self, cfg: &VolumeConfig) -> Vec<u8> {
        let mut meta = Vec::with_capacity(cfg.agg_meta_size as usize);
        meta.extend_from_slice(&AGG_META_MAGIC.to_le_bytes());
        meta.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for e in &self.entries {
            let payload = &self.payload[e.offset_in_block as usize
                ..e.offset_in_block as usize + e.payload_len as usize];
            let checksum =
                FragmentHeader::compute_checksum(&e.key, e.range.offset, e.range.len, payload);
            let header = FragmentHeader {
                key: e.key,
                logical_offset: e.range.offset,
                logical_len: e.range.len,
                offset_in_block: e.offset_in_block,
                payload_len: e.payload_len,
                checksum,
            };
            meta.extend_from_slice(&header.encode());
        }
        assert!(
            meta.len() <= cfg.agg_meta_size as usize,
            "aggregate block meta header overflowed AGG_META_SIZE"
        );
        meta.resize(cfg.agg_meta_size as usize, 0);

        let mut out = meta;
        out.extend_from_slice(&self.payload);
        out.resize(cfg.agg_write_block_size as usize, 0);
        out
    }
}

/// Magic identifying an aggregate block's metadata header (§6).
pub const AGG_META_MAGIC: u64 = 0xA66_FEED_A66_FEED;

/// Reads and decodes the metadata header of the block currently stored at
/// `block_index`, used by the evacuation scan to locate a still-referenced
/// fragment's exact byte range before the block is overwritten.
///
/// `block_index` is the physical slot index (`disk_block %
/// cnt_data_blocks`), not the monotonic sequence number stored in a
/// [`RangeElem`].
pub async fn read_block_headers(
    volume: &dyn Volume,
    cfg: &VolumeConfig,
    data_region_start: u64,
    block_index: u64,
) -> Result<Vec<FragmentHeader>, HandleError> {
    let mut meta = vec![0u8; cfg.agg_meta_size as usize];
    let byte_offset = data_region_start + block_index * cfg.agg_write_block_size;
    volume.read_at(&mut meta, byte_offset).await?;

    let magic = u64::from_le_bytes(meta[0..8].try_into().unwrap());
    if magic != AGG_META_MAGIC {
        return Ok(Vec::new());
    }
    let count = u32::from_le_bytes(meta[8..12].try_into().unwrap());
    let mut headers = Vec::with_capacity(count as usize);
    let mut r = 12usize;
    for _ in 0..count {
        let Some(h) = FragmentHeader::decode(&meta[r..]) else {
            break;
        };
        r += crate::record::FRAGMENT_HEADER_LEN;
        headers.push(h);
    }
    Ok(headers)
}

/// The write head: `(position, lap)` as defined in §3, tracked in whole
/// aggregate blocks from the start of the data region.
#[derive(Debug)]
pub struct WriteHead {
    position_blocks: AtomicU64,
    lap: AtomicU64,
}

impl WriteHead {
    pub fn new(position_blocks: u64, lap: u64) -> Self {
        Self {
            position_blocks: AtomicU64::new(position_blocks),
            lap: AtomicU64::new(lap),
        }
    }

    pub fn position_blocks(&self) -> u64 {
        self.position_blocks.load(Ordering::Acquire)
    }

    pub fn lap(&self) -> u64 {
        self.lap.load(Ordering::Acquire)
    }

    /// The monotonic write-sequence number of the block about to be
    /// written: `position + lap * cnt_data_blocks`. Stored in
    /// [`RangeElem::disk_block`] instead of the bare physical slot index so
    /// that re-staging a fragment during evacuation is observable as a
    /// location change (§8 property 5, S3) even though the physical slot a
    /// lap later is numerically the same.
    pub fn sequence(&self, cnt_data_blocks: u64) -> u64 {
        self.position_blocks() + self.lap() * cnt_data_blocks
    }

    /// Advances by one block, wrapping to 0 and incrementing `lap` if it
    /// crosses `cnt_data_blocks` (§3, §8 property 7).
    fn advance(&self, cnt_data_blocks: u64) {
        let prev = self.position_blocks.fetch_add(1, Ordering::AcqRel);
        if prev + 1 >= cnt_data_blocks {
            self.position_blocks.store(0, Ordering::Release);
            self.lap.fetch_add(1, Ordering::AcqRel);
        }
    }
}

/// Owns the current aggregate block and the authoritative write head.
/// Only the aggregate writer mutates the write head (§4.3).
///
/// The single `RwLock` doubles as the "aggregate window" lock of §5
/// (`vmtx`): readers take a shared lock to check whether the block they
/// want is the currently active window and, if so, copy bytes out of it;
/// the writer takes an exclusive lock only for the duration of building
/// and flushing a block.
pub struct AggregateWriter {
    cfg: VolumeConfig,
    data_region_start: u64,
    cnt_data_blocks: u64,
    head: WriteHead,
    block: RwLock<AggregateBlock>,
    stats: AggregateStats,
}

#[derive(Default)]
pub struct AggregateStats {
    pub flushes: AtomicU64,
    pub fragments_written: AtomicU64,
    pub evacuations: AtomicU64,
    pub overlap_rejections: AtomicU64,
}

impl AggregateWriter {
    pub fn new(
        cfg: VolumeConfig,
        data_region_start: u64,
        cnt_data_blocks: u64,
        start_position_blocks: u64,
        start_lap: u64,
    ) -> Self {
        Self {
            cfg,
            data_region_start,
            cnt_data_blocks,
            head: WriteHead::new(start_position_blocks, start_lap),
            block: RwLock::new(AggregateBlock::new()),
            stats: AggregateStats::default(),
        }
    }

    pub fn write_head(&self) -> (u64, u64) {
        (self.head.position_blocks(), self.head.lap())
    }

    pub fn cnt_data_blocks(&self) -> u64 {
        self.cnt_data_blocks
    }

    /// §4.3 `write_frag`. Attempts to append `payload` as one object
    /// fragment into the current block. Returns `Ok(true)` if consumed
    /// (including the documented overlap-rejected-as-no-op case, §9),
    /// `Ok(false)` if the block has insufficient room and must be flushed
    /// first.
    ///
    /// On success, immediately promotes the fragment into `index` as
    /// *in-memory-only* so same-writer reads can see it before the next
    /// flush (§4.5), at the disk block this write will land on once
    /// flushed.
    #[instrument(skip(self, index, payload), fields(key = ?key, range = ?range))]
    pub fn write_frag(
        &self,
        index: &parking_lot::RwLock<FragmentIndex>,
        key: ObjectKey,
        range: Range,
        payload: &[u8],
        overwrite: &dyn OverwritePolicy,
    ) -> bool {
        let mut block = self.block.write();

        if block.has_overlap_for_key(&key, &range) {
            // §4.3, §9: a known, documented wart. The write task is told
            // "accepted" but nothing is staged for this fragment.
            self.stats.overlap_rejections.fetch_add(1, Ordering::Relaxed);
            warn!(?key, ?range, "aggregate block: rejecting overlapping fragment as no-op");
            return true;
        }

        let padded = AggregateBlock::aligned_len(&self.cfg, payload.len());
        if padded > block.remaining(&self.cfg) {
            return false;
        }

        let disk_block = self.head.sequence(self.cnt_data_blocks);
        let elem = RangeElem::new(range, disk_block, true);
        match index.write().add(key, elem, overwrite) {
            AddResult::LimitReached => {
                // The index is at its budget ceiling. `orchestrator.rs`
                // already pre-checks this before handing out a write
                // transaction, so this is only reachable via a narrow
                // race against a concurrent writer; treat it the same as
                // budget exhaustion elsewhere (§7): drop the write rather
                // than staging bytes with no index entry to find them by.
                warn!(?key, ?range, "aggregate block: index budget exhausted, dropping fragment");
                return true;
            }
            AddResult::Added | AddResult::Overwrote | AddResult::Skipped => {}
        }

        block.stage(&self.cfg, key, range, payload);
        trace!(?key, ?range, disk_block, "aggregate block: staged fragment");
        true
    }

    /// §4.3 `flush`. Evacuates any still-referenced fragments at the
    /// target disk block, writes exactly `agg_write_block_size` bytes at
    /// the write head, flips the staged entries' in-memory bit to
    /// on-disk, and advances the head.
    #[instrument(skip(self, index, volume))]
    pub async fn flush(
        &self,
        index: &parking_lot::RwLock<FragmentIndex>,
        volume: &dyn Volume,
    ) -> Result<(), HandleError> {
        let target_slot = self.head.position_blocks();
        let target_seq = self.head.sequence(self.cnt_data_blocks);

        self.evacuate(index, volume, target_slot).await?;

        let mut block = self.block.write();
        let bytes = block.serialize(&self.cfg);
        let byte_offset = self.data_region_start + target_slot * self.cfg.agg_write_block_size;
        volume.write_at(&bytes, byte_offset).await?;

        // Entries freshly staged by `write_frag` already carry `disk_block
        // == target_seq`; flip them from in-memory to on-disk now that the
        // bytes are durable. Evacuated entries (never in-memory to begin
        // with) are relocated to `target_seq` here instead, since they are
        // only now actually landing in this block's physical slot.
        {
            let table = index.read();
            for entry in &block.entries {
                if let Some(elems) = table.read_entries(&entry.key) {
                    for e in elems {
                        if e.range != entry.range {
                            continue;
                        }
                        if e.is_in_memory() {
                            e.set_in_memory(false);
                        }
                        e.set_disk_block(target_seq);
                    }
                }
            }
        }

        self.stats
            .fragments_written
            .fetch_add(block.entries.len() as u64, Ordering::Relaxed);
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);

        *block = AggregateBlock::new();
        drop(block);

        self.head.advance(self.cnt_data_blocks);
        Ok(())
    }

    /// §4.3 evacuation: before this flush overwrites `target_slot`'s
    /// physical location, pull forward any on-disk fragment parked there
    /// (from an earlier lap) that a live read transaction still
    /// references, re-staging it into the block currently being built so
    /// it survives the overwrite.
    async fn evacuate(
        &self,
        index: &parking_lot::RwLock<FragmentIndex>,
        volume: &dyn Volume,
        target_slot: u64,
    ) -> Result<(), HandleError> {
        let live: Vec<(ObjectKey, Range)> = {
            let table = index.read();
            table
                .iter()
                .filter(|(_, e)| {
                    e.disk_block() % self.cnt_data_blocks == target_slot
                        && !e.is_in_memory()
                        && e.reader_count() > 0
                })
                .map(|(k, e)| (*k, e.range))
                .collect()
        };

        if live.is_empty() {
            return Ok(());
        }

        let headers = read_block_headers(volume, &self.cfg, self.data_region_start, target_slot)
            .await
            .unwrap_or_default();

        for (key, range) in live {
            let Some(header) = headers
                .iter()
                .find(|h| h.key == key && h.logical_offset == range.offset)
            else {
                continue;
            };
            let mut payload = vec![0u8; header.payload_len as usize];
            let byte_offset = self.data_region_start
                + target_slot * self.cfg.agg_write_block_size
                + self.cfg.agg_meta_size
                + header.offset_in_block;
            volume.read_at(&mut payload, byte_offset).await?;

            let mut block = self.block.write();
            if !block.has_overlap_for_key(&key, &range) {
                block.stage(&self.cfg, key, range, &payload);
                self.stats.evacuations.fetch_add(1, Ordering::Relaxed);
                trace!(?key, ?range, "aggregate writer: evacuated live fragment");
            }
        }

        Ok(())
    }

    pub fn stats(&self) -> &AggregateStats {
        &self.stats
    }

    /// True if the in-RAM block has any staged-but-unflushed fragments.
    /// Used by `orchestrator::close` to decide whether a final flush is
    /// worth the extra block write (§4.7 `close`).
    pub fn has_pending(&self) -> bool {
        !self.block.read().entries.is_empty()
    }

    /// §4.5/§4.6 read path: returns the exact payload bytes for one
    /// previously indexed fragment. Takes a shared lock on the same
    /// `RwLock` the writer exclusively locks during `flush` (the "vmtx"
    /// window lock of §5), so a read that lands mid-flush simply waits
    /// for the flush to finish rather than observing a half-written block.
    ///
    /// `disk_block`/`in_memory` are the caller's (possibly now-stale)
    /// snapshot of the index entry; taking the lock before re-deciding
    /// in-memory vs. on-disk closes the race where a concurrent flush
    /// promotes the fragment between the index lookup and this call.
    #[instrument(skip(self, volume), fields(key = ?key, range = ?range))]
    pub async fn read_fragment(
        &self,
        volume: &dyn Volume,
        key: ObjectKey,
        range: Range,
        disk_block: u64,
        in_memory: bool,
    ) -> Result<Vec<u8>, HandleError> {
        let block = self.block.read();
        if in_memory {
            if let Some(entry) = block
                .entries
                .iter()
                .find(|e| e.key == key && e.range == range)
            {
                let bytes = block.payload[entry.offset_in_block as usize
                    ..entry.offset_in_block as usize + entry.payload_len as usize]
                    .to_vec();
                return Ok(bytes);
            }
            // Flushed between the index lookup and this call; fall through
            // to the on-disk path below using the lock we already hold.
        }
        drop(block);

        let physical_slot = disk_block % self.cnt_data_blocks;
        let headers = read_block_headers(volume, &self.cfg, self.data_region_start, physical_slot)
            .await?;
        let header = headers
            .iter()
            .find(|h| h.key == key && h.logical_offset == range.offset)
            .ok_or(HandleError::Eof)?;

        let mut payload = vec![0u8; header.payload_len as usize];
        let byte_offset = self.data_region_start
            + physical_slot * self.cfg.agg_write_block_size
            + self.cfg.agg_meta_size
            + header.offset_in_block;
        volume.read_at(&mut payload, byte_offset).await?;

        match header.verify(&payload) {
            crate::record::RecordStatus::Valid => Ok(payload),
            crate::record::RecordStatus::Corrupted { calculated, actual } => {
                Err(HandleError::Corrupted {
                    calculated,
                    expected: actual,
                })
            }
            crate::record::RecordStatus::FailedDeserialization => Err(HandleError::Eof),
        }
    }
}

/// Returns `cnt_data_blocks`, the number of fixed-size aggregate blocks
/// the data region holds, given its byte size. §6: `data_size =
/// floor((volume_size - data_offset) / agg_write_block_size) *
/// agg_write_block_size`; this returns the block-count form of that.
pub fn cnt_data_blocks(data_region_size: u64, agg_write_block_size: u64) -> u64 {
    data_region_size / agg_write_block_size
}

pub fn data_region_size_bytes(
    volume_size: u64,
    data_offset: u64,
    agg_write_block_size: u64,
) -> Result<u64, MetadataError> {
    let avail = volume_size.saturating_sub(data_offset);
    Ok((avail / agg_write_block_size) * agg_write_block_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VolumeConfigBuilder;
    use crate::index::AlwaysOverwrite;
    use crate::volume::MemoryVolume;
    use parking_lot::RwLock as PLRwLock;
    use std::sync::Arc;

    fn test_cfg() -> VolumeConfig {
        VolumeConfigBuilder::new("/tmp/x")
            .agg_write_block_size(65536)
            .agg_meta_size(4096)
            .store_block_size(512)
            .frag_max_data_size(8192)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn stage_then_flush_promotes_entry_to_on_disk() {
        let cfg = test_cfg();
        let data_region_start = 0u64;
        let vol = MemoryVolume::new(cfg.agg_write_block_size * 4);
        let index = Arc::new(PLRwLock::new(FragmentIndex::new(1 << 30, 4096)));
        let writer = AggregateWriter::new(cfg.clone(), data_region_start, 4, 0, 0);

        let key = ObjectKey::new([1; 16]);
        let range = Range::new(0, 100).unwrap();
        let payload = vec![0xAB; 100];

        assert!(writer.write_frag(&index, key, range, &payload, &AlwaysOverwrite));
        {
            let table = index.read();
            let elems = table.read_entries(&key).unwrap();
            assert!(elems[0].is_in_memory());
        }

        writer.flush(&index, &vol).await.unwrap();

        let table = index.read();
        let elems = table.read_entries(&key).unwrap();
        assert!(!elems[0].is_in_memory());
        assert_eq!(elems[0].disk_block(), 0);
        assert_eq!(writer.write_head(), (1, 0));
    }

    #[tokio::test]
    async fn write_head_wraps_and_increments_lap() {
        let cfg = test_cfg();
        let vol = MemoryVolume::new(cfg.agg_write_block_size * 2);
        let index = Arc::new(PLRwLock::new(FragmentIndex::new(1 << 30, 4096)));
        let writer = AggregateWriter::new(cfg.clone(), 0, 2, 1, 5);

        writer.flush(&index, &vol).await.unwrap();
        assert_eq!(writer.write_head(), (0, 6));
    }

    #[tokio::test]
    async fn overlapping_fragment_in_same_block_is_noop_accept() {
        let cfg = test_cfg();
        let vol = MemoryVolume::new(cfg.agg_write_block_size * 4);
        let index = Arc::new(PLRwLock::new(FragmentIndex::new(1 << 30, 4096)));
        let writer = AggregateWriter::new(cfg.clone(), 0, 4, 0, 0);

        let key = ObjectKey::new([1; 16]);
        let range = Range::new(0, 100).unwrap();
        assert!(writer.write_frag(&index, key, range, &vec![1; 100], &AlwaysOverwrite));
        // Overlapping range for the same key within the same block: "true"
        // but not actually staged.
        let overlapping = Range::new(50, 100).unwrap();
        assert!(writer.write_frag(&index, key, overlapping, &vec![2; 100], &AlwaysOverwrite));
        assert_eq!(writer.stats().overlap_rejections.load(Ordering::Relaxed), 1);

        writer.flush(&index, &vol).await.unwrap();
        let table = index.read();
        // Only the first fragment made it into the block/table.
        assert!(table.find_covering(&key, range).is_some());
    }

    #[tokio::test]
    async fn evacuation_preserves_referenced_fragment_across_flush_cycle() {
        let cfg = test_cfg();
        let vol = MemoryVolume::new(cfg.agg_write_block_size * 2);
        let index = Arc::new(PLRwLock::new(FragmentIndex::new(1 << 30, 4096)));
        let writer = AggregateWriter::new(cfg.clone(), 0, 2, 0, 0);

        let key = ObjectKey::new([2; 16]);
        let range = Range::new(0, 64).unwrap();
        writer.write_frag(&index, key, range, &vec![0xCD; 64], &AlwaysOverwrite);
        writer.flush(&index, &vol).await.unwrap(); // lands at physical slot 0, seq 0

        let original_seq = {
            let table = index.read();
            let elems = table.read_entries(&key).unwrap();
            assert!(elems[0].bump_reader());
            elems[0].disk_block()
        };

        writer.flush(&index, &vol).await.unwrap(); // slot 1, unrelated
        // Wraps back to physical slot 0, a lap later: this flush must
        // evacuate our still-referenced fragment before overwriting it.
        writer.flush(&index, &vol).await.unwrap();

        let table = index.read();
        let found = table.find_covering(&key, range).unwrap();
        // Evacuated: still present, reader count preserved across the
        // re-stage, but now recorded at a later point in the write
        // sequence than the slot it was about to be destroyed at (§8
        // property 5).
        assert_eq!(found[0].reader_count(), 1);
        assert_ne!(found[0].disk_block(), original_seq);
        assert_eq!(writer.stats().evacuations.load(Ordering::Relaxed), 1);
    }
}
