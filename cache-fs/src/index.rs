//! The fragment index (C2, "FS-Table"): an in-memory map from object key to
//! its range vector, with the memory-budget accounting of §4.2.

use std::collections::HashMap;
use std::mem;

use smallvec::SmallVec;
use snafu::ensure;
use tracing::trace;

use crate::error::{BadFooterMagicSnafu, BadHeaderMagicSnafu, MetadataError, TruncatedTableSnafu};
use crate::key::{ObjectKey, OBJECT_KEY_LEN};
use crate::range::{
    self, calc_dec_cnt_ranges, calc_inc_cnt_ranges, Range, RangeElem, RangeElemSnapshot,
    RangeVector,
};

/// Magic identifying a serialized FS-Table header. Reused from the
/// original `fs_table::disk_hdr::magic`.
pub const TABLE_HEADER_MAGIC: u64 = 0xFEED_CAFE_DEAD_BEEF;
/// Magic identifying a serialized FS-Table footer.
pub const TABLE_FOOTER_MAGIC: u64 = 0xCAFE_BABE_FEED_FACE;

/// Result of [`FragmentIndex::add`]. Mirrors `fs_table::add_res` in the
/// original implementation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddResult {
    Added,
    Overwrote,
    Skipped,
    LimitReached,
}

/// A caller-supplied policy deciding whether a new range element should
/// replace the existing elements it overlaps. Receives the half-open index
/// range of overlapping elements and the incoming element's range.
pub trait OverwritePolicy {
    fn should_overwrite(&self, overlapping: &[RangeElem], incoming: &Range) -> bool;
}

/// Always replaces whatever it overlaps. Used by the write path when a
/// range is reissued (e.g. after a truncating open-write).
pub struct AlwaysOverwrite;

impl OverwritePolicy for AlwaysOverwrite {
    fn should_overwrite(&self, _overlapping: &[RangeElem], _incoming: &Range) -> bool {
        true
    }
}

/// Never replaces; any overlap is a skip. Used when a duplicate write must
/// not clobber already-cached data.
pub struct NeverOverwrite;

impl OverwritePolicy for NeverOverwrite {
    fn should_overwrite(&self, _overlapping: &[RangeElem], _incoming: &Range) -> bool {
        false
    }
}

/// The in-memory size, in bytes, that one `(key, range_elem)` pair costs
/// against the index's budget. Grounded on `fs_table.cpp`'s
/// `sizeof(fs_node_t) == sizeof(fs_node_key_t) + sizeof(range_vector)`: the
/// cost is charged per *counted* range (see [`calc_inc_cnt_ranges`]), so
/// this is the per-slot cost, not a whole-key cost.
pub const SLOT_COST_BYTES: u64 = mem::size_of::<crate::key::ObjectKey>() as u64
    + 32 /* on-disk size of one range_elem, §3 */;

/// In-memory fragment index: object key -> ordered, disjoint range vector.
///
/// Not internally synchronized — callers wrap it in the reader-writer lock
/// described in §5 (`orchestrator::CacheFs` holds a `parking_lot::RwLock<FragmentIndex>`).
/// Methods taking `&self` only mutate through atomics on `RangeElem` and
/// are safe to call under a shared lock; methods taking `&mut self` require
/// the exclusive lock.
pub struct FragmentIndex {
    max_allowed_data_size: u64,
    cnt_ranges: u64,
    cnt_entries: u64,
    entries_data_size: u64,
    nodes: HashMap<ObjectKey, RangeVector>,
}

impl FragmentIndex {
    /// `avail_disk_space` / `min_avg_obj_size` bound the absolute ceiling
    /// on index memory, per §4.2's `max_bytes` formula.
    pub fn new(avail_disk_space: u64, min_avg_obj_size: u32) -> Self {
        Self {
            max_allowed_data_size: Self::max_data_size(avail_disk_space, min_avg_obj_size),
            cnt_ranges: 0,
            cnt_entries: 0,
            entries_data_size: 0,
            nodes: HashMap::new(),
        }
    }

    fn max_data_size(disk_space: u64, min_object_size: u32) -> u64 {
        if min_object_size == 0 {
            return 0;
        }
        (disk_space / u64::from(min_object_size)) * SLOT_COST_BYTES
    }

    fn data_size(&self, cnt_nodes: u64, cnt_ranges: u64) -> u64 {
        (cnt_nodes + cnt_ranges) * SLOT_COST_BYTES
    }

    pub fn max_allowed_data_size(&self) -> u64 {
        self.max_allowed_data_size
    }

    pub fn cnt_fs_nodes(&self) -> u64 {
        self.nodes.len() as u64
    }

    pub fn cnt_ranges(&self) -> u64 {
        self.cnt_ranges
    }

    pub fn cnt_entries(&self) -> u64 {
        self.cnt_entries
    }

    pub fn entries_data_size(&self) -> u64 {
        self.entries_data_size
    }

    pub fn limit_reached(&self) -> bool {
        self.data_size(self.cnt_fs_nodes(), self.cnt_ranges) >= self.max_allowed_data_size
    }

    /// §4.2 `add`.
    pub fn add(
        &mut self,
        key: ObjectKey,
        elem: RangeElem,
        overwrite: &dyn OverwritePolicy,
    ) -> AddResult {
        let Some(rvec) = self.nodes.get_mut(&key) else {
            if self.data_size(self.cnt_fs_nodes() + 1, self.cnt_ranges) > self.max_allowed_data_size
            {
                return AddResult::LimitReached;
            }
            let rng = elem.range;
            let mut v: RangeVector = SmallVec::new();
            v.push(elem);
            self.nodes.insert(key, v);
            self.on_inc_entries(&rng);
            trace!(?key, "fragment index: added new key");
            return AddResult::Added;
        };

        let overlap = range::find_overlapping(rvec, elem.range);
        if overlap.is_empty() {
            let inc = calc_inc_cnt_ranges(rvec.len());
            if self.data_size(self.cnt_fs_nodes(), self.cnt_ranges + inc) > self.max_allowed_data_size
            {
                return AddResult::LimitReached;
            }
            let rng = elem.range;
            match range::insert_sorted(rvec, elem) {
                Ok(()) => {
                    self.cnt_ranges += inc;
                    self.on_inc_entries(&rng);
                    AddResult::Added
                }
                Err(_) => AddResult::Skipped,
            }
        } else if overwrite.should_overwrite(&rvec[overlap.clone()], &elem.range) {
            let cnt_before = rvec.len();
            let removed_size: u64 = rvec[overlap.clone()].iter().map(|e| e.range.len).sum();
            let removed_cnt = overlap.len();
            rvec.drain(overlap);
            self.on_dec_entries(removed_cnt as u64, removed_size);

            let cnt_now = rvec.len();
            let dec = calc_dec_cnt_ranges(cnt_before, cnt_before - cnt_now);
            debug_assert!(self.cnt_ranges >= dec);
            self.cnt_ranges -= dec;

            let inc = calc_inc_cnt_ranges(cnt_now);
            debug_assert!(dec >= inc);

            let rng = elem.range;
            range::insert_sorted(rvec, elem)
                .expect("overlap already removed, insert cannot fail");
            self.cnt_ranges += inc;
            self.on_inc_entries(&rng);
            AddResult::Overwrote
        } else {
            AddResult::Skipped
        }
    }

    /// §4.2 `remove`: `rem` receives the mutable range vector and returns
    /// how much logical data it removed; the caller decides which elements
    /// to drop (e.g. by predicate). Returns the count removed, or `None`
    /// if the key was absent.
    pub fn remove<F>(&mut self, key: &ObjectKey, rem: F) -> Option<u64>
    where
        F: FnOnce(&mut RangeVector) -> u64,
    {
        let rvec = self.nodes.get_mut(key)?;
        let cnt_before = rvec.len();
        let rem_size = rem(rvec);
        let cnt_removed = cnt_before - rvec.len();

        let dec = calc_dec_cnt_ranges(cnt_before, cnt_removed);
        debug_assert!(self.cnt_ranges >= dec);
        self.cnt_ranges -= dec;
        self.on_dec_entries(cnt_removed as u64, rem_size);

        if rvec.is_empty() {
            self.nodes.remove(key);
        }
        Some(cnt_removed as u64)
    }

    /// §4.2 `find_covering`: the contiguous run of elements whose union
    /// exactly covers `requested`, or `None` if there is a gap or the key
    /// is absent.
    pub fn find_covering(&self, key: &ObjectKey, requested: Range) -> Option<&[RangeElem]> {
        let rvec = self.nodes.get(key)?;
        let overlap = range::find_overlapping(rvec, requested);
        if overlap.is_empty() {
            return None;
        }
        let slice = &rvec[overlap];
        if slice.first()?.range.offset > requested.offset {
            return None;
        }
        if slice.last()?.range.end() < requested.end() {
            return None;
        }
        for w in slice.windows(2) {
            if w[0].range.end() != w[1].range.offset {
                return None;
            }
        }
        Some(slice)
    }

    /// §4.2 `modify`: read-only traversal of a key's elements, for flipping
    /// metadata bits (e.g. bumping reader counts) via the elements' atomics.
    /// Must not add or remove elements.
    pub fn read_entries(&self, key: &ObjectKey) -> Option<&[RangeElem]> {
        self.nodes.get(key).map(|v| v.as_slice())
    }

    fn on_inc_entries(&mut self, rng: &Range) {
        self.cnt_entries += 1;
        self.entries_data_size += rng.len;
    }

    fn on_dec_entries(&mut self, cnt_removed: u64, rem_size: u64) {
        self.cnt_entries -= cnt_removed;
        self.entries_data_size -= rem_size;
    }

    /// Iterates every `(key, range_elem)` pair. Used by `metadata.rs` to
    /// serialize the table and by the evacuation scan in `aggregate.rs`.
    pub fn iter(&self) -> impl Iterator<Item = (&ObjectKey, &RangeElem)> {
        self.nodes
            .iter()
            .flat_map(|(k, v)| v.iter().map(move |e| (k, e)))
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.cnt_ranges = 0;
        self.cnt_entries = 0;
        self.entries_data_size = 0;
    }

    /// Serializes the table to the persistence format of §4.2:
    /// `[header(magic, counts, sizes)][for each key: raw_key_bytes,
    /// serialized range vector][footer(magic)]`.
    pub fn save(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&TABLE_HEADER_MAGIC.to_le_bytes());
        out.extend_from_slice(&(self.cnt_fs_nodes()).to_le_bytes());
        out.extend_from_slice(&self.cnt_ranges.to_le_bytes());
        out.extend_from_slice(&self.cnt_entries.to_le_bytes());
        out.extend_from_slice(&self.max_allowed_data_size.to_le_bytes());
        out.extend_from_slice(&self.entries_data_size.to_le_bytes());

        for (key, rvec) in &self.nodes {
            out.extend_from_slice(key.as_bytes());
            out.extend_from_slice(&(rvec.len() as u32).to_le_bytes());
            for elem in rvec {
                let s = elem.snapshot();
                // In-memory-only elements were never flushed; they are
                // never written to the persisted table to begin with (C5
                // only promotes a fragment into the table once it is part
                // of a block that has actually been handed to `flush`),
                // but we guard here too since it is cheap and exactly
                // matches the §4.2 load-time discard rule.
                if s.in_memory {
                    continue;
                }
                out.extend_from_slice(&s.range.offset.to_le_bytes());
                out.extend_from_slice(&s.range.len.to_le_bytes());
                out.extend_from_slice(&s.disk_block.to_le_bytes());
            }
        }

        out.extend_from_slice(&TABLE_FOOTER_MAGIC.to_le_bytes());
    }

    /// Loads a table from bytes produced by [`FragmentIndex::save`].
    /// Any element with the in-memory-only bit set is discarded (it was
    /// never flushed) and all transient metadata bits (reader counts,
    /// eviction marks) are cleared, per §4.2.
    pub fn load(
        bytes: &[u8],
        avail_disk_space: u64,
        min_avg_obj_size: u32,
    ) -> Result<Self, MetadataError> {
        let mut r = 0usize;
        let take = |r: &mut usize, n: usize| -> Result<&[u8], MetadataError> {
            ensure!(bytes.len() >= *r + n, TruncatedTableSnafu);
            let s = &bytes[*r..*r + n];
            *r += n;
            Ok(s)
        };

        let magic = u64::from_le_bytes(take(&mut r, 8)?.try_into().unwrap());
        ensure!(magic == TABLE_HEADER_MAGIC, BadHeaderMagicSnafu);
        let cnt_nodes = u64::from_le_bytes(take(&mut r, 8)?.try_into().unwrap());
        let _cnt_ranges = u64::from_le_bytes(take(&mut r, 8)?.try_into().unwrap());
        let _cnt_entries = u64::from_le_bytes(take(&mut r, 8)?.try_into().unwrap());
        let _max_allowed = u64::from_le_bytes(take(&mut r, 8)?.try_into().unwrap());
        let _entries_data_size = u64::from_le_bytes(take(&mut r, 8)?.try_into().unwrap());

        let mut table = Self::new(avail_disk_space, min_avg_obj_size);

        for _ in 0..cnt_nodes {
            let key_bytes = take(&mut r, OBJECT_KEY_LEN)?;
            let key = ObjectKey::from_slice(key_bytes).ok_or(MetadataError::TruncatedTable)?;
            let cnt_ranges = u32::from_le_bytes(take(&mut r, 4)?.try_into().unwrap());

            let mut rvec: RangeVector = SmallVec::new();
            for _ in 0..cnt_ranges {
                let offset = u64::from_le_bytes(take(&mut r, 8)?.try_into().unwrap());
                let len = u64::from_le_bytes(take(&mut r, 8)?.try_into().unwrap());
                let disk_block = u64::from_le_bytes(take(&mut r, 8)?.try_into().unwrap());
                let Some(range) = Range::new(offset, len) else {
                    return Err(MetadataError::TruncatedTable);
                };
                let elem = RangeElem::from_snapshot(RangeElemSnapshot {
                    range,
                    disk_block,
                    reader_count: 0,
                    in_memory: false,
                    eviction_visited: false,
                });
                rvec.push(elem);
            }
            if rvec.is_empty() {
                continue;
            }

            let rng_size: u64 = rvec.iter().map(|e| e.range.len).sum();
            let rng_count = rvec.len() as u64;
            let mut ranges_counted = 0u64;
            for i in 0..rvec.len() {
                ranges_counted += calc_inc_cnt_ranges(i);
            }
            table.nodes.insert(key, rvec);
            table.cnt_ranges += ranges_counted;
            table.cnt_entries += rng_count;
            table.entries_data_size += rng_size;
        }

        let footer = u64::from_le_bytes(take(&mut r, 8)?.try_into().unwrap());
        ensure!(footer == TABLE_FOOTER_MAGIC, BadFooterMagicSnafu);

        trace!(cnt_nodes, "fragment index: loaded from bytes");
        Ok(table)
    }
}
