//! Byte ranges, range elements, and the small-buffer-optimized per-key
//! range vector (§3, §4.2, §9 of the object-cache design).

use cache_fs_common::ByteSizeOf;
use smallvec::SmallVec;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

/// Maximum value of a range element's reader counter; `bump_reader` refuses
/// (saturating) rather than wrapping past this.
pub const MAX_READER_COUNT: u8 = 255;

/// A half-open byte interval `[offset, offset + len)` in an object's
/// logical byte space. `len == 0` is invalid and rejected by constructors
/// that validate it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Range {
    pub offset: u64,
    pub len: u64,
}

impl Range {
    pub fn new(offset: u64, len: u64) -> Option<Self> {
        if len == 0 {
            return None;
        }
        offset.checked_add(len)?;
        Some(Self { offset, len })
    }

    pub fn end(&self) -> u64 {
        self.offset + self.len
    }

    pub fn overlaps(&self, other: &Range) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }

    /// True if `self` lies entirely within `[other.offset, other.end())`.
    pub fn contains(&self, other: &Range) -> bool {
        self.offset <= other.offset && other.end() <= self.end()
    }
}

bitflags::bitflags! {
    /// Transient, in-memory-only metadata bits. The on-disk encoding of a
    /// range element carries the same bits, but `IN_MEMORY` elements are
    /// always stripped on load (§4.2: "any element with the in-memory-only
    /// bit set is discarded").
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct RangeFlags: u8 {
        /// The fragment is staged in the aggregate block and not yet
        /// flushed to its `disk_block`.
        const IN_MEMORY = 0b0000_0001;
        /// The evacuation scan has already considered this element during
        /// the current flush cycle; avoids re-evacuating it twice if it
        /// spans more than one store block.
        const EVICTION_VISITED = 0b0000_0010;
    }
}

/// One fragment's index entry: its logical range, its physical location
/// (in store blocks from the start of the data region), and its transient
/// metadata bits (§3).
///
/// `reader_count` and `flags` are plain atomics so they can be mutated
/// through a shared reference while the table is only read-locked (§5):
/// `modify_entries`/`read_entries` only need a shared lock on the table,
/// and bumping a reader count must not require promoting to an exclusive
/// lock.
pub struct RangeElem {
    pub range: Range,
    /// The write head's monotonic sequence number (`position + lap *
    /// cnt_data_blocks`, see `aggregate::WriteHead::sequence`) at which
    /// this fragment's payload was (or will be) written. An atomic rather
    /// than a plain field so evacuation can relocate a fragment under only
    /// a shared lock on the index (§5), the same way `reader_count`/`flags`
    /// are mutated without promoting to the exclusive table lock.
    disk_block: AtomicU64,
    reader_count: AtomicU8,
    flags: AtomicU8,
}

impl RangeElem {
    pub fn new(range: Range, disk_block: u64, in_memory: bool) -> Self {
        let flags = if in_memory {
            RangeFlags::IN_MEMORY.bits()
        } else {
            0
        };
        Self {
            range,
            disk_block: AtomicU64::new(disk_block),
            reader_count: AtomicU8::new(0),
            flags: AtomicU8::new(flags),
        }
    }

    pub fn disk_block(&self) -> u64 {
        self.disk_block.load(Ordering::Acquire)
    }

    /// Relocates this element's recorded write-sequence number. Used only
    /// by evacuation (§4.3): the logical content is unchanged, only where
    /// it now lives in the write sequence.
    pub fn set_disk_block(&self, value: u64) {
        self.disk_block.store(value, Ordering::Release);
    }

    pub fn reader_count(&self) -> u8 {
        self.reader_count.load(Ordering::Acquire)
    }

    /// Atomically increments the reader counter. Returns `false` (and
    /// leaves the counter unchanged) if it is already saturated at
    /// [`MAX_READER_COUNT`].
    pub fn bump_reader(&self) -> bool {
        self.reader_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
                if c >= MAX_READER_COUNT {
                    None
                } else {
                    Some(c + 1)
                }
            })
            .is_ok()
    }

    /// Reverses one `bump_reader`. Panics (debug) if called without a
    /// matching prior increment — callers own begin/end pairing.
    pub fn release_reader(&self) {
        let prev = self.reader_count.fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| {
            Some(c.saturating_sub(1))
        });
        debug_assert!(prev.map(|c| c > 0).unwrap_or(true));
    }

    pub fn is_in_memory(&self) -> bool {
        self.flags.load(Ordering::Acquire) & RangeFlags::IN_MEMORY.bits() != 0
    }

    pub fn set_in_memory(&self, value: bool) {
        self.set_flag(RangeFlags::IN_MEMORY, value);
    }

    pub fn eviction_visited(&self) -> bool {
        self.flags.load(Ordering::Acquire) & RangeFlags::EVICTION_VISITED.bits() != 0
    }

    pub fn set_eviction_visited(&self, value: bool) {
        self.set_flag(RangeFlags::EVICTION_VISITED, value);
    }

    fn set_flag(&self, flag: RangeFlags, value: bool) {
        if value {
            self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
        }
    }

    /// A snapshot copy, used when loading from disk (where there are no
    /// concurrent readers yet) and by tests.
    pub fn snapshot(&self) -> RangeElemSnapshot {
        RangeElemSnapshot {
            range: self.range,
            disk_block: self.disk_block(),
            reader_count: self.reader_count(),
            in_memory: self.is_in_memory(),
            eviction_visited: self.eviction_visited(),
        }
    }

    pub fn from_snapshot(s: RangeElemSnapshot) -> Self {
        let elem = Self::new(s.range, s.disk_block, s.in_memory);
        elem.reader_count.store(s.reader_count, Ordering::Release);
        elem.set_eviction_visited(s.eviction_visited);
        elem
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RangeElemSnapshot {
    pub range: Range,
    pub disk_block: u64,
    pub reader_count: u8,
    pub in_memory: bool,
    pub eviction_visited: bool,
}

impl ByteSizeOf for RangeElem {
    fn allocated_bytes(&self) -> usize {
        0
    }
}

/// The ordered, pairwise-disjoint collection of range elements for one
/// key. Small-buffer-optimized: a single element never heap-allocates
/// (`smallvec`'s inline capacity of 1 is the direct analogue of the
/// original `range_vector`'s SBO, which §9 calls out as load-bearing for
/// the index's memory-budget accounting).
pub type RangeVector = SmallVec<[RangeElem; 1]>;

/// Returns `true` while `v` is using its inline (non-heap) storage, i.e.
/// holds at most one element. Mirrors the original `range_vector::has_sbo`
/// assumption that the index's accounting in `index.rs` relies on.
pub fn is_inline(v: &RangeVector) -> bool {
    !v.spilled()
}

/// Finds the contiguous run of indices in `v` whose ranges overlap
/// `target`. `v` is assumed sorted and pairwise-disjoint, so the result is
/// always a contiguous slice of indices.
pub fn find_overlapping(v: &RangeVector, target: Range) -> std::ops::Range<usize> {
    let start = v.partition_point(|e| e.range.end() <= target.offset);
    let mut end = start;
    while end < v.len() && v[end].range.offset < target.end() {
        end += 1;
    }
    start..end
}

/// Inserts `elem` into `v`, keeping it sorted by logical offset. Fails
/// (returning `elem` back) if `elem.range` would overlap an existing
/// element — callers are expected to have already removed any overlap via
/// [`find_overlapping`] plus an overwrite policy.
pub fn insert_sorted(v: &mut RangeVector, elem: RangeElem) -> Result<(), RangeElem> {
    let idx = v.partition_point(|e| e.range.offset < elem.range.offset);
    if idx > 0 && v[idx - 1].range.overlaps(&elem.range) {
        return Err(elem);
    }
    if idx < v.len() && v[idx].range.overlaps(&elem.range) {
        return Err(elem);
    }
    v.insert(idx, elem);
    Ok(())
}

/// Returns the exact SBO-accounting delta for adding one range element,
/// given the vector's size *before* the insert. Ported from
/// `fs_table.cpp::calc_inc_cnt_ranges`: the index does not count inline
/// (single-element) range vectors toward its per-range budget, so the
/// 0 -> 1 transition costs nothing, the 1 -> 2 transition costs two (the
/// previously-uncounted element plus the new one), and anything beyond
/// that costs one per element added.
pub fn calc_inc_cnt_ranges(size_before: usize) -> u64 {
    match size_before {
        0 => 0,
        1 => 2,
        _ => 1,
    }
}

/// Ported from `fs_table.cpp::calc_dec_cnt_ranges`: the inverse of
/// [`calc_inc_cnt_ranges`]. `size_before` is the vector's size before the
/// removal, `dec` is the number of elements being removed.
pub fn calc_dec_cnt_ranges(size_before: usize, dec: usize) -> u64 {
    if size_before == 1 {
        // Already inline; it was never counted.
        0
    } else if size_before == dec + 1 {
        // Falls back to a single (uncounted) element: every counted
        // element, including the one that remains, stops counting.
        (dec + 1) as u64
    } else {
        dec as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(offset: u64, len: u64) -> Range {
        Range::new(offset, len).unwrap()
    }

    #[test]
    fn range_overlap() {
        assert!(r(0, 10).overlaps(&r(5, 10)));
        assert!(!r(0, 10).overlaps(&r(10, 10)));
        assert!(!r(10, 10).overlaps(&r(0, 10)));
    }

    #[test]
    fn range_zero_len_invalid() {
        assert!(Range::new(0, 0).is_none());
    }

    #[test]
    fn reader_count_saturates() {
        let e = RangeElem::new(r(0, 10), 0, false);
        for _ in 0..MAX_READER_COUNT {
            assert!(e.bump_reader());
        }
        assert_eq!(e.reader_count(), MAX_READER_COUNT);
        assert!(!e.bump_reader());
        e.release_reader();
        assert_eq!(e.reader_count(), MAX_READER_COUNT - 1);
    }

    #[test]
    fn sbo_accounting_transitions() {
        // 0 -> 1: free.
        assert_eq!(calc_inc_cnt_ranges(0), 0);
        // 1 -> 2: both elements start counting.
        assert_eq!(calc_inc_cnt_ranges(1), 2);
        // 2 -> 3 and beyond: one at a time.
        assert_eq!(calc_inc_cnt_ranges(2), 1);
        assert_eq!(calc_inc_cnt_ranges(5), 1);

        // Still inline: free.
        assert_eq!(calc_dec_cnt_ranges(1, 1), 0);
        // Falling back from 2 -> 1: both stop counting.
        assert_eq!(calc_dec_cnt_ranges(2, 1), 2);
        // Removing from a larger vector that stays larger than 1.
        assert_eq!(calc_dec_cnt_ranges(5, 2), 2);
    }

    #[test]
    fn find_overlapping_is_contiguous() {
        let mut v: RangeVector = SmallVec::new();
        insert_sorted(&mut v, RangeElem::new(r(0, 10), 0, false)).unwrap();
        insert_sorted(&mut v, RangeElem::new(r(20, 10), 1, false)).unwrap();
        insert_sorted(&mut v, RangeElem::new(r(40, 10), 2, false)).unwrap();

        assert_eq!(find_overlapping(&v, r(5, 20)), 0..1);
        assert_eq!(find_overlapping(&v, r(5, 40)), 0..3);
        assert_eq!(find_overlapping(&v, r(15, 4)), 1..1);
    }

    #[test]
    fn insert_sorted_rejects_overlap() {
        let mut v: RangeVector = SmallVec::new();
        insert_sorted(&mut v, RangeElem::new(r(0, 10), 0, false)).unwrap();
        assert!(insert_sorted(&mut v, RangeElem::new(r(5, 10), 1, false)).is_err());
        insert_sorted(&mut v, RangeElem::new(r(10, 10), 1, false)).unwrap();
        assert_eq!(v.len(), 2);
    }
}
