//! Property tests for the fragment index and the `skip_copy` cursor (§8
//! properties 1, 2 and 8), exercised over randomized inputs the way
//! `vector-buffers` uses `proptest` across its `disk_v2` ledger/record
//! round-trip tests.

use cache_fs::index::{AlwaysOverwrite, FragmentIndex};
use cache_fs::range::RangeElem;
use cache_fs::skip_copy::SkipCopy;
use cache_fs::{ObjectKey, Range};
use proptest::prelude::*;

fn key(n: u8) -> ObjectKey {
    ObjectKey::new([n; 16])
}

/// A small set of possibly-overlapping `(offset, len)` pairs, biased toward
/// collisions so overwrite/skip paths actually get exercised.
fn range_pairs() -> impl Strategy<Value = Vec<(u64, u64)>> {
    prop::collection::vec((0u64..200, 1u64..40), 1..30)
}

proptest! {
    /// §8 property 1: regardless of insertion order or overlap, one key's
    /// range elements end up sorted by logical offset and pairwise
    /// disjoint.
    #[test]
    fn ranges_stay_sorted_and_disjoint(pairs in range_pairs()) {
        let mut index = FragmentIndex::new(1 << 40, 1);
        let k = key(1);
        for (offset, len) in pairs {
            let elem = RangeElem::new(Range::new(offset, len).unwrap(), 0, false);
            index.add(k, elem, &AlwaysOverwrite);
        }

        if let Some(entries) = index.read_entries(&k) {
            for w in entries.windows(2) {
                prop_assert!(w[0].range.offset < w[1].range.offset);
                prop_assert!(w[0].range.end() <= w[1].range.offset);
            }
        }
    }

    /// §8 property 2: adding a range with an always-overwrite policy and
    /// then asking for exactly that range back always finds full coverage.
    #[test]
    fn add_then_find_covering_matches_inserted_range(offset in 0u64..1_000_000, len in 1u64..8192) {
        let mut index = FragmentIndex::new(1 << 40, 1);
        let k = key(2);
        let range = Range::new(offset, len).unwrap();
        index.add(k, RangeElem::new(range, 0, false), &AlwaysOverwrite);

        let covering = index.find_covering(&k, range).unwrap();
        let union_start = covering.first().unwrap().range.offset;
        let union_end = covering.last().unwrap().range.end();
        prop_assert_eq!(union_start, range.offset);
        prop_assert_eq!(union_end, range.end());
    }

    /// §8 property 8: `skip_copy` delivers exactly `all_len - skip_beg -
    /// skip_end` bytes and skips exactly `skip_beg + skip_end`, regardless
    /// of how the source is chunked.
    #[test]
    fn skip_copy_delivers_exact_window(
        all_len in 1u64..500,
        beg_frac in 0u64..100,
        end_frac in 0u64..100,
        chunk in 1usize..64,
    ) {
        // Derive skip_beg/skip_end as fractions of all_len so beg+end <=
        // all_len always holds, satisfying SkipCopy::new's precondition.
        let skip_beg = (all_len * beg_frac) / 200;
        let skip_end = (all_len * end_frac) / 200;

        let source: Vec<u8> = (0..all_len).map(|i| (i % 251) as u8).collect();
        let mut src_pos = 0usize;
        let mut cursor = SkipCopy::new(0, all_len, skip_beg, skip_end);
        let mut total_skipped = 0u64;
        let mut total_copied = 0u64;
        let mut delivered = Vec::new();

        while !cursor.done() {
            let mut buf = vec![0u8; chunk];
            let step = cursor.step(
                &mut buf,
                |n| {
                    let avail = (source.len() - src_pos) as u64;
                    let n = n.min(avail);
                    src_pos += n as usize;
                    n
                },
                |dst| {
                    let avail = source.len() - src_pos;
                    let n = dst.len().min(avail);
                    dst[..n].copy_from_slice(&source[src_pos..src_pos + n]);
                    src_pos += n;
                    n as u64
                },
            );
            total_skipped += step.skipped;
            total_copied += step.copied;
            delivered.extend_from_slice(&buf[..step.copied as usize]);
            if step.skipped == 0 && step.copied == 0 {
                break;
            }
        }

        prop_assert_eq!(total_copied, all_len - skip_beg - skip_end);
        prop_assert_eq!(total_skipped, skip_beg + skip_end);
        prop_assert_eq!(delivered.len() as u64, total_copied);
        let expected: Vec<u8> = (skip_beg..all_len - skip_end)
            .map(|i| (i % 251) as u8)
            .collect();
        prop_assert_eq!(delivered, expected);
    }
}
