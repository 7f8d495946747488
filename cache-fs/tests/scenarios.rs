//! End-to-end scenario tests, one per lettered scenario in the object-cache
//! design's testable-properties section (S1-S6). Colocated under `tests/`
//! the way `vector-buffers` keeps its `disk_v2` integration suite alongside
//! its unit tests, driven entirely through the public `CacheFs` API (the
//! `test-util` feature's `debug_*` hooks stand in for the disk-fault
//! injection and timing control a real disk doesn't give a test).

use std::sync::Arc;

use bytes::Bytes;
use cache_fs::error::HandleError;
use cache_fs::volume::{MemoryVolume, Volume};
use cache_fs::{CacheFs, ObjectKey, Range, VolumeConfig, VolumeConfigBuilder};

const AGG_BLOCK: u64 = 65536;
const AGG_META: u64 = 4096;
const STORE_BLOCK: u32 = 512;
const FRAG_MAX: u64 = 8192;
const MD_SLOT: u64 = 65536;

fn cfg_with(open_queue_depth: usize) -> VolumeConfig {
    VolumeConfigBuilder::new("/tmp/cache-fs-scenario-volume")
        .agg_write_block_size(AGG_BLOCK)
        .agg_meta_size(AGG_META)
        .store_block_size(STORE_BLOCK)
        .frag_max_data_size(FRAG_MAX)
        .md_slot_size(MD_SLOT)
        .skip_bytes(0)
        .open_queue_depth(open_queue_depth)
        .build()
        .unwrap()
}

fn data_offset(cfg: &VolumeConfig) -> u64 {
    cfg.skip_bytes + 2 * cfg.md_slot_size
}

/// Builds a fresh volume with `cnt_blocks` aggregate blocks of data region,
/// opens it, and returns both the engine and the underlying byte buffer
/// (kept so a test can re-open the same bytes after closing, or corrupt a
/// metadata slot directly).
async fn open_fresh(cfg: VolumeConfig, cnt_blocks: u64) -> (Arc<CacheFs>, MemoryVolume) {
    let size = data_offset(&cfg) + cnt_blocks * cfg.agg_write_block_size;
    let backing = MemoryVolume::new(size);
    let handle_for_fs = backing.shared_handle();
    let fs = CacheFs::open_with_volume(cfg, Box::new(handle_for_fs), 1, 1, Box::new(|| {}))
        .await
        .unwrap();
    (fs, backing)
}

async fn write_full(fs: &Arc<CacheFs>, key: ObjectKey, range: Range, fill: u8) {
    let handle = fs.async_open_write(key, range, true).unwrap();
    let consumed = handle
        .async_write(vec![Bytes::from(vec![fill; range.len as usize])])
        .await
        .unwrap();
    assert_eq!(consumed, range.len);
    handle.async_close().await.unwrap();
}

/// Drains a read transaction to EOF, returning every byte delivered.
async fn read_all(handle: &Arc<cache_fs::ReadHandle>, chunk: usize) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        match handle.async_read(chunk).await {
            Ok(bytes) if bytes.is_empty() => break,
            Ok(mut bytes) => out.append(&mut bytes),
            Err(HandleError::Eof) => break,
            Err(e) => panic!("unexpected read error: {e:?}"),
        }
    }
    out
}

/// S1 - empty volume, single write, single read.
#[tokio::test]
async fn s1_empty_volume_single_write_single_read() {
    let cfg = cfg_with(56);
    let (fs, _backing) = open_fresh(cfg, 8).await;

    let key = ObjectKey::from_url("http://h/a");
    let range = Range::new(0, 20_480).unwrap();
    write_full(&fs, key, range, 0xAB).await;
    fs.debug_force_flush().await.unwrap();

    let read = fs.async_open_read(key, range).unwrap();
    let data = read_all(&read, 4096).await;
    assert_eq!(data.len(), 20_480);
    assert!(data.iter().all(|&b| b == 0xAB));
    assert!(matches!(read.async_read(1).await, Err(HandleError::Eof)));
    read.async_close();

    fs.close(true).await;
}

/// S2 - partial read of a gapped object: a request spanning an uncached gap
/// between two written ranges must report "not present", not a short read.
#[tokio::test]
async fn s2_partial_read_of_gapped_object_is_not_present() {
    let cfg = cfg_with(56);
    let (fs, _backing) = open_fresh(cfg, 8).await;

    let key = ObjectKey::from_url("http://h/a");
    write_full(&fs, key, Range::new(0, 20_480).unwrap(), 0xAB).await;
    fs.debug_force_flush().await.unwrap();
    write_full(&fs, key, Range::new(40_960, 20_480).unwrap(), 0xCD).await;
    fs.debug_force_flush().await.unwrap();

    let gapped = Range::new(10_240, 32_768).unwrap();
    assert!(fs.async_open_read(key, gapped).is_none());

    // The two written sub-ranges remain independently readable.
    let read = fs
        .async_open_read(key, Range::new(0, 20_480).unwrap())
        .unwrap();
    assert_eq!(read_all(&read, 20_480).await.len(), 20_480);
    read.async_close();

    fs.close(true).await;
}

/// S3 - a live read transaction defers the aggregate writer from destroying
/// the fragment it references: the writer must evacuate it forward instead
/// of silently overwriting it when the circular head wraps back around.
#[tokio::test]
async fn s3_reader_blocks_eviction_via_evacuation() {
    let cfg = cfg_with(56);
    let cnt_blocks = 8;
    let (fs, _backing) = open_fresh(cfg, cnt_blocks).await;

    let f_key = ObjectKey::from_url("http://h/f");
    let f_range = Range::new(0, 4096).unwrap();
    write_full(&fs, f_key, f_range, 0x11).await;
    fs.debug_force_flush().await.unwrap(); // lands in physical slot 0

    let original_block = fs.debug_disk_block_for(f_key, f_range).unwrap();

    let read = fs.async_open_read(f_key, f_range).unwrap();

    // Drive the write head all the way around the circular log back to
    // slot 0: `cnt_blocks - 1` more flushes reach the last slot, and one
    // more wraps it back to 0, a lap later, which is where the flush must
    // evacuate `f_key`'s fragment rather than destroy it.
    for i in 0..cnt_blocks {
        let other_key = ObjectKey::from_url(&format!("http://h/other-{i}"));
        write_full(&fs, other_key, Range::new(0, 512).unwrap(), i as u8).await;
        fs.debug_force_flush().await.unwrap();
    }

    let relocated_block = fs
        .debug_disk_block_for(f_key, f_range)
        .expect("evacuated fragment must still be present");
    assert_ne!(
        relocated_block, original_block,
        "evacuation must relocate the fragment to a new point in the write sequence"
    );

    // The read transaction opened before the evacuation still sees the
    // fragment's original bytes correctly.
    let data = read_all(&read, 4096).await;
    assert_eq!(data, vec![0x11; 4096]);
    read.async_close();

    fs.close(true).await;
}

/// S4 - metadata A/B slot selection on load: after writing several ranges
/// and syncing twice (landing in slot B then slot A), corrupting slot B's
/// header must not prevent a restart from loading the valid state in slot A.
#[tokio::test]
async fn s4_metadata_slot_selection_survives_other_slot_corruption() {
    let cfg = cfg_with(56);
    let (fs, backing) = open_fresh(cfg.clone(), 8).await;

    let key = ObjectKey::from_url("http://h/a");
    write_full(&fs, key, Range::new(0, 4096).unwrap(), 0xAA).await;
    fs.debug_force_flush().await.unwrap();
    fs.async_sync_metadata().await.unwrap(); // serial 0 -> 1, slot B

    write_full(&fs, key, Range::new(8192, 4096).unwrap(), 0xBB).await;
    fs.debug_force_flush().await.unwrap();
    fs.async_sync_metadata().await.unwrap(); // serial 1 -> 2, slot A

    let expected_internal = fs.get_internal_stats();
    assert_eq!(expected_internal.sync_serial, 2);
    fs.close(true).await;

    // Corrupt slot B's header magic directly on the shared backing bytes.
    let slot_b_offset = cfg.skip_bytes + cfg.md_slot_size;
    let mut corrupt = vec![0u8; 8];
    backing.read_at(&mut corrupt, slot_b_offset).await.unwrap();
    corrupt[0] ^= 0xFF;
    backing.write_at(&corrupt, slot_b_offset).await.unwrap();

    let reopened = CacheFs::open_with_volume(
        cfg,
        Box::new(backing.shared_handle()),
        1,
        1,
        Box::new(|| {}),
    )
    .await
    .unwrap();

    let internal = reopened.get_internal_stats();
    assert_eq!(internal.sync_serial, expected_internal.sync_serial);
    assert_eq!(
        internal.write_head_position_blocks,
        expected_internal.write_head_position_blocks
    );
    assert_eq!(reopened.get_stats().cnt_fs_nodes, 1);
    assert!(reopened
        .async_open_read(key, Range::new(0, 4096).unwrap())
        .is_some());

    reopened.close(true).await;
}

/// S5 - pipelined opens exceeding the admission queue's depth are refused
/// immediately rather than enqueued.
#[tokio::test]
async fn s5_opens_past_queue_depth_are_refused_immediately() {
    let depth = 56;
    let cfg = cfg_with(depth);
    let (fs, _backing) = open_fresh(cfg, 8).await;

    fs.debug_saturate_read_queue(depth);

    let key = ObjectKey::from_url("http://h/a");
    let range = Range::new(0, 10).unwrap();
    for _ in 0..4 {
        assert!(
            fs.async_open_read(key, range).is_none(),
            "opens past the configured queue depth must be refused, not enqueued"
        );
    }

    fs.close(true).await;
}

/// S6 - a write transaction fed more bytes than its declared range accepts
/// all the bytes the range can hold, then reports `unexpected_data` on the
/// call that overflowed it.
#[tokio::test]
async fn s6_write_with_unexpected_extra_bytes() {
    let cfg = cfg_with(56);
    let (fs, _backing) = open_fresh(cfg, 8).await;

    let key = ObjectKey::from_url("http://h/a");
    let range = Range::new(0, 8192).unwrap();
    let handle = fs.async_open_write(key, range, true).unwrap();

    let err = handle
        .async_write(vec![Bytes::from(vec![0x42; 9000])])
        .await
        .unwrap_err();
    assert!(matches!(err, HandleError::UnexpectedData));
    handle.async_close().await.unwrap();

    fs.debug_force_flush().await.unwrap();
    let read = fs.async_open_read(key, range).unwrap();
    let data = read_all(&read, 8192).await;
    assert_eq!(data, vec![0x42; 8192]);
    read.async_close();

    fs.close(true).await;
}
