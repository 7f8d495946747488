//! Snapshot statistics exposed by the orchestrator (C7, §6).
//!
//! Grounded on `examples/original_source/xproxy-beta/cache/cache_fs.cpp`'s
//! `get_stats`/`get_internal_stats`, which each return a flat struct by
//! value rather than a live handle, so callers get a consistent point-in-time
//! view without holding any lock.

use std::path::PathBuf;

/// External-facing statistics for one open volume (`stats_fs` in the
/// original).
#[derive(Clone, Debug)]
pub struct StatsFs {
    pub path: PathBuf,
    pub cnt_fs_nodes: u64,
    pub cnt_ranges: u64,
    pub cnt_entries: u64,
    pub entries_data_size: u64,
    pub max_allowed_data_size: u64,
    pub cnt_flushes: u64,
    pub cnt_fragments_written: u64,
    pub cnt_evacuations: u64,
    pub cnt_overlap_rejections: u64,
    pub pending_reads: usize,
    pub pending_writes: usize,
    pub disk_errors: u32,
}

/// Internal/diagnostic statistics (`stats_internal`), kept separate from
/// [`StatsFs`] the way the original keeps external and internal counters in
/// distinct structs, since these carry fields (write head position, sync
/// serial, UUID) that aren't meant for an external consumer of the cache.
#[derive(Clone, Debug)]
pub struct StatsInternal {
    pub uuid: uuid::Uuid,
    pub write_head_position_blocks: u64,
    pub write_head_lap: u64,
    pub cnt_data_blocks: u64,
    pub sync_serial: u64,
    pub sync_in_progress: bool,
    pub dirty: bool,
}
