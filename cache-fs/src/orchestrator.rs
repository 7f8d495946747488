//! The cache-FS orchestrator (C7) and the public API boundary (C9): §4.7,
//! §6, §8 scenarios S4/S5.
//!
//! Grounded directly on
//! `examples/original_source/xproxy-beta/cache/cache_fs.cpp`'s `init`,
//! `init_reset`, `close(forced)`, `async_open_read`/`async_open_write`,
//! `async_sync_metadata`, and `on_disk_error`. The single-writer-process
//! advisory lock is new relative to the original (which assumes a single
//! process owns the device by deployment convention); `fslock` is already in
//! the teacher's dependency family and gives that guarantee cheaply, so it
//! is added here rather than left as an undocumented assumption.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::aggregate::{self, AggregateWriter};
use crate::aio::AioService;
use crate::config::VolumeConfig;
use crate::error::{MetadataError, OpenError};
use crate::handles::{ReadHandle, WriteHandle};
use crate::index::FragmentIndex;
use crate::internal_events::{
    FatalErrorThresholdReached, MetadataSyncFailed, OpenRejected, ReadTransactionDenied,
    VolumeClosed, VolumeOpened, VolumeReset, WriteTransactionDenied,
};
use crate::key::ObjectKey;
use crate::metadata::{self, MetadataHeader};
use crate::range::Range;
use crate::stats::{StatsFs, StatsInternal};
use crate::volume::{ProductionVolume, Volume};
use cache_fs_common::InternalEvent;

/// Called exactly once, the first time the fatal-error threshold is
/// crossed (§4.7, §7). Mirrors `cache_fs.cpp`'s `on_fs_bad_cb_`.
pub type OnFsBadCb = Box<dyn FnOnce() + Send + 'static>;

struct DiskErrorState {
    count: u32,
    fired: bool,
}

/// Owns C1 (volume), C2 (fragment index), C3 (metadata header), C4/C5
/// (aggregate writer), and C8 (AIO service) for one open volume, and
/// exposes the public open/sync/stats/close API (C9).
pub struct CacheFs {
    cfg: VolumeConfig,
    volume: Box<dyn Volume>,
    index: RwLock<FragmentIndex>,
    aggregate: AggregateWriter,
    aio: AioService,
    header: Mutex<MetadataHeader>,
    dirty: AtomicBool,
    sync_in_progress: AtomicBool,
    disk_errors: Mutex<DiskErrorState>,
    on_fs_bad: Mutex<Option<OnFsBadCb>>,
    data_region_start: u64,
    data_region_end: u64,
    _lock: fslock::LockFile,
    bg_shutdown: CancellationToken,
}

impl CacheFs {
    pub(crate) fn aio(&self) -> &AioService {
        &self.aio
    }

    pub(crate) fn index(&self) -> &RwLock<FragmentIndex> {
        &self.index
    }

    pub(crate) fn aggregate(&self) -> &AggregateWriter {
        &self.aggregate
    }

    pub(crate) fn volume(&self) -> &dyn Volume {
        self.volume.as_ref()
    }

    pub(crate) fn cfg(&self) -> &VolumeConfig {
        &self.cfg
    }

    /// Opens (creating if necessary is the caller's job via
    /// `ProductionVolume`) and brings up a volume: acquires the
    /// single-writer-process lock, computes the data-region layout,
    /// attempts to load metadata slot A then B, and falls back to a fresh
    /// reset if neither is valid. Spawns the AIO worker pool and the
    /// periodic metadata-sync background task.
    #[instrument(skip(cfg, on_fs_bad), fields(path = %cfg.path.display()))]
    pub async fn open(
        cfg: VolumeConfig,
        num_read_workers: usize,
        num_write_workers: usize,
        on_fs_bad: OnFsBadCb,
    ) -> Result<Arc<Self>, OpenError> {
        let lock = Self::acquire_lock(&cfg.path)?;

        let volume = Box::new(
            ProductionVolume::open(&cfg.path)
                .await
                .map_err(|source| OpenError::VolumeOpen { source })?,
        );
        let fs = Self::bring_up(cfg, volume, lock, on_fs_bad).await?;
        fs.aio.start(num_read_workers, num_write_workers);
        fs.clone().spawn_metadata_sync_task();
        Ok(fs)
    }

    /// Test/embedding entry point that bypasses real-file locking and
    /// opens over an arbitrary [`Volume`] impl (e.g. [`crate::volume::MemoryVolume`]).
    pub async fn open_with_volume(
        cfg: VolumeConfig,
        volume: Box<dyn Volume>,
        num_read_workers: usize,
        num_write_workers: usize,
        on_fs_bad: OnFsBadCb,
    ) -> Result<Arc<Self>, OpenError> {
        let fs = Self::bring_up(cfg, volume, fslock::LockFile::open(&lock_scratch_path())
            .map_err(|source| OpenError::Lock { source })?, on_fs_bad)
            .await?;
        fs.aio.start(num_read_workers, num_write_workers);
        fs.clone().spawn_metadata_sync_task();
        Ok(fs)
    }

    fn acquire_lock(path: &Path) -> Result<fslock::LockFile, OpenError> {
        let lock_path = Self::lock_path(path);
        let mut lock = fslock::LockFile::open(&lock_path).map_err(|source| OpenError::Lock { source })?;
        if !lock.try_lock().map_err(|source| OpenError::Lock { source })? {
            return Err(OpenError::AlreadyOpen);
        }
        Ok(lock)
    }

    fn lock_path(path: &Path) -> PathBuf {
        let mut p = path.as_os_str().to_owned();
        p.push(".lock");
        PathBuf::from(p)
    }

    /// Layout + load-or-reset, shared by both `open` entry points.
    async fn bring_up(
        cfg: VolumeConfig,
        volume: Box<dyn Volume>,
        lock: fslock::LockFile,
        on_fs_bad: OnFsBadCb,
    ) -> Result<Arc<Self>, OpenError> {
        let data_offset = cfg.skip_bytes + 2 * cfg.md_slot_size;
        if volume.size() <= data_offset + cfg.agg_write_block_size {
            return Err(OpenError::VolumeTooSmall);
        }
        let data_region_size =
            aggregate::data_region_size_bytes(volume.size(), data_offset, cfg.agg_write_block_size)
                .map_err(OpenError::from)?;
        let data_region_end = data_offset + data_region_size;
        let cnt_data_blocks = aggregate::cnt_data_blocks(data_region_size, cfg.agg_write_block_size);

        let (header, index) = Self::load_or_reset(&cfg, volume.as_ref(), data_offset, data_region_end).await?;

        VolumeOpened {
            path: cfg.path.display().to_string(),
            cnt_fs_nodes: index.cnt_fs_nodes(),
        }
        .emit();

        let start_position_blocks = (header.write_position - data_offset) / cfg.agg_write_block_size;
        let aggregate = AggregateWriter::new(
            cfg.clone(),
            data_offset,
            cnt_data_blocks,
            start_position_blocks,
            header.write_lap,
        );

        Ok(Arc::new(Self {
            cfg,
            volume,
            index: RwLock::new(index),
            aggregate,
            aio: AioService::new(),
            header: Mutex::new(header),
            dirty: AtomicBool::new(false),
            sync_in_progress: AtomicBool::new(false),
            disk_errors: Mutex::new(DiskErrorState { count: 0, fired: false }),
            on_fs_bad: Mutex::new(Some(on_fs_bad)),
            data_region_start: data_offset,
            data_region_end,
            _lock: lock,
            bg_shutdown: CancellationToken::new(),
        }))
    }

    /// §4.7 "Startup load": try slot A, then slot B, then fall through to
    /// a fresh reset written to both slots.
    async fn load_or_reset(
        cfg: &VolumeConfig,
        volume: &dyn Volume,
        data_offset: u64,
        data_region_end: u64,
    ) -> Result<(MetadataHeader, FragmentIndex), OpenError> {
        let avail = volume.size();
        for slot in 0..2u64 {
            let offset = cfg.skip_bytes + slot * cfg.md_slot_size;
            let mut buf = vec![0u8; cfg.md_slot_size as usize];
            if volume.read_at(&mut buf, offset).await.is_err() {
                continue;
            }
            match metadata::decode_slot(&buf, avail, cfg.min_avg_obj_size) {
                Ok((header, index)) => {
                    if metadata::validate_write_position(header.write_position, data_offset, data_region_end)
                        .is_ok()
                    {
                        info!(slot, write_position = header.write_position, write_lap = header.write_lap, "metadata loaded");
                        return Ok((header, index));
                    }
                }
                Err(_) => continue,
            }
        }

        VolumeReset { path: cfg.path.display().to_string() }.emit();
        Self::reset(cfg, volume, data_offset).await
    }

    /// §4.7 "Startup reset": write both slots identically so either is
    /// valid immediately after a crash right after reset.
    async fn reset(
        cfg: &VolumeConfig,
        volume: &dyn Volume,
        data_offset: u64,
    ) -> Result<(MetadataHeader, FragmentIndex), OpenError> {
        let header = MetadataHeader::fresh(data_offset);
        let index = FragmentIndex::new(volume.size(), cfg.min_avg_obj_size);
        let slot_bytes = metadata::encode_slot(&header, &index, cfg.md_slot_size as usize);

        volume
            .write_at(&slot_bytes, cfg.skip_bytes)
            .await
            .map_err(OpenError::from)?;
        volume
            .write_at(&slot_bytes, cfg.skip_bytes + cfg.md_slot_size)
            .await
            .map_err(OpenError::from)?;

        Ok((header, index))
    }

    /// §4.7 `async_open_read`: admission-checked against the read queue's
    /// depth, resolved against C2 synchronously (the lookup itself is
    /// cheap; only the actual data movement goes through AIO), returning
    /// `None` immediately above the configured open-queue depth (§8 S5).
    #[instrument(skip(self))]
    pub fn async_open_read(self: &Arc<Self>, key: ObjectKey, range: Range) -> Option<Arc<ReadHandle>> {
        if self.aio.read_queue_depth() >= self.cfg.open_queue_depth {
            OpenRejected { path: self.cfg.path.display().to_string(), write: false }.emit();
            return None;
        }
        let handle = ReadHandle::begin_read(Arc::clone(self), key, range);
        if handle.is_none() {
            ReadTransactionDenied { path: self.cfg.path.display().to_string() }.emit();
        }
        handle
    }

    /// §4.7 `async_open_write`. `truncate` selects the overwrite policy
    /// applied to any existing range this write's declared range overlaps
    /// (`true` -> `AlwaysOverwrite`, `false` -> `NeverOverwrite`); admitted
    /// against the same read-queue depth the original dispatches opens of
    /// either direction through (kept per `SPEC_FULL.md`'s
    /// supplemented-features section).
    #[instrument(skip(self))]
    pub fn async_open_write(
        self: &Arc<Self>,
        key: ObjectKey,
        range: Range,
        truncate: bool,
    ) -> Option<Arc<WriteHandle>> {
        if self.aio.read_queue_depth() >= self.cfg.open_queue_depth {
            OpenRejected { path: self.cfg.path.display().to_string(), write: true }.emit();
            return None;
        }
        if self.index.read().limit_reached() {
            WriteTransactionDenied { path: self.cfg.path.display().to_string() }.emit();
            return None;
        }
        self.dirty.store(true, Ordering::Release);
        Some(WriteHandle::new(Arc::clone(self), key, range, truncate))
    }

    /// §4.7 `async_sync_metadata`: at most one sync in flight; marks the
    /// table non-dirty and bumps the sync serial together (under the
    /// header lock) before attempting the write, and decrements the
    /// serial back on failure, exactly matching the original's ordering.
    #[instrument(skip(self))]
    pub async fn async_sync_metadata(self: &Arc<Self>) -> Result<(), MetadataError> {
        if self.sync_in_progress.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.do_sync_metadata().await;
        self.sync_in_progress.store(false, Ordering::Release);
        result
    }

    async fn do_sync_metadata(&self) -> Result<(), MetadataError> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let (slot, bytes) = {
            let mut header = self.header.lock();
            header.sync_serial += 1;
            let (position_blocks, lap) = self.aggregate.write_head();
            header.write_position = self.data_region_start + position_blocks * self.cfg.agg_write_block_size;
            header.write_lap = lap;
            let slot = metadata::slot_for_serial(header.sync_serial);
            let table = self.index.read();
            let bytes = metadata::encode_slot(&header, &table, self.cfg.md_slot_size as usize);
            (slot, bytes)
        };

        let offset = self.cfg.skip_bytes + slot as u64 * self.cfg.md_slot_size;
        if let Err(err) = self.volume.write_at(&bytes, offset).await {
            let mut header = self.header.lock();
            header.sync_serial -= 1;
            self.dirty.store(true, Ordering::Release);
            MetadataSyncFailed { path: self.cfg.path.display().to_string() }.emit();
            debug!(?err, "metadata sync failed");
            return Ok(());
        }

        Ok(())
    }

    /// §4.7 `on_disk_error`: increments the fatal-error counter under its
    /// own mutex; fires the `on_fs_bad` callback exactly once at the
    /// configured threshold.
    pub(crate) fn on_disk_error(&self) {
        let mut state = self.disk_errors.lock();
        state.count += 1;
        if state.count >= self.cfg.fatal_error_threshold && !state.fired {
            state.fired = true;
            FatalErrorThresholdReached {
                path: self.cfg.path.display().to_string(),
                disk_errors: state.count,
            }
            .emit();
            if let Some(cb) = self.on_fs_bad.lock().take() {
                cb();
            }
        }
    }

    /// §4.7/§5 shutdown discipline: (1) AIO drained and joined, (2)
    /// aggregate writer's pending flush completed unless `forced`, (3)
    /// metadata synced if dirty, (4) volume handle closed.
    #[instrument(skip(self))]
    pub async fn close(self: Arc<Self>, forced: bool) {
        self.bg_shutdown.cancel();
        self.aio.stop().await;

        if !forced && self.aggregate.has_pending() {
            if self.aggregate.flush(&self.index, self.volume.as_ref()).await.is_err() {
                self.on_disk_error();
            }
        }

        if self.dirty.load(Ordering::Acquire) {
            let _ = self.do_sync_metadata().await;
        }

        let _ = self.volume.close().await;
        VolumeClosed { path: self.cfg.path.display().to_string(), forced }.emit();
    }

    pub fn get_stats(&self) -> StatsFs {
        let table = self.index.read();
        let agg = self.aggregate.stats();
        StatsFs {
            path: self.cfg.path.clone(),
            cnt_fs_nodes: table.cnt_fs_nodes(),
            cnt_ranges: table.cnt_ranges(),
            cnt_entries: table.cnt_entries(),
            entries_data_size: table.entries_data_size(),
            max_allowed_data_size: table.max_allowed_data_size(),
            cnt_flushes: agg.flushes.load(Ordering::Relaxed),
            cnt_fragments_written: agg.fragments_written.load(Ordering::Relaxed),
            cnt_evacuations: agg.evacuations.load(Ordering::Relaxed),
            cnt_overlap_rejections: agg.overlap_rejections.load(Ordering::Relaxed),
            pending_reads: self.aio.read_queue_depth(),
            pending_writes: self.aio.write_queue_depth(),
            disk_errors: self.disk_errors.lock().count,
        }
    }

    /// Test-only: enqueues `n` no-op jobs directly onto the read queue, so
    /// integration tests can exercise admission control (§8 S5) without
    /// wiring up real slow I/O to hold the queue open.
    #[cfg(any(test, feature = "test-util"))]
    pub fn debug_saturate_read_queue(&self, n: usize) {
        for _ in 0..n {
            self.aio.push_back_read_queue(Box::pin(async {}));
        }
    }

    /// Test-only: forces an aggregate-block flush outside the normal
    /// staging-buffer-full trigger, so tests can pin down exactly when a
    /// fragment lands on disk (§8 S1-S3).
    #[cfg(any(test, feature = "test-util"))]
    pub async fn debug_force_flush(&self) -> Result<(), crate::error::HandleError> {
        self.aggregate.flush(&self.index, self.volume.as_ref()).await
    }

    /// Test-only: the disk block currently backing a covering range entry,
    /// so tests can observe evacuation relocating a fragment (§8 S3)
    /// without depending on `FragmentIndex`'s internals directly.
    #[cfg(any(test, feature = "test-util"))]
    pub fn debug_disk_block_for(&self, key: ObjectKey, range: Range) -> Option<u64> {
        self.index
            .read()
            .find_covering(&key, range)
            .and_then(|elems| elems.first().map(|e| e.disk_block()))
    }

    pub fn get_internal_stats(&self) -> StatsInternal {
        let header = self.header.lock();
        let (position_blocks, lap) = self.aggregate.write_head();
        StatsInternal {
            uuid: header.uuid,
            write_head_position_blocks: position_blocks,
            write_head_lap: lap,
            cnt_data_blocks: self.aggregate.cnt_data_blocks(),
            sync_serial: header.sync_serial,
            sync_in_progress: self.sync_in_progress.load(Ordering::Acquire),
            dirty: self.dirty.load(Ordering::Acquire),
        }
    }

    /// Spawns the periodic metadata-sync background task (§4.7: "driven
    /// externally by C7"). Jittered around `cfg.flush_interval` so many
    /// volumes under one supervisor don't all sync in lockstep.
    fn spawn_metadata_sync_task(self: Arc<Self>) {
        let shutdown = self.bg_shutdown.clone();
        tokio::spawn(async move {
            loop {
                let jitter_ms = rand::thread_rng().gen_range(0..1000);
                let delay = self.cfg.flush_interval + std::time::Duration::from_millis(jitter_ms);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                let _ = self.async_sync_metadata().await;
            }
        });
    }
}

fn lock_scratch_path() -> PathBuf {
    std::env::temp_dir().join(format!("cache-fs-test-{}.lock", std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VolumeConfigBuilder;
    use crate::key::ObjectKey;
    use crate::volume::MemoryVolume;

    fn test_cfg() -> VolumeConfig {
        VolumeConfigBuilder::new("/tmp/cache-fs-test-volume")
            .agg_write_block_size(65536)
            .agg_meta_size(4096)
            .store_block_size(512)
            .md_slot_size(65536)
            .skip_bytes(0)
            .open_queue_depth(4)
            .frag_max_data_size(8192)
            .build()
            .unwrap()
    }

    async fn open_test_fs(cfg: VolumeConfig, size: u64) -> Arc<CacheFs> {
        let volume = Box::new(MemoryVolume::new(size));
        CacheFs::open_with_volume(cfg, volume, 1, 1, Box::new(|| {}))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn fresh_volume_resets_and_opens() {
        let cfg = test_cfg();
        let fs = open_test_fs(cfg, 65536 * 2 + 65536 * 8).await;
        assert_eq!(fs.get_stats().cnt_fs_nodes, 0);
        fs.close(true).await;
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let cfg = test_cfg();
        let fs = open_test_fs(cfg, 65536 * 2 + 65536 * 8).await;

        let key = ObjectKey::new([7; 16]);
        let range = Range::new(0, 4096).unwrap();
        let handle = fs.async_open_write(key, range, true).unwrap();
        handle
            .async_write(vec![bytes::Bytes::from(vec![0xAB; 4096])])
            .await
            .unwrap();
        handle.async_close().await.unwrap();
        fs.aggregate().flush(fs.index(), fs.volume()).await.unwrap();

        let read = fs.async_open_read(key, range).unwrap();
        let data = read.async_read(4096).await.unwrap();
        assert_eq!(data, vec![0xAB; 4096]);
        assert!(matches!(read.async_read(4096).await, Err(crate::error::HandleError::Eof)));
        read.async_close();

        fs.close(true).await;
    }

    #[tokio::test]
    async fn open_read_refused_past_queue_depth() {
        let cfg = test_cfg();
        let fs = open_test_fs(cfg, 65536 * 2 + 65536 * 8).await;

        for _ in 0..fs.cfg().open_queue_depth {
            fs.aio().push_back_read_queue(Box::pin(async {}));
        }
        let key = ObjectKey::new([1; 16]);
        let range = Range::new(0, 10).unwrap();
        assert!(fs.async_open_read(key, range).is_none());

        fs.close(true).await;
    }
}
