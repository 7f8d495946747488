//! `InternalEvent` impls for the orchestrator (C7) and handle (C6) layers.
//!
//! `aggregate.rs`'s own flush/evacuation/overlap counters are emitted
//! directly from inside the aggregate writer's hot path via plain
//! `AtomicU64`s plus `tracing::warn!`/`trace!`, which is cheap enough to pay
//! on every fragment and is read back out through `AggregateStats`. The
//! events here cover everything else: volume lifecycle, metadata sync,
//! and the admission-control paths a caller can actually observe failing.
//! Grounded on `vector_buffers::internal_events`'s `BufferCreated`/
//! `BufferEventsReceived`/`BufferReadError` shape.

use cache_fs_common::{error_type, InternalEvent};
use metrics::{counter, gauge};
use tracing::{error, info, trace, warn};

pub struct VolumeOpened {
    pub path: String,
    pub cnt_fs_nodes: u64,
}

impl InternalEvent for VolumeOpened {
    fn emit(self) {
        info!(path = %self.path, cnt_fs_nodes = self.cnt_fs_nodes, "volume opened");
        counter!("cache_fs_volume_opens_total").increment(1);
        gauge!("cache_fs_index_nodes").set(self.cnt_fs_nodes as f64);
    }
}

pub struct VolumeReset {
    pub path: String,
}

impl InternalEvent for VolumeReset {
    fn emit(self) {
        warn!(path = %self.path, "volume metadata unreadable or absent, resetting");
        counter!("cache_fs_volume_resets_total").increment(1);
    }
}

pub struct VolumeClosed {
    pub path: String,
    pub forced: bool,
}

impl InternalEvent for VolumeClosed {
    fn emit(self) {
        info!(path = %self.path, forced = self.forced, "volume closed");
        counter!("cache_fs_volume_closes_total").increment(1);
    }
}

pub struct MetadataSyncFailed {
    pub path: String,
}

impl InternalEvent for MetadataSyncFailed {
    fn emit(self) {
        error!(
            path = %self.path,
            error_type = error_type::IO_FAILED,
            "metadata sync failed"
        );
        counter!("cache_fs_metadata_sync_failures_total").increment(1);
    }
}

pub struct FatalErrorThresholdReached {
    pub path: String,
    pub disk_errors: u32,
}

impl InternalEvent for FatalErrorThresholdReached {
    fn emit(self) {
        error!(
            path = %self.path,
            disk_errors = self.disk_errors,
            error_type = error_type::IO_FAILED,
            "fatal error threshold reached, volume declared bad"
        );
        counter!("cache_fs_fatal_errors_total").increment(1);
    }
}

pub struct OpenRejected {
    pub path: String,
    pub write: bool,
}

impl InternalEvent for OpenRejected {
    fn emit(self) {
        warn!(
            path = %self.path,
            write = self.write,
            error_type = error_type::BUDGET_EXHAUSTED,
            "open rejected: admission queue at capacity"
        );
        counter!("cache_fs_opens_rejected_total").increment(1);
    }
}

pub struct WriteTransactionDenied {
    pub path: String,
}

impl InternalEvent for WriteTransactionDenied {
    fn emit(self) {
        warn!(
            path = %self.path,
            error_type = error_type::BUDGET_EXHAUSTED,
            "write transaction denied: index budget exhausted"
        );
        counter!("cache_fs_write_denied_total").increment(1);
    }
}

pub struct ReadTransactionDenied {
    pub path: String,
}

impl InternalEvent for ReadTransactionDenied {
    fn emit(self) {
        // `trace!`, not `warn!` like its siblings: a requested range not
        // being cached is an ordinary cache miss, not a fault, and happens
        // far too often to log above trace level.
        trace!(path = %self.path, "read transaction denied: range not covered");
        counter!("cache_fs_read_miss_total").increment(1);
    }
}
