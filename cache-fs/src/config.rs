//! Volume configuration (sizes, thresholds, flush interval), built with a
//! `vector_buffers::disk_v2::common::DiskBufferConfigBuilder`-style builder:
//! one setter per field, `build()` returning a `BuildError` taxonomy
//! instead of panicking on bad values.

use std::path::PathBuf;
use std::time::Duration;

use snafu::ensure;

use crate::error::{BuildError, InvalidParameterSnafu};

/// Default size of one aggregate write block (§3 C4).
pub const DEFAULT_AGG_WRITE_BLOCK_SIZE: u64 = 1024 * 1024;
/// Default size of the aggregate block's metadata header (§3 C4).
pub const DEFAULT_AGG_META_SIZE: u64 = 4096;
/// Default logical sector / store block size (§4.1, §6).
pub const DEFAULT_STORE_BLOCK_SIZE: u32 = 4096;
/// Default floor used to size the index's memory ceiling (§4.2).
pub const DEFAULT_MIN_AVG_OBJ_SIZE: u32 = 8192;
/// Default bound on pending opens per queue (§4.7, §8 S5).
pub const DEFAULT_OPEN_QUEUE_DEPTH: usize = 56;
/// Cumulative disk failures before the volume is declared fatally bad
/// (§4.7, §7).
pub const DEFAULT_FATAL_ERROR_THRESHOLD: u32 = 5;
/// Default interval between periodic metadata syncs (§4.7).
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(10);
/// Default reserved, unused header area at the start of the volume (§6).
pub const DEFAULT_SKIP_BYTES: u64 = 0;
/// Default maximum size of one serialized metadata slot (§6). Sized
/// generously; `metadata::encode_slot` asserts rather than truncates if the
/// table ever grows past this.
pub const DEFAULT_MD_SLOT_SIZE: u64 = 1024 * 1024;
/// Default cap on one write fragment's staged payload (§4.4
/// `object_frag_max_data_size`). Must never exceed the aggregate block's
/// payload capacity, or a freshly flushed (empty) block could never fit a
/// single fragment; `build()` enforces this.
pub const DEFAULT_FRAG_MAX_DATA_SIZE: u64 = 64 * 1024;

/// Fully validated configuration for one volume. Constructed only via
/// [`VolumeConfigBuilder::build`].
#[derive(Clone, Debug)]
pub struct VolumeConfig {
    pub path: PathBuf,
    pub agg_write_block_size: u64,
    pub agg_meta_size: u64,
    pub store_block_size: u32,
    pub min_avg_obj_size: u32,
    pub open_queue_depth: usize,
    pub fatal_error_threshold: u32,
    pub flush_interval: Duration,
    pub skip_bytes: u64,
    pub md_slot_size: u64,
    pub frag_max_data_size: u64,
}

/// Builder for [`VolumeConfig`]. Every setter takes `mut self` and returns
/// `Self`, matching the teacher's `DiskBufferConfigBuilder` chaining style.
#[derive(Clone, Debug)]
pub struct VolumeConfigBuilder {
    path: PathBuf,
    agg_write_block_size: u64,
    agg_meta_size: u64,
    store_block_size: u32,
    min_avg_obj_size: u32,
    open_queue_depth: usize,
    fatal_error_threshold: u32,
    flush_interval: Duration,
    skip_bytes: u64,
    md_slot_size: u64,
    frag_max_data_size: u64,
}

impl VolumeConfigBuilder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            agg_write_block_size: DEFAULT_AGG_WRITE_BLOCK_SIZE,
            agg_meta_size: DEFAULT_AGG_META_SIZE,
            store_block_size: DEFAULT_STORE_BLOCK_SIZE,
            min_avg_obj_size: DEFAULT_MIN_AVG_OBJ_SIZE,
            open_queue_depth: DEFAULT_OPEN_QUEUE_DEPTH,
            fatal_error_threshold: DEFAULT_FATAL_ERROR_THRESHOLD,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            skip_bytes: DEFAULT_SKIP_BYTES,
            md_slot_size: DEFAULT_MD_SLOT_SIZE,
            frag_max_data_size: DEFAULT_FRAG_MAX_DATA_SIZE,
        }
    }

    pub fn agg_write_block_size(mut self, v: u64) -> Self {
        self.agg_write_block_size = v;
        self
    }

    pub fn agg_meta_size(mut self, v: u64) -> Self {
        self.agg_meta_size = v;
        self
    }

    pub fn store_block_size(mut self, v: u32) -> Self {
        self.store_block_size = v;
        self
    }

    pub fn min_avg_obj_size(mut self, v: u32) -> Self {
        self.min_avg_obj_size = v;
        self
    }

    pub fn open_queue_depth(mut self, v: usize) -> Self {
        self.open_queue_depth = v;
        self
    }

    pub fn fatal_error_threshold(mut self, v: u32) -> Self {
        self.fatal_error_threshold = v;
        self
    }

    pub fn flush_interval(mut self, v: Duration) -> Self {
        self.flush_interval = v;
        self
    }

    pub fn skip_bytes(mut self, v: u64) -> Self {
        self.skip_bytes = v;
        self
    }

    pub fn md_slot_size(mut self, v: u64) -> Self {
        self.md_slot_size = v;
        self
    }

    pub fn frag_max_data_size(mut self, v: u64) -> Self {
        self.frag_max_data_size = v;
        self
    }

    pub fn build(self) -> Result<VolumeConfig, BuildError> {
        ensure!(
            self.store_block_size.is_power_of_two(),
            InvalidParameterSnafu {
                param_name: "store_block_size",
                reason: "must be a power of two".to_string(),
            }
        );
        ensure!(
            self.agg_write_block_size % u64::from(self.store_block_size) == 0,
            InvalidParameterSnafu {
                param_name: "agg_write_block_size",
                reason: "must be a multiple of store_block_size".to_string(),
            }
        );
        ensure!(
            self.agg_meta_size < self.agg_write_block_size,
            InvalidParameterSnafu {
                param_name: "agg_meta_size",
                reason: "must be smaller than agg_write_block_size".to_string(),
            }
        );
        ensure!(
            self.agg_meta_size % u64::from(self.store_block_size) == 0,
            InvalidParameterSnafu {
                param_name: "agg_meta_size",
                reason: "must be a multiple of store_block_size".to_string(),
            }
        );
        ensure!(
            self.min_avg_obj_size > 0,
            InvalidParameterSnafu {
                param_name: "min_avg_obj_size",
                reason: "must be greater than zero".to_string(),
            }
        );
        ensure!(
            self.open_queue_depth > 0,
            InvalidParameterSnafu {
                param_name: "open_queue_depth",
                reason: "must be greater than zero".to_string(),
            }
        );
        ensure!(
            self.fatal_error_threshold > 0,
            InvalidParameterSnafu {
                param_name: "fatal_error_threshold",
                reason: "must be greater than zero".to_string(),
            }
        );
        ensure!(
            self.md_slot_size % u64::from(self.store_block_size) == 0,
            InvalidParameterSnafu {
                param_name: "md_slot_size",
                reason: "must be a multiple of store_block_size".to_string(),
            }
        );
        ensure!(
            self.skip_bytes % u64::from(self.store_block_size) == 0,
            InvalidParameterSnafu {
                param_name: "skip_bytes",
                reason: "must be a multiple of store_block_size".to_string(),
            }
        );
        ensure!(
            self.frag_max_data_size > 0
                && self.frag_max_data_size <= self.agg_write_block_size - self.agg_meta_size,
            InvalidParameterSnafu {
                param_name: "frag_max_data_size",
                reason: "must be greater than zero and fit a single aggregate block's payload"
                    .to_string(),
            }
        );

        Ok(VolumeConfig {
            path: self.path,
            agg_write_block_size: self.agg_write_block_size,
            agg_meta_size: self.agg_meta_size,
            store_block_size: self.store_block_size,
            min_avg_obj_size: self.min_avg_obj_size,
            open_queue_depth: self.open_queue_depth,
            fatal_error_threshold: self.fatal_error_threshold,
            flush_interval: self.flush_interval,
            skip_bytes: self.skip_bytes,
            md_slot_size: self.md_slot_size,
            frag_max_data_size: self.frag_max_data_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_builds() {
        VolumeConfigBuilder::new("/tmp/vol").build().unwrap();
    }

    #[test]
    fn rejects_non_power_of_two_store_block() {
        let err = VolumeConfigBuilder::new("/tmp/vol")
            .store_block_size(1000)
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::InvalidParameter { param_name, .. } if param_name == "store_block_size"));
    }

    #[test]
    fn rejects_agg_meta_size_not_smaller_than_block() {
        let err = VolumeConfigBuilder::new("/tmp/vol")
            .agg_meta_size(2 * DEFAULT_AGG_WRITE_BLOCK_SIZE)
            .build()
            .unwrap_err();
        assert!(matches!(err, BuildError::InvalidParameter { param_name, .. } if param_name == "agg_meta_size"));
    }
}
