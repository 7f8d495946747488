//! `cache_fs`: a log-structured, per-volume object cache engine.
//!
//! One [`orchestrator::CacheFs`] instance owns everything a single physical
//! volume needs: its fragment index (`index`), its double-buffered
//! metadata (`metadata`), its 1 MiB aggregate write block and writer task
//! (`aggregate`), its AIO worker pools (`aio`), and the read/write handles
//! (`handles`) clients drive. Module layout follows
//! `vector_buffers::disk_v2`: one file per concern, `snafu` error enums per
//! component boundary (`error`), `tracing` instrumentation on the async
//! entry points, and `metrics` counters/gauges emitted through
//! `internal_events` the way `vector_buffers::internal_events` does.
//!
//! This crate stores byte ranges, not objects: it has no notion of HTTP
//! headers, URLs, or cache-control semantics. Callers derive an
//! [`key::ObjectKey`] themselves (typically the MD5 of a canonical URL) and
//! deal in `(key, logical byte range)` pairs.

pub mod aggregate;
pub mod aio;
pub mod config;
pub mod error;
pub mod handles;
pub mod index;
pub mod internal_events;
pub mod key;
pub mod metadata;
pub mod orchestrator;
pub mod range;
pub mod record;
pub mod skip_copy;
pub mod stats;
pub mod volume;

pub use config::{VolumeConfig, VolumeConfigBuilder};
pub use error::{BuildError, HandleError, MetadataError, OpenError, VolumeError};
pub use handles::{ReadHandle, WriteHandle};
pub use key::ObjectKey;
pub use orchestrator::{CacheFs, OnFsBadCb};
pub use range::Range;
pub use stats::{StatsFs, StatsInternal};
