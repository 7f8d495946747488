//! Error taxonomy (§7). One `Snafu` enum per component boundary, the way
//! `vector_buffers::disk_v2` keeps a `WriterError`/`ReaderError`/`BufferError`
//! per module rather than one crate-wide error type.

use snafu::Snafu;

/// Errors surfaced on a read or write handle (§6, §7). These are the only
/// error categories the public API returns to a caller directly; I/O
/// errors encountered by the aggregate writer or the metadata-sync task are
/// routed through the fatal-error counter instead (§7 propagation policy).
#[derive(Debug, Snafu)]
pub enum HandleError {
    /// The handle was closed (explicitly, or due to a pending close)
    /// while an operation was in flight.
    #[snafu(display("operation aborted"))]
    OperationAborted,

    /// The client supplied more bytes than the write transaction's
    /// declared range.
    #[snafu(display("unexpected data past end of declared range"))]
    UnexpectedData,

    /// The enclosing AIO service stopped while this handle was alive.
    #[snafu(display("service stopped"))]
    ServiceStopped,

    /// A positioned read returned zero bytes before the requested length
    /// was satisfied.
    #[snafu(display("unexpected eof"))]
    Eof,

    /// A positioned write returned zero bytes written.
    #[snafu(display("null write"))]
    NullWrite,

    /// Any other I/O failure from the volume handle. Only ever constructed
    /// via the `From` impls below, never `.context(..)`, since `VolumeError`
    /// already owns the `IoSnafu` selector for the underlying `io::Error`.
    #[snafu(display("io error: {source}"), context(false))]
    Io { source: std::io::Error },

    /// A fragment's payload failed its checksum on read (§4.6, §7).
    #[snafu(display("checksum mismatch: calculated {calculated:#x}, expected {expected:#x}"))]
    Corrupted { calculated: u32, expected: u32 },
}

impl From<std::io::Error> for HandleError {
    fn from(source: std::io::Error) -> Self {
        HandleError::Io { source }
    }
}

/// Errors from the volume handle itself (C1). `HandleError` wraps these for
/// the handle-facing surface; `orchestrator.rs` also consumes these
/// directly when deciding whether to bump the fatal-error counter.
#[derive(Debug, Snafu)]
pub enum VolumeError {
    #[snafu(display("unexpected eof reading {requested} bytes at offset {offset}"))]
    Eof { offset: u64, requested: usize },

    #[snafu(display("null write of {requested} bytes at offset {offset}"))]
    NullWrite { offset: u64, requested: usize },

    #[snafu(display("io error at offset {offset}: {source}"))]
    Io {
        offset: u64,
        source: std::io::Error,
    },
}

impl From<VolumeError> for HandleError {
    fn from(e: VolumeError) -> Self {
        match e {
            VolumeError::Eof { .. } => HandleError::Eof,
            VolumeError::NullWrite { .. } => HandleError::NullWrite,
            VolumeError::Io { source, .. } => HandleError::Io { source },
        }
    }
}

/// Errors from loading or building the FS-Metadata (C3) at startup.
#[derive(Debug, Snafu)]
pub enum MetadataError {
    #[snafu(display("metadata slot has an invalid header magic"))]
    BadHeaderMagic,

    #[snafu(display("metadata slot has an invalid footer magic"))]
    BadFooterMagic,

    #[snafu(display("metadata write head {write_pos} is outside the data region [{data_start}, {data_end})"))]
    WriteHeadOutOfRange {
        write_pos: u64,
        data_start: u64,
        data_end: u64,
    },

    #[snafu(display("truncated or corrupt fragment index entry"))]
    TruncatedTable,
}

/// Errors constructing a [`crate::config::VolumeConfig`].
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum BuildError {
    #[snafu(display("invalid value for parameter {param_name}: {reason}"))]
    InvalidParameter {
        param_name: &'static str,
        reason: String,
    },
}

/// Errors from bringing up a volume (C7 `CacheFs::open`/`reset_volume`).
#[derive(Debug, Snafu)]
pub enum OpenError {
    #[snafu(display("failed to acquire exclusive lock on volume: {source}"))]
    Lock { source: std::io::Error },

    #[snafu(display("volume is already open by another process"))]
    AlreadyOpen,

    #[snafu(display("failed to open volume file: {source}"))]
    VolumeOpen { source: std::io::Error },

    #[snafu(display("metadata error: {source}"))]
    Metadata { source: MetadataError },

    #[snafu(display("volume io error: {source}"))]
    VolumeIo { source: VolumeError },

    #[snafu(display("volume is too small to hold a header and at least one data block"))]
    VolumeTooSmall,
}

impl From<MetadataError> for OpenError {
    fn from(source: MetadataError) -> Self {
        OpenError::Metadata { source }
    }
}

impl From<VolumeError> for OpenError {
    fn from(source: VolumeError) -> Self {
        OpenError::VolumeIo { source }
    }
}
