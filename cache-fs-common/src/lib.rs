//! Shared conventions used across the `cache_fs` workspace: byte-size
//! accounting and the internal-event/metrics emission pattern.

pub mod byte_size_of;
pub mod internal_event;

pub use byte_size_of::ByteSizeOf;
pub use internal_event::{error_type, InternalEvent};
