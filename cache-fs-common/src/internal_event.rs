//! The `InternalEvent` pattern: a small struct per loggable/measurable
//! occurrence, constructed at the call site and consumed by `emit`, which
//! is free to both log via `tracing` and record via `metrics` in one place.
//! This keeps call sites down to `SomeEvent { .. }.emit()` instead of
//! scattering ad hoc `counter!`/`debug!` calls through the engine.

/// A loggable, measurable occurrence inside the engine.
pub trait InternalEvent {
    fn emit(self);
}

/// Canonical `error_type` label values, passed to `metrics`/`tracing` calls
/// so error counters stay queryable by category across the engine.
pub mod error_type {
    pub const IO_FAILED: &str = "io_failed";
    pub const READER_FAILED: &str = "reader_failed";
    pub const WRITER_FAILED: &str = "writer_failed";
    pub const CORRUPTION: &str = "corruption";
    pub const BUDGET_EXHAUSTED: &str = "budget_exhausted";
}
