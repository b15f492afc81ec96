//! Hooks for surfacing geocoding progress.
//!
//! The pipeline never renders anything itself. An embedding application
//! passes a [`ProgressCallback`] (a terminal bar, a websocket push, a log
//! line) and the processor reports through it.

use std::sync::Arc;

/// Receives progress while records are geocoded.
///
/// Calls come from the processor's batch loop, one per record once its
/// batch has joined; the callback is shared with the spawned pipeline task.
pub trait ProgressCallback: Send + Sync {
    /// Number of records this run will attempt.
    fn set_total(&self, total: u64);

    /// `delta` more records were attempted.
    fn inc(&self, delta: u64);

    /// Short status such as the current batch.
    fn set_message(&self, msg: String);

    /// The run is over; `msg` summarizes it.
    fn finish(&self, msg: String);
}

/// Discards all progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullProgress;

impl ProgressCallback for NullProgress {
    fn set_total(&self, _total: u64) {}
    fn inc(&self, _delta: u64) {}
    fn set_message(&self, _msg: String) {}
    fn finish(&self, _msg: String) {}
}

/// The callback used when none is configured.
#[must_use]
pub fn null_progress() -> Arc<dyn ProgressCallback> {
    Arc::new(NullProgress)
}
