//! Progress reporting for ingestion runs.
//!
//! Defines a [`ProgressCallback`] trait that decouples page-level progress
//! from any rendering backend. The CLI renders it with `indicatif`; the
//! server and tests use [`NullProgress`].

use std::sync::Arc;

/// Receives page-level progress from the pagination driver and item-level
/// progress from the file worker.
///
/// Implementations must be `Send + Sync` so one instance can be shared
/// across spawned tasks.
pub trait ProgressCallback: Send + Sync {
    /// Total pages (or items) expected, once the source reports it.
    fn set_total(&self, total: u64);

    /// A unit of work (one page, one file) finished.
    fn inc(&self, delta: u64);

    /// Updates the message shown alongside the indicator.
    fn set_message(&self, msg: String);

    /// Marks the run as finished with a summary.
    fn finish(&self, msg: String);
}

/// Ignores all progress updates.
pub struct NullProgress;

impl ProgressCallback for NullProgress {
    fn set_total(&self, _total: u64) {}
    fn inc(&self, _delta: u64) {}
    fn set_message(&self, _msg: String) {}
    fn finish(&self, _msg: String) {}
}

/// Returns a shared [`NullProgress`] instance.
#[must_use]
pub fn null_progress() -> Arc<dyn ProgressCallback> {
    Arc::new(NullProgress)
}
