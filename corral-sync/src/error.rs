//! `corral-sync` error types.

use thiserror::Error;

/// Errors raised by channels, work queues, the mutex/barrier and `MapPool`.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Wraps a codec/ring failure from `corral-core`.
    #[error(transparent)]
    Core(#[from] corral_core::error::CoreError),

    /// A `WorkQueue::drain` or similar owner-only operation was called from
    /// a non-owner thread.
    #[error("operation is only available on the workqueue's owner thread")]
    NotOwner,

    /// At least one `MapPool` worker returned an error; carries the first
    /// such error's message, matching the original's "name the first
    /// failing worker's error string" behavior.
    #[error("worker failed: {0}")]
    WorkerFailed(String),

    /// A worker thread panicked instead of returning an error value.
    #[error("worker thread panicked: {0}")]
    WorkerPanicked(String),
}

/// Result alias for `corral-sync` operations.
pub type Result<T> = std::result::Result<T, SyncError>;
