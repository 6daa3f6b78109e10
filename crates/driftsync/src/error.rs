//! Error types for the scheduler.

use driftsync_core::Collection;
use thiserror::Error;

/// Errors returned by [`SyncScheduler`](crate::SyncScheduler) calls.
///
/// Task failures are not errors of the scheduler; they are recorded on the
/// task and published as events.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The task spec was rejected.
    #[error("invalid task spec: {0}")]
    InvalidSpec(String),

    /// No sync pair is registered for the collection.
    #[error("no sync pair registered for collection {0}")]
    UnknownCollection(Collection),

    /// Policy failed validation or could not be parsed.
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    /// The scheduler has shut down.
    #[error("scheduler is shut down")]
    Closed,
}

/// Result type for scheduler operations.
pub type Result<T> = std::result::Result<T, SchedulerError>;
