//! Error types for the sync module.

use driftsync_core::ErrorClass;
use driftsync_store::StoreError;
use thiserror::Error;

/// Errors that can occur during a pull or push cycle.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A store call failed; the store already classified it.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A store call did not complete within the pair's call timeout.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Some records in a batch could not be applied. The marker was not
    /// advanced, so the whole batch is fetched again on the next run.
    #[error("partial apply: {failed} of {total} records failed ({class}): {reason}")]
    PartialApply {
        failed: usize,
        total: usize,
        /// Most severe class among the failed records.
        class: ErrorClass,
        /// Reason given for the first failed record.
        reason: String,
    },

    /// The two stores cannot form a pair.
    #[error("invalid pair: {0}")]
    InvalidPair(String),

    /// Sync was cancelled at a checkpoint between batches.
    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Retry class, or `None` for cancellation, which is not a failure.
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            SyncError::Store(e) => Some(e.class()),
            SyncError::Timeout(_) => Some(ErrorClass::Transient),
            SyncError::PartialApply { class, .. } => Some(*class),
            SyncError::InvalidPair(_) => Some(ErrorClass::Fatal),
            SyncError::Cancelled => None,
        }
    }

    /// Whether the failure was an authentication rejection.
    pub fn is_authentication(&self) -> bool {
        matches!(self, SyncError::Store(e) if e.is_authentication())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
