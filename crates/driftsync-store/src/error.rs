//! Error types for the store module.

use driftsync_core::{CoreError, ErrorClass, ValidationError};
use rusqlite::ErrorCode;
use thiserror::Error;

/// Errors that can occur during store operations.
///
/// Every variant has a retry class (see [`StoreError::class`]); adapters are
/// responsible for mapping raw failures onto the right variant.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Value or marker could not be encoded/decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The call did not complete in time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Connection dropped, unreachable host, or similar.
    #[error("transport error: {0}")]
    Transport(String),

    /// Credentials were rejected but may be refreshed.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The caller is not allowed to perform the operation.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The peer sent, or was sent, something it could not interpret.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// A change record failed structural validation.
    #[error("invalid record: {0}")]
    Validation(#[from] ValidationError),

    /// Capacity ceiling or remote quota exceeded.
    #[error("quota exceeded: {0}")]
    Quota(String),

    /// Schema migration failed.
    #[error("migration error: {0}")]
    Migration(String),

    /// The store is temporarily unusable (poisoned lock, worker gone).
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Retry class of this failure.
    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::Timeout(_)
            | StoreError::Transport(_)
            | StoreError::Authentication(_)
            | StoreError::Unavailable(_) => ErrorClass::Transient,
            StoreError::Quota(_) => ErrorClass::Capacity,
            StoreError::Unauthorized(_)
            | StoreError::Malformed(_)
            | StoreError::Validation(_)
            | StoreError::Serialization(_)
            | StoreError::Migration(_) => ErrorClass::Fatal,
            StoreError::Database(e) => classify_sqlite(e),
        }
    }

    /// Whether this is an authentication failure, which is retried under its
    /// own, usually tighter, limit.
    pub fn is_authentication(&self) -> bool {
        matches!(self, StoreError::Authentication(_))
    }
}

fn classify_sqlite(e: &rusqlite::Error) -> ErrorClass {
    match e {
        rusqlite::Error::SqliteFailure(err, _) => match err.code {
            ErrorCode::DiskFull => ErrorClass::Capacity,
            ErrorCode::DatabaseCorrupt | ErrorCode::NotADatabase => ErrorClass::Fatal,
            _ => ErrorClass::Transient,
        },
        rusqlite::Error::FromSqlConversionFailure(..) | rusqlite::Error::InvalidColumnType(..) => {
            ErrorClass::Fatal
        }
        _ => ErrorClass::Transient,
    }
}

impl From<CoreError> for StoreError {
    fn from(e: CoreError) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
