//! Error types for driftsync core.

use thiserror::Error;

/// Core errors raised while building or decoding model values.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid collection name: {0}")]
    InvalidCollection(String),

    #[error("decoding error: {0}")]
    DecodingError(String),
}

/// Validation errors for change records.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("key must not be empty")]
    EmptyKey,

    #[error("key exceeds maximum length of {max} bytes (got {len})")]
    KeyTooLong { len: usize, max: usize },

    #[error("version must be greater than zero")]
    ZeroVersion,

    #[error("version {0} exceeds the largest storable version")]
    VersionOutOfRange(u64),

    #[error("{operation} record for key {key:?} is missing its payload")]
    MissingPayload { key: String, operation: String },

    #[error("delete record for key {0:?} must not carry a payload")]
    UnexpectedPayload(String),
}
