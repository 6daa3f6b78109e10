//! Structural checks for change records.
//!
//! A record that fails validation is a malformed payload: stores reject it
//! with a fatal classification and it is never retried.

use crate::change::ChangeRecord;
use crate::error::ValidationError;
use crate::types::Version;

/// Maximum key length in bytes.
pub const MAX_KEY_LEN: usize = 512;

/// Largest version a store can hold; SQLite integers are signed 64-bit.
pub const MAX_VERSION: Version = Version(i64::MAX as u64);

/// Validate a key.
pub fn validate_key(key: &str) -> Result<(), ValidationError> {
    if key.is_empty() {
        return Err(ValidationError::EmptyKey);
    }
    if key.len() > MAX_KEY_LEN {
        return Err(ValidationError::KeyTooLong {
            len: key.len(),
            max: MAX_KEY_LEN,
        });
    }
    Ok(())
}

/// Validate a change record's structure.
///
/// Checks:
/// - Key is non-empty and within [`MAX_KEY_LEN`]
/// - Version is non-zero and at most [`MAX_VERSION`]
/// - Create/update carry a payload, delete does not
pub fn validate_change_record(record: &ChangeRecord) -> Result<(), ValidationError> {
    validate_key(&record.key)?;

    if record.version == Version::ZERO {
        return Err(ValidationError::ZeroVersion);
    }
    if record.version > MAX_VERSION {
        return Err(ValidationError::VersionOutOfRange(record.version.0));
    }

    match (record.operation.carries_payload(), record.payload.is_some()) {
        (true, false) => Err(ValidationError::MissingPayload {
            key: record.key.clone(),
            operation: record.operation.to_string(),
        }),
        (false, true) => Err(ValidationError::UnexpectedPayload(record.key.clone())),
        _ => Ok(()),
    }
}
