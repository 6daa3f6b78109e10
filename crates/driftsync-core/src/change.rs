//! Change records: the unit both stores exchange during sync.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{ErrorClass, Origin, SyncMarker, Version};

/// Kind of mutation a change record carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
        }
    }

    /// Parse the lowercase name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Operation::Create),
            "update" => Some(Operation::Update),
            "delete" => Some(Operation::Delete),
            _ => None,
        }
    }

    /// Whether a payload must accompany this operation.
    pub fn carries_payload(&self) -> bool {
        !matches!(self, Operation::Delete)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One mutation to a single key within a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// Key, unique within the collection.
    pub key: String,
    /// What happened to the key.
    pub operation: Operation,
    /// New value for create/update; `None` for delete.
    pub payload: Option<Bytes>,
    /// Version assigned by the origin store.
    pub version: Version,
    /// Store that produced the change.
    pub origin: Origin,
}

impl ChangeRecord {
    /// A create record.
    pub fn create(key: impl Into<String>, payload: impl Into<Bytes>, version: Version, origin: Origin) -> Self {
        Self {
            key: key.into(),
            operation: Operation::Create,
            payload: Some(payload.into()),
            version,
            origin,
        }
    }

    /// An update record.
    pub fn update(key: impl Into<String>, payload: impl Into<Bytes>, version: Version, origin: Origin) -> Self {
        Self {
            key: key.into(),
            operation: Operation::Update,
            payload: Some(payload.into()),
            version,
            origin,
        }
    }

    /// A delete record.
    pub fn delete(key: impl Into<String>, version: Version, origin: Origin) -> Self {
        Self {
            key: key.into(),
            operation: Operation::Delete,
            payload: None,
            version,
            origin,
        }
    }

    /// The `(version, origin)` stamp used by the conflict rule.
    pub fn stamp(&self) -> (Version, Origin) {
        (self.version, self.origin)
    }

    /// Payload size in bytes (zero for deletes).
    pub fn payload_len(&self) -> usize {
        self.payload.as_ref().map(|p| p.len()).unwrap_or(0)
    }
}

/// One page of a store's change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeBatch {
    /// Records ordered by change-log position.
    pub records: Vec<ChangeRecord>,
    /// Marker covering everything in `records` (and anything skipped before
    /// them). Equal to the input marker when nothing new exists.
    pub next_marker: Option<SyncMarker>,
    /// Whether more records exist past `next_marker`.
    pub has_more: bool,
}

impl ChangeBatch {
    /// A batch with nothing new.
    pub fn empty(marker: Option<SyncMarker>) -> Self {
        Self {
            records: Vec::new(),
            next_marker: marker,
            has_more: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Result of applying one record on the receiving store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyOutcome {
    /// The record was newer and is now stored.
    Applied,
    /// Same version and origin already applied; nothing changed.
    Duplicate,
    /// A newer write already holds the key; the record lost the conflict.
    Superseded {
        /// Version currently stored for the key.
        current: Version,
    },
    /// The record could not be applied.
    Failed {
        /// Retry class of the failure.
        class: ErrorClass,
        /// Human-readable cause.
        reason: String,
    },
}

impl ApplyOutcome {
    /// Whether the record is durably reflected (or intentionally discarded)
    /// on the receiving side.
    pub fn is_settled(&self) -> bool {
        !matches!(self, ApplyOutcome::Failed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors() {
        let c = ChangeRecord::create("k", b"v".to_vec(), Version(1), Origin::Local);
        assert_eq!(c.operation, Operation::Create);
        assert_eq!(c.payload_len(), 1);

        let d = ChangeRecord::delete("k", Version(2), Origin::Remote);
        assert!(d.payload.is_none());
        assert_eq!(d.stamp(), (Version(2), Origin::Remote));
    }

    #[test]
    fn test_operation_names() {
        for op in [Operation::Create, Operation::Update, Operation::Delete] {
            assert_eq!(Operation::parse(op.as_str()), Some(op));
        }
        assert!(!Operation::Delete.carries_payload());
    }

    #[test]
    fn test_outcome_settled() {
        assert!(ApplyOutcome::Applied.is_settled());
        assert!(ApplyOutcome::Superseded { current: Version(3) }.is_settled());
        assert!(!ApplyOutcome::Failed {
            class: ErrorClass::Capacity,
            reason: "full".into()
        }
        .is_settled());
    }
}
