//! Request/response messages exchanged with the remote service.
//!
//! Every [`StoreAdapter`](crate::StoreAdapter) operation has a request
//! variant; the service answers with a [`RemoteResponse`] whose status tells
//! the caller how to classify a failure. Both travel as CBOR.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use driftsync_core::{ApplyOutcome, ChangeBatch, ChangeRecord, Collection, PairId, SyncMarker, Version};

use crate::error::{Result, StoreError};
use crate::traits::Query;

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 0;

/// Message size limits.
pub mod limits {
    /// Max records in one `ApplyChanges` request or one `Changes` response.
    pub const MAX_RECORDS_PER_MESSAGE: usize = 1000;
    /// Max encoded size of any message.
    pub const MAX_MESSAGE_BYTES: usize = 16 * 1024 * 1024;
}

/// A call against the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteRequest {
    Get {
        collection: Collection,
        key: String,
    },
    Set {
        collection: Collection,
        key: String,
        value: Bytes,
    },
    Remove {
        collection: Collection,
        key: String,
    },
    Query {
        collection: Collection,
        query: Query,
    },
    ChangesSince {
        collection: Collection,
        marker: Option<SyncMarker>,
        limit: usize,
    },
    ApplyChanges {
        collection: Collection,
        records: Vec<ChangeRecord>,
    },
    GetMarker {
        pair: PairId,
    },
    SetMarker {
        pair: PairId,
        marker: SyncMarker,
    },
}

impl RemoteRequest {
    /// Short operation name, for logs and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            RemoteRequest::Get { .. } => "get",
            RemoteRequest::Set { .. } => "set",
            RemoteRequest::Remove { .. } => "remove",
            RemoteRequest::Query { .. } => "query",
            RemoteRequest::ChangesSince { .. } => "changes_since",
            RemoteRequest::ApplyChanges { .. } => "apply_changes",
            RemoteRequest::GetMarker { .. } => "get_marker",
            RemoteRequest::SetMarker { .. } => "set_marker",
        }
    }

    /// Check if this request respects size limits.
    pub fn validate_limits(&self) -> std::result::Result<(), &'static str> {
        match self {
            RemoteRequest::ApplyChanges { records, .. } => {
                if records.len() > limits::MAX_RECORDS_PER_MESSAGE {
                    return Err("too many records");
                }
            }
            RemoteRequest::ChangesSince { limit, .. } => {
                if *limit > limits::MAX_RECORDS_PER_MESSAGE {
                    return Err("change page too large");
                }
            }
            _ => {}
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode(bytes)
    }
}

/// Successful response payloads, one per request kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteData {
    Value(Bytes),
    Version(Version),
    Removed(Option<Version>),
    Entries(Vec<(String, Bytes)>),
    Changes(ChangeBatch),
    Outcomes(Vec<ApplyOutcome>),
    Marker(Option<SyncMarker>),
    Ack,
}

impl RemoteData {
    /// Variant name, for "unexpected response" errors.
    pub fn kind(&self) -> &'static str {
        match self {
            RemoteData::Value(_) => "value",
            RemoteData::Version(_) => "version",
            RemoteData::Removed(_) => "removed",
            RemoteData::Entries(_) => "entries",
            RemoteData::Changes(_) => "changes",
            RemoteData::Outcomes(_) => "outcomes",
            RemoteData::Marker(_) => "marker",
            RemoteData::Ack => "ack",
        }
    }
}

/// Response status from the remote service.
///
/// The status, not the message text, decides how the caller classifies a
/// failure: `TransientError` is retried with backoff, `QuotaError` with the
/// capacity delay, `FatalError` never.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteResponse {
    Ok(RemoteData),
    NotFound,
    TransientError(String),
    FatalError(String),
    QuotaError(String),
}

impl RemoteResponse {
    /// Check if this response respects size limits.
    pub fn validate_limits(&self) -> std::result::Result<(), &'static str> {
        match self {
            RemoteResponse::Ok(RemoteData::Changes(batch))
                if batch.records.len() > limits::MAX_RECORDS_PER_MESSAGE =>
            {
                Err("too many records")
            }
            RemoteResponse::Ok(RemoteData::Outcomes(outcomes))
                if outcomes.len() > limits::MAX_RECORDS_PER_MESSAGE =>
            {
                Err("too many outcomes")
            }
            _ => Ok(()),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        decode(bytes)
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| StoreError::Serialization(e.to_string()))?;
    if buf.len() > limits::MAX_MESSAGE_BYTES {
        return Err(StoreError::Malformed(format!(
            "message of {} bytes exceeds {} byte limit",
            buf.len(),
            limits::MAX_MESSAGE_BYTES
        )));
    }
    Ok(buf)
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    if bytes.len() > limits::MAX_MESSAGE_BYTES {
        return Err(StoreError::Malformed(format!(
            "message of {} bytes exceeds {} byte limit",
            bytes.len(),
            limits::MAX_MESSAGE_BYTES
        )));
    }
    ciborium::from_reader(bytes).map_err(|e| StoreError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftsync_core::Origin;

    fn diaries() -> Collection {
        Collection::new("diaries").unwrap()
    }

    #[test]
    fn test_request_limits() {
        let ok = RemoteRequest::ChangesSince {
            collection: diaries(),
            marker: None,
            limit: 100,
        };
        assert!(ok.validate_limits().is_ok());

        let records = (0..=limits::MAX_RECORDS_PER_MESSAGE)
            .map(|i| ChangeRecord::delete(format!("k{i}"), Version(1), Origin::Local))
            .collect();
        let too_many = RemoteRequest::ApplyChanges {
            collection: diaries(),
            records,
        };
        assert!(too_many.validate_limits().is_err());
    }

    #[test]
    fn test_apply_request_survives_cbor() {
        let request = RemoteRequest::ApplyChanges {
            collection: diaries(),
            records: vec![
                ChangeRecord::create("a", b"x".to_vec(), Version(3), Origin::Local),
                ChangeRecord::delete("b", Version(4), Origin::Local),
            ],
        };
        let bytes = request.encode().unwrap();
        assert_eq!(RemoteRequest::decode(&bytes).unwrap(), request);
    }

    #[test]
    fn test_garbage_is_malformed() {
        let err = RemoteResponse::decode(&[0xff, 0x00, 0x13]).unwrap_err();
        assert!(matches!(err, StoreError::Malformed(_)));
    }

    #[test]
    fn test_invalid_collection_rejected_on_decode() {
        #[derive(Serialize)]
        enum Forged {
            Get { collection: String, key: String },
        }
        let mut buf = Vec::new();
        ciborium::into_writer(
            &Forged::Get {
                collection: "no spaces allowed".into(),
                key: "a".into(),
            },
            &mut buf,
        )
        .unwrap();
        assert!(RemoteRequest::decode(&buf).is_err());
    }
}
