//! Remote store: a StoreAdapter realized as requests to an external service.
//!
//! The service itself is behind the [`RemoteService`] trait. Implementations
//! may use HTTP, WebSockets, or any other transport; they only need to map
//! their status codes onto [`RemoteResponse`].

use async_trait::async_trait;
use bytes::Bytes;
use tracing::trace;

use driftsync_core::{
    ApplyOutcome, ChangeBatch, ChangeRecord, Collection, Origin, PairId, SyncMarker, Version,
};

use crate::error::{Result, StoreError};
use crate::messages::{limits, RemoteData, RemoteRequest, RemoteResponse};
use crate::traits::{Query, StoreAdapter};

/// Transport to the remote service.
///
/// Implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Perform one request. Transport failures are reported in-band as
    /// [`RemoteResponse::TransientError`].
    async fn call(&self, request: RemoteRequest) -> RemoteResponse;
}

#[async_trait]
impl<T: RemoteService + ?Sized> RemoteService for std::sync::Arc<T> {
    async fn call(&self, request: RemoteRequest) -> RemoteResponse {
        (**self).call(request).await
    }
}

/// StoreAdapter over a [`RemoteService`].
///
/// Classifies every non-success status into a [`StoreError`]:
/// `TransientError` becomes [`StoreError::Transport`], `QuotaError`
/// becomes [`StoreError::Quota`], and `FatalError` or a response that does
/// not fit the request becomes [`StoreError::Malformed`].
pub struct RemoteStore<S> {
    service: S,
}

impl<S: RemoteService> RemoteStore<S> {
    pub fn new(service: S) -> Self {
        Self { service }
    }

    /// The underlying service.
    pub fn service(&self) -> &S {
        &self.service
    }

    /// Send a request; `Ok(None)` means not found.
    async fn call(&self, request: RemoteRequest) -> Result<Option<RemoteData>> {
        let op = request.name();
        request
            .validate_limits()
            .map_err(|e| StoreError::Malformed(format!("{op}: {e}")))?;

        let response = self.service.call(request).await;
        trace!(op, ?response, "remote call");

        response
            .validate_limits()
            .map_err(|e| StoreError::Malformed(format!("{op}: {e}")))?;

        match response {
            RemoteResponse::Ok(data) => Ok(Some(data)),
            RemoteResponse::NotFound => Ok(None),
            RemoteResponse::TransientError(msg) => Err(StoreError::Transport(format!("{op}: {msg}"))),
            RemoteResponse::FatalError(msg) => Err(StoreError::Malformed(format!("{op}: {msg}"))),
            RemoteResponse::QuotaError(msg) => Err(StoreError::Quota(format!("{op}: {msg}"))),
        }
    }
}

fn unexpected(op: &str, data: Option<RemoteData>) -> StoreError {
    let kind = data.as_ref().map(RemoteData::kind).unwrap_or("not-found");
    StoreError::Malformed(format!("{op}: unexpected {kind} response"))
}

#[async_trait]
impl<S: RemoteService> StoreAdapter for RemoteStore<S> {
    fn origin(&self) -> Origin {
        Origin::Remote
    }

    async fn get(&self, collection: &Collection, key: &str) -> Result<Option<Bytes>> {
        let request = RemoteRequest::Get {
            collection: collection.clone(),
            key: key.to_owned(),
        };
        match self.call(request).await? {
            Some(RemoteData::Value(value)) => Ok(Some(value)),
            None => Ok(None),
            other => Err(unexpected("get", other)),
        }
    }

    async fn set(&self, collection: &Collection, key: &str, value: Bytes) -> Result<Version> {
        let request = RemoteRequest::Set {
            collection: collection.clone(),
            key: key.to_owned(),
            value,
        };
        match self.call(request).await? {
            Some(RemoteData::Version(version)) => Ok(version),
            other => Err(unexpected("set", other)),
        }
    }

    async fn remove(&self, collection: &Collection, key: &str) -> Result<Option<Version>> {
        let request = RemoteRequest::Remove {
            collection: collection.clone(),
            key: key.to_owned(),
        };
        match self.call(request).await? {
            Some(RemoteData::Removed(version)) => Ok(version),
            None => Ok(None),
            other => Err(unexpected("remove", other)),
        }
    }

    async fn query(&self, collection: &Collection, query: &Query) -> Result<Vec<(String, Bytes)>> {
        let request = RemoteRequest::Query {
            collection: collection.clone(),
            query: query.clone(),
        };
        match self.call(request).await? {
            Some(RemoteData::Entries(entries)) => Ok(entries),
            None => Ok(Vec::new()),
            other => Err(unexpected("query", other)),
        }
    }

    async fn changes_since(
        &self,
        collection: &Collection,
        marker: Option<SyncMarker>,
        limit: usize,
    ) -> Result<ChangeBatch> {
        let request = RemoteRequest::ChangesSince {
            collection: collection.clone(),
            marker,
            limit: limit.min(limits::MAX_RECORDS_PER_MESSAGE),
        };
        match self.call(request).await? {
            Some(RemoteData::Changes(batch)) => Ok(batch),
            None => Ok(ChangeBatch::empty(marker)),
            other => Err(unexpected("changes_since", other)),
        }
    }

    async fn apply_changes(
        &self,
        collection: &Collection,
        records: &[ChangeRecord],
    ) -> Result<Vec<ApplyOutcome>> {
        let mut outcomes = Vec::with_capacity(records.len());

        for chunk in records.chunks(limits::MAX_RECORDS_PER_MESSAGE) {
            let request = RemoteRequest::ApplyChanges {
                collection: collection.clone(),
                records: chunk.to_vec(),
            };
            match self.call(request).await? {
                Some(RemoteData::Outcomes(chunk_outcomes)) if chunk_outcomes.len() == chunk.len() => {
                    outcomes.extend(chunk_outcomes);
                }
                Some(RemoteData::Outcomes(chunk_outcomes)) => {
                    return Err(StoreError::Malformed(format!(
                        "apply_changes: {} outcomes for {} records",
                        chunk_outcomes.len(),
                        chunk.len()
                    )));
                }
                other => return Err(unexpected("apply_changes", other)),
            }
        }

        Ok(outcomes)
    }

    async fn get_marker(&self, pair: &PairId) -> Result<Option<SyncMarker>> {
        match self.call(RemoteRequest::GetMarker { pair: *pair }).await? {
            Some(RemoteData::Marker(marker)) => Ok(marker),
            None => Ok(None),
            other => Err(unexpected("get_marker", other)),
        }
    }

    async fn set_marker(&self, pair: &PairId, marker: SyncMarker) -> Result<()> {
        match self
            .call(RemoteRequest::SetMarker { pair: *pair, marker })
            .await?
        {
            Some(RemoteData::Ack) => Ok(()),
            other => Err(unexpected("set_marker", other)),
        }
    }
}

/// An in-process remote service for testing.
///
/// Backed by a [`MemoryStore`](crate::MemoryStore) with origin
/// [`Origin::Remote`]. Requests and responses are pushed through CBOR so the
/// wire encoding is exercised, and the service can be taken offline.
pub mod memory {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;

    use driftsync_core::ErrorClass;

    use crate::memory::MemoryStore;

    /// In-memory remote service implementation.
    pub struct MemoryService {
        store: Arc<MemoryStore>,
        online: AtomicBool,
        calls: AtomicU64,
    }

    impl MemoryService {
        /// Create an online service over an empty store.
        pub fn new() -> Self {
            Self::with_store(Arc::new(MemoryStore::new(Origin::Remote)))
        }

        /// Create an online service over an existing store.
        pub fn with_store(store: Arc<MemoryStore>) -> Self {
            Self {
                store,
                online: AtomicBool::new(true),
                calls: AtomicU64::new(0),
            }
        }

        /// Direct access to the backing store, bypassing the wire.
        pub fn store(&self) -> &Arc<MemoryStore> {
            &self.store
        }

        /// Simulate losing or regaining connectivity.
        pub fn set_online(&self, online: bool) {
            self.online.store(online, Ordering::SeqCst);
        }

        pub fn is_online(&self) -> bool {
            self.online.load(Ordering::SeqCst)
        }

        /// Number of requests received, including ones rejected while offline.
        pub fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }

        async fn dispatch(&self, request: RemoteRequest) -> Result<Option<RemoteData>> {
            let store = &self.store;
            let data = match request {
                RemoteRequest::Get { collection, key } => {
                    return Ok(store.get(&collection, &key).await?.map(RemoteData::Value));
                }
                RemoteRequest::Set {
                    collection,
                    key,
                    value,
                } => RemoteData::Version(store.set(&collection, &key, value).await?),
                RemoteRequest::Remove { collection, key } => {
                    RemoteData::Removed(store.remove(&collection, &key).await?)
                }
                RemoteRequest::Query { collection, query } => {
                    RemoteData::Entries(store.query(&collection, &query).await?)
                }
                RemoteRequest::ChangesSince {
                    collection,
                    marker,
                    limit,
                } => RemoteData::Changes(store.changes_since(&collection, marker, limit).await?),
                RemoteRequest::ApplyChanges {
                    collection,
                    records,
                } => RemoteData::Outcomes(store.apply_changes(&collection, &records).await?),
                RemoteRequest::GetMarker { pair } => RemoteData::Marker(store.get_marker(&pair).await?),
                RemoteRequest::SetMarker { pair, marker } => {
                    store.set_marker(&pair, marker).await?;
                    RemoteData::Ack
                }
            };
            Ok(Some(data))
        }
    }

    impl Default for MemoryService {
        fn default() -> Self {
            Self::new()
        }
    }

    fn to_response(result: Result<Option<RemoteData>>) -> RemoteResponse {
        match result {
            Ok(Some(data)) => RemoteResponse::Ok(data),
            Ok(None) => RemoteResponse::NotFound,
            Err(e) => match e.class() {
                ErrorClass::Transient => RemoteResponse::TransientError(e.to_string()),
                ErrorClass::Capacity => RemoteResponse::QuotaError(e.to_string()),
                ErrorClass::Fatal => RemoteResponse::FatalError(e.to_string()),
            },
        }
    }

    #[async_trait]
    impl RemoteService for MemoryService {
        async fn call(&self, request: RemoteRequest) -> RemoteResponse {
            self.calls.fetch_add(1, Ordering::SeqCst);

            if !self.is_online() {
                return RemoteResponse::TransientError("service unreachable".into());
            }

            let request = match request.encode().and_then(|b| RemoteRequest::decode(&b)) {
                Ok(request) => request,
                Err(e) => return RemoteResponse::FatalError(e.to_string()),
            };

            let response = to_response(self.dispatch(request).await);

            match response.encode().and_then(|b| RemoteResponse::decode(&b)) {
                Ok(response) => response,
                Err(e) => RemoteResponse::TransientError(format!("response lost: {e}")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryService;
    use super::*;
    use std::sync::Arc;

    use driftsync_core::ErrorClass;

    use crate::memory::MemoryStore;

    fn diaries() -> Collection {
        Collection::new("diaries").unwrap()
    }

    #[tokio::test]
    async fn test_remote_store_roundtrip() {
        let remote = RemoteStore::new(MemoryService::new());
        let c = diaries();
        assert_eq!(remote.origin(), Origin::Remote);

        let v = remote.set(&c, "a", Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(v, Version(1));
        assert_eq!(remote.get(&c, "a").await.unwrap().unwrap(), "hello");
        assert!(remote.get(&c, "missing").await.unwrap().is_none());

        let batch = remote.changes_since(&c, None, 10).await.unwrap();
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].origin, Origin::Remote);

        let pair = PairId::derive(&c, Origin::Local, Origin::Remote);
        remote.set_marker(&pair, SyncMarker::at(4)).await.unwrap();
        assert_eq!(remote.get_marker(&pair).await.unwrap(), Some(SyncMarker::at(4)));
    }

    #[tokio::test]
    async fn test_offline_is_transient() {
        let service = Arc::new(MemoryService::new());
        let remote = RemoteStore::new(service.clone());
        service.set_online(false);

        let err = remote.get(&diaries(), "a").await.unwrap_err();
        assert!(matches!(err, StoreError::Transport(_)));
        assert_eq!(err.class(), ErrorClass::Transient);

        service.set_online(true);
        assert!(remote.get(&diaries(), "a").await.is_ok());
        assert_eq!(service.calls(), 2);
    }

    #[tokio::test]
    async fn test_quota_maps_to_capacity() {
        let store = Arc::new(MemoryStore::new(Origin::Remote).with_capacity(2));
        let remote = RemoteStore::new(MemoryService::with_store(store));

        let err = remote
            .set(&diaries(), "a", Bytes::from_static(b"too big"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Quota(_)));
        assert_eq!(err.class(), ErrorClass::Capacity);
    }

    #[tokio::test]
    async fn test_apply_outcomes_cross_the_wire() {
        let remote = RemoteStore::new(MemoryService::new());
        let c = diaries();
        let record = ChangeRecord::create("a", b"x".to_vec(), Version(2), Origin::Local);

        let outcomes = remote.apply_changes(&c, &[record.clone(), record]).await.unwrap();
        assert_eq!(outcomes, vec![ApplyOutcome::Applied, ApplyOutcome::Duplicate]);
    }

    struct Scripted(RemoteResponse);

    #[async_trait]
    impl RemoteService for Scripted {
        async fn call(&self, _request: RemoteRequest) -> RemoteResponse {
            self.0.clone()
        }
    }

    #[tokio::test]
    async fn test_status_classification() {
        let fatal = RemoteStore::new(Scripted(RemoteResponse::FatalError("bad record".into())));
        let err = fatal.get(&diaries(), "a").await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Fatal);

        // A response that does not fit the request is malformed.
        let wrong = RemoteStore::new(Scripted(RemoteResponse::Ok(RemoteData::Ack)));
        let err = wrong.changes_since(&diaries(), None, 10).await.unwrap_err();
        assert!(matches!(err, StoreError::Malformed(_)));

        let missing = RemoteStore::new(Scripted(RemoteResponse::NotFound));
        let batch = missing
            .changes_since(&diaries(), Some(SyncMarker::at(3)), 10)
            .await
            .unwrap();
        assert_eq!(batch, ChangeBatch::empty(Some(SyncMarker::at(3))));
    }
}
