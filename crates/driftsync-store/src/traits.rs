//! StoreAdapter trait: the uniform capability surface over one physical store.
//!
//! The local on-device store and the remote service implement the same trait,
//! so a sync pair can move changes in either direction without knowing which
//! side is which.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use driftsync_core::{
    ApplyOutcome, ChangeBatch, ChangeRecord, Collection, Origin, PairId, SyncMarker, Version,
};

use crate::error::Result;

/// Filter for [`StoreAdapter::query`].
///
/// Matches live (non-deleted) keys in ascending key order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    /// Only keys starting with this prefix.
    pub prefix: Option<String>,
    /// Only keys strictly greater than this one (for paging).
    pub start_after: Option<String>,
    /// Maximum number of entries to return.
    pub limit: Option<usize>,
}

impl Query {
    /// Match every live key.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match keys with the given prefix.
    pub fn prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            ..Self::default()
        }
    }

    /// Resume after `key`.
    pub fn start_after(mut self, key: impl Into<String>) -> Self {
        self.start_after = Some(key.into());
        self
    }

    /// Cap the number of results.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Whether `key` passes the prefix and paging bounds.
    pub fn matches(&self, key: &str) -> bool {
        if let Some(prefix) = &self.prefix {
            if !key.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(after) = &self.start_after {
            if key <= after.as_str() {
                return false;
            }
        }
        true
    }
}

/// The StoreAdapter trait: async interface shared by every store.
///
/// # Design Notes
///
/// - **Versions**: `set` and `remove` stamp the change with a version from the
///   store's own Lamport clock and the store's [`Origin`].
/// - **Change feed**: `changes_since` pages through the change log after a
///   marker. Calling it again with the same marker returns the same records or
///   a superset; delivery is at-least-once.
/// - **Idempotent apply**: `apply_changes` compares each record against the
///   stamp stored for its key (see [`driftsync_core::resolve`]), so applying a
///   record twice has the same effect as applying it once.
/// - **Markers**: each store keeps the markers of pairs for which it is the
///   receiving side. Callers advance a marker only after the batch it covers
///   has been durably applied.
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Which side of the sync this store is.
    fn origin(&self) -> Origin;

    // ─────────────────────────────────────────────────────────────────────────
    // Key/Value Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Read a live value. `None` means not found (or deleted).
    async fn get(&self, collection: &Collection, key: &str) -> Result<Option<Bytes>>;

    /// Write a value, returning the version assigned to the change.
    async fn set(&self, collection: &Collection, key: &str, value: Bytes) -> Result<Version>;

    /// Delete a key. Returns the tombstone version, or `None` if the key was
    /// not live.
    async fn remove(&self, collection: &Collection, key: &str) -> Result<Option<Version>>;

    /// List live entries matching the filter.
    async fn query(&self, collection: &Collection, query: &Query) -> Result<Vec<(String, Bytes)>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Sync Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Read up to `limit` changes recorded after `marker` (`None` = from the
    /// beginning), in change-log order.
    async fn changes_since(
        &self,
        collection: &Collection,
        marker: Option<SyncMarker>,
        limit: usize,
    ) -> Result<ChangeBatch>;

    /// Apply incoming records, returning one outcome per record in order.
    ///
    /// Per-record failures are reported as [`ApplyOutcome::Failed`]; an `Err`
    /// means the call as a whole failed and nothing can be assumed applied.
    async fn apply_changes(
        &self,
        collection: &Collection,
        records: &[ChangeRecord],
    ) -> Result<Vec<ApplyOutcome>>;

    /// Read the stored marker for a pair.
    async fn get_marker(&self, pair: &PairId) -> Result<Option<SyncMarker>>;

    /// Persist the marker for a pair.
    async fn set_marker(&self, pair: &PairId, marker: SyncMarker) -> Result<()>;
}

#[async_trait]
impl<S: StoreAdapter + ?Sized> StoreAdapter for Arc<S> {
    fn origin(&self) -> Origin {
        (**self).origin()
    }

    async fn get(&self, collection: &Collection, key: &str) -> Result<Option<Bytes>> {
        (**self).get(collection, key).await
    }

    async fn set(&self, collection: &Collection, key: &str, value: Bytes) -> Result<Version> {
        (**self).set(collection, key, value).await
    }

    async fn remove(&self, collection: &Collection, key: &str) -> Result<Option<Version>> {
        (**self).remove(collection, key).await
    }

    async fn query(&self, collection: &Collection, query: &Query) -> Result<Vec<(String, Bytes)>> {
        (**self).query(collection, query).await
    }

    async fn changes_since(
        &self,
        collection: &Collection,
        marker: Option<SyncMarker>,
        limit: usize,
    ) -> Result<ChangeBatch> {
        (**self).changes_since(collection, marker, limit).await
    }

    async fn apply_changes(
        &self,
        collection: &Collection,
        records: &[ChangeRecord],
    ) -> Result<Vec<ApplyOutcome>> {
        (**self).apply_changes(collection, records).await
    }

    async fn get_marker(&self, pair: &PairId) -> Result<Option<SyncMarker>> {
        (**self).get_marker(pair).await
    }

    async fn set_marker(&self, pair: &PairId, marker: SyncMarker) -> Result<()> {
        (**self).set_marker(pair, marker).await
    }
}
