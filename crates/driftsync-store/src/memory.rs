//! In-memory implementation of the StoreAdapter trait.
//!
//! Same semantics as the SQLite store but keeps everything in memory with no
//! persistence. It also backs [`crate::MemoryService`], the in-process stand-in
//! for the remote store.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::debug;

use driftsync_core::{
    resolve, validate_change_record, validate_key, ApplyOutcome, ChangeBatch, ChangeRecord,
    Collection, Origin, PairId, Resolution, SyncMarker, Version,
};

use crate::error::{Result, StoreError};
use crate::traits::{Query, StoreAdapter};

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
pub struct MemoryStore {
    origin: Origin,
    /// Ceiling on the summed size of live payloads, in bytes.
    capacity: Option<u64>,
    inner: RwLock<MemoryStoreInner>,
}

#[derive(Default)]
struct MemoryStoreInner {
    collections: HashMap<Collection, CollectionTables>,

    /// Markers of pairs this store receives changes for.
    markers: HashMap<PairId, SyncMarker>,

    /// Highest version written or observed.
    clock: Version,

    /// Last change-log position handed out (shared by all collections).
    last_seq: u64,

    /// Summed size of live payloads.
    used_bytes: u64,
}

#[derive(Default)]
struct CollectionTables {
    /// Current state per key, tombstones included.
    entries: BTreeMap<String, Entry>,

    /// Change log: position -> record. Holds only the latest change per key.
    log: BTreeMap<u64, ChangeRecord>,
}

struct Entry {
    /// `None` marks a tombstone.
    value: Option<Bytes>,
    version: Version,
    origin: Origin,
    log_seq: u64,
}

impl Entry {
    fn live_len(&self) -> u64 {
        self.value.as_ref().map(|v| v.len() as u64).unwrap_or(0)
    }
}

impl MemoryStoreInner {
    fn stamp(&self, collection: &Collection, key: &str) -> Option<(Version, Origin)> {
        self.collections
            .get(collection)
            .and_then(|t| t.entries.get(key))
            .map(|e| (e.version, e.origin))
    }

    fn observe(&mut self, version: Version) {
        self.clock = self.clock.max(version);
    }

    /// Store a winning record: update the entry, replace its log slot, and
    /// account for its size.
    fn record(
        &mut self,
        collection: &Collection,
        record: ChangeRecord,
        capacity: Option<u64>,
    ) -> Result<()> {
        let tables = self.collections.entry(collection.clone()).or_default();

        let old_len = tables.entries.get(&record.key).map(Entry::live_len).unwrap_or(0);
        let new_len = record.payload_len() as u64;
        let used = self.used_bytes - old_len + new_len;

        if let Some(cap) = capacity {
            if new_len > old_len && used > cap {
                return Err(StoreError::Quota(format!(
                    "writing {} would use {used} of {cap} bytes",
                    record.key
                )));
            }
        }

        self.last_seq += 1;
        let seq = self.last_seq;

        if let Some(previous) = tables.entries.get(&record.key) {
            tables.log.remove(&previous.log_seq);
        }

        tables.entries.insert(
            record.key.clone(),
            Entry {
                value: record.payload.clone(),
                version: record.version,
                origin: record.origin,
                log_seq: seq,
            },
        );

        let version = record.version;
        tables.log.insert(seq, record);
        self.used_bytes = used;
        self.observe(version);

        Ok(())
    }

    /// Next version for a local write to `key`.
    fn next_version(&self, collection: &Collection, key: &str) -> Version {
        let key_version = self
            .stamp(collection, key)
            .map(|(v, _)| v)
            .unwrap_or(Version::ZERO);
        self.clock.max(key_version).next()
    }

    fn is_live(&self, collection: &Collection, key: &str) -> bool {
        self.collections
            .get(collection)
            .and_then(|t| t.entries.get(key))
            .map(|e| e.value.is_some())
            .unwrap_or(false)
    }
}

impl MemoryStore {
    /// Create a new empty in-memory store.
    pub fn new(origin: Origin) -> Self {
        Self {
            origin,
            capacity: None,
            inner: RwLock::new(MemoryStoreInner::default()),
        }
    }

    /// Limit the summed size of live payloads to `bytes`.
    pub fn with_capacity(mut self, bytes: u64) -> Self {
        self.capacity = Some(bytes);
        self
    }

    /// The `(version, origin)` stamp stored for a key, tombstones included.
    pub fn stamp(&self, collection: &Collection, key: &str) -> Option<(Version, Origin)> {
        self.inner.read().stamp(collection, key)
    }

    /// Summed size of live payloads.
    pub fn used_bytes(&self) -> u64 {
        self.inner.read().used_bytes
    }

    /// Number of live keys in a collection.
    pub fn len(&self, collection: &Collection) -> usize {
        self.inner
            .read()
            .collections
            .get(collection)
            .map(|t| t.entries.values().filter(|e| e.value.is_some()).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self, collection: &Collection) -> bool {
        self.len(collection) == 0
    }
}

#[async_trait]
impl StoreAdapter for MemoryStore {
    fn origin(&self) -> Origin {
        self.origin
    }

    async fn get(&self, collection: &Collection, key: &str) -> Result<Option<Bytes>> {
        let inner = self.inner.read();
        Ok(inner
            .collections
            .get(collection)
            .and_then(|t| t.entries.get(key))
            .and_then(|e| e.value.clone()))
    }

    async fn set(&self, collection: &Collection, key: &str, value: Bytes) -> Result<Version> {
        validate_key(key)?;
        let mut inner = self.inner.write();

        let version = inner.next_version(collection, key);
        let record = if inner.is_live(collection, key) {
            ChangeRecord::update(key, value, version, self.origin)
        } else {
            ChangeRecord::create(key, value, version, self.origin)
        };

        inner.record(collection, record, self.capacity)?;
        Ok(version)
    }

    async fn remove(&self, collection: &Collection, key: &str) -> Result<Option<Version>> {
        let mut inner = self.inner.write();
        if !inner.is_live(collection, key) {
            return Ok(None);
        }

        let version = inner.next_version(collection, key);
        inner.record(
            collection,
            ChangeRecord::delete(key, version, self.origin),
            self.capacity,
        )?;
        Ok(Some(version))
    }

    async fn query(&self, collection: &Collection, query: &Query) -> Result<Vec<(String, Bytes)>> {
        let inner = self.inner.read();
        let Some(tables) = inner.collections.get(collection) else {
            return Ok(Vec::new());
        };

        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(tables
            .entries
            .iter()
            .filter(|(key, _)| query.matches(key))
            .filter_map(|(key, e)| e.value.clone().map(|v| (key.clone(), v)))
            .take(limit)
            .collect())
    }

    async fn changes_since(
        &self,
        collection: &Collection,
        marker: Option<SyncMarker>,
        limit: usize,
    ) -> Result<ChangeBatch> {
        let inner = self.inner.read();
        let Some(tables) = inner.collections.get(collection) else {
            return Ok(ChangeBatch::empty(marker));
        };

        let after = marker.map(|m| m.position()).unwrap_or(0);
        let mut iter = tables
            .log
            .range((Bound::Excluded(after), Bound::Unbounded));

        let page: Vec<(u64, ChangeRecord)> = iter
            .by_ref()
            .take(limit)
            .map(|(seq, r)| (*seq, r.clone()))
            .collect();
        let has_more = iter.next().is_some();

        let next_marker = page.last().map(|(seq, _)| SyncMarker::at(*seq)).or(marker);
        Ok(ChangeBatch {
            records: page.into_iter().map(|(_, r)| r).collect(),
            next_marker,
            has_more,
        })
    }

    async fn apply_changes(
        &self,
        collection: &Collection,
        records: &[ChangeRecord],
    ) -> Result<Vec<ApplyOutcome>> {
        let mut inner = self.inner.write();
        let mut outcomes = Vec::with_capacity(records.len());

        for record in records {
            if let Err(e) = validate_change_record(record) {
                outcomes.push(ApplyOutcome::Failed {
                    class: StoreError::from(e.clone()).class(),
                    reason: e.to_string(),
                });
                continue;
            }

            let existing = inner.stamp(collection, &record.key);
            inner.observe(record.version);

            let outcome = match resolve(record.stamp(), existing) {
                Resolution::Duplicate => ApplyOutcome::Duplicate,
                Resolution::KeepExisting => ApplyOutcome::Superseded {
                    current: existing.map(|(v, _)| v).unwrap_or(Version::ZERO),
                },
                Resolution::Apply => match inner.record(collection, record.clone(), self.capacity) {
                    Ok(()) => ApplyOutcome::Applied,
                    Err(e) => ApplyOutcome::Failed {
                        class: e.class(),
                        reason: e.to_string(),
                    },
                },
            };
            outcomes.push(outcome);
        }

        debug!(
            collection = %collection,
            origin = %self.origin,
            records = records.len(),
            applied = outcomes.iter().filter(|o| **o == ApplyOutcome::Applied).count(),
            "applied changes"
        );

        Ok(outcomes)
    }

    async fn get_marker(&self, pair: &PairId) -> Result<Option<SyncMarker>> {
        Ok(self.inner.read().markers.get(pair).copied())
    }

    async fn set_marker(&self, pair: &PairId, marker: SyncMarker) -> Result<()> {
        self.inner.write().markers.insert(*pair, marker);
        Ok(())
    }
}
