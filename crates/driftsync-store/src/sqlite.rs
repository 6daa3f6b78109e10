//! SQLite implementation of the StoreAdapter trait.
//!
//! This is the on-device store. It uses rusqlite with bundled SQLite, wrapped
//! in async via tokio::spawn_blocking.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use driftsync_core::{
    resolve, validate_change_record, validate_key, ApplyOutcome, ChangeBatch, ChangeRecord,
    Collection, Operation, Origin, PairId, Resolution, SyncMarker, ValidationError, Version,
};

use crate::error::{Result, StoreError};
use crate::migration::{self, now_millis};
use crate::traits::{Query, StoreAdapter};

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
pub struct SqliteStore {
    /// The SQLite connection, protected by a mutex.
    conn: Arc<Mutex<Connection>>,
    origin: Origin,
    capacity: Option<u64>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>, origin: Origin) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self::from_connection(conn, origin))
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory(origin: Origin) -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self::from_connection(conn, origin))
    }

    fn from_connection(conn: Connection, origin: Origin) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            origin,
            capacity: None,
        }
    }

    /// Limit the summed size of live payloads to `bytes`.
    pub fn with_capacity(mut self, bytes: u64) -> Self {
        self.capacity = Some(bytes);
        self
    }

    /// Summed size of live payloads.
    pub async fn used_bytes(&self) -> Result<u64> {
        self.blocking(|conn| used_bytes(conn)).await
    }

    /// The `(version, origin)` stamp stored for a key, tombstones included.
    pub async fn stamp(&self, collection: &Collection, key: &str) -> Result<Option<(Version, Origin)>> {
        let collection = collection.as_str().to_owned();
        let key = key.to_owned();
        self.blocking(move |conn| stamp(conn, &collection, &key)).await
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::Unavailable(format!("mutex poisoned: {}", e)))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("spawn_blocking failed: {}", e)))?
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row helpers (all run with the connection lock held)
// ─────────────────────────────────────────────────────────────────────────────

fn stamp(conn: &Connection, collection: &str, key: &str) -> Result<Option<(Version, Origin)>> {
    let row: Option<(i64, String)> = conn
        .query_row(
            "SELECT version, origin FROM entries WHERE collection = ?1 AND key = ?2",
            params![collection, key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    row.map(|(version, origin)| Ok((Version(version as u64), parse_origin(&origin)?)))
        .transpose()
}

fn parse_origin(s: &str) -> Result<Origin> {
    Origin::parse(s).ok_or_else(|| StoreError::Malformed(format!("unknown origin: {s}")))
}

fn is_live(conn: &Connection, collection: &str, key: &str) -> Result<bool> {
    let deleted: Option<bool> = conn
        .query_row(
            "SELECT deleted FROM entries WHERE collection = ?1 AND key = ?2",
            params![collection, key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(deleted == Some(false))
}

fn clock(conn: &Connection) -> Result<Version> {
    let value: i64 = conn.query_row(
        "SELECT value FROM store_meta WHERE name = 'clock'",
        [],
        |row| row.get(0),
    )?;
    Ok(Version(value as u64))
}

/// Versions are stored as SQLite integers.
fn sql_version(version: Version) -> Result<i64> {
    i64::try_from(version.0).map_err(|_| ValidationError::VersionOutOfRange(version.0).into())
}

fn observe(conn: &Connection, version: Version) -> Result<()> {
    conn.execute(
        "UPDATE store_meta SET value = MAX(value, ?1) WHERE name = 'clock'",
        params![sql_version(version)?],
    )?;
    Ok(())
}

fn used_bytes(conn: &Connection) -> Result<u64> {
    let used: i64 = conn.query_row(
        "SELECT COALESCE(SUM(LENGTH(value)), 0) FROM entries WHERE deleted = 0",
        [],
        |row| row.get(0),
    )?;
    Ok(used as u64)
}

fn next_version(conn: &Connection, collection: &str, key: &str) -> Result<Version> {
    let key_version = stamp(conn, collection, key)?
        .map(|(v, _)| v)
        .unwrap_or(Version::ZERO);
    Ok(clock(conn)?.max(key_version).next())
}

/// Store a winning record: check capacity, replace the key's change-log row,
/// upsert the entry and advance the clock.
fn write_record(
    conn: &Connection,
    collection: &str,
    record: &ChangeRecord,
    capacity: Option<u64>,
) -> Result<()> {
    if let Some(cap) = capacity {
        let old_len: i64 = conn
            .query_row(
                "SELECT COALESCE(LENGTH(value), 0) FROM entries
                 WHERE collection = ?1 AND key = ?2 AND deleted = 0",
                params![collection, record.key],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);
        let old_len = old_len as u64;
        let new_len = record.payload_len() as u64;
        let used = used_bytes(conn)? - old_len + new_len;

        if new_len > old_len && used > cap {
            return Err(StoreError::Quota(format!(
                "writing {} would use {used} of {cap} bytes",
                record.key
            )));
        }
    }

    let version = sql_version(record.version)?;
    let now = now_millis();
    let payload = record.payload.as_deref();

    conn.execute(
        "DELETE FROM changes WHERE collection = ?1 AND key = ?2",
        params![collection, record.key],
    )?;

    conn.execute(
        "INSERT INTO changes (collection, key, operation, payload, version, origin, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            collection,
            record.key,
            record.operation.as_str(),
            payload,
            version,
            record.origin.as_str(),
            now,
        ],
    )?;

    conn.execute(
        "INSERT INTO entries (collection, key, value, version, origin, deleted, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(collection, key) DO UPDATE SET
            value = excluded.value,
            version = excluded.version,
            origin = excluded.origin,
            deleted = excluded.deleted,
            updated_at = excluded.updated_at",
        params![
            collection,
            record.key,
            payload,
            version,
            record.origin.as_str(),
            record.operation == Operation::Delete,
            now,
        ],
    )?;

    observe(conn, record.version)
}

type ChangeRow = (i64, String, String, Option<Vec<u8>>, i64, String);

fn decode_change((_, key, operation, payload, version, origin): ChangeRow) -> Result<ChangeRecord> {
    let operation = Operation::parse(&operation)
        .ok_or_else(|| StoreError::Malformed(format!("unknown operation: {operation}")))?;
    Ok(ChangeRecord {
        key,
        operation,
        payload: payload.map(Bytes::from),
        version: Version(version as u64),
        origin: parse_origin(&origin)?,
    })
}

fn apply_one(
    conn: &Connection,
    collection: &str,
    record: &ChangeRecord,
    capacity: Option<u64>,
) -> Result<ApplyOutcome> {
    if let Err(e) = validate_change_record(record) {
        return Ok(ApplyOutcome::Failed {
            class: StoreError::from(e.clone()).class(),
            reason: e.to_string(),
        });
    }

    let existing = stamp(conn, collection, &record.key)?;
    observe(conn, record.version)?;

    let outcome = match resolve(record.stamp(), existing) {
        Resolution::Duplicate => ApplyOutcome::Duplicate,
        Resolution::KeepExisting => ApplyOutcome::Superseded {
            current: existing.map(|(v, _)| v).unwrap_or(Version::ZERO),
        },
        Resolution::Apply => match write_record(conn, collection, record, capacity) {
            Ok(()) => ApplyOutcome::Applied,
            Err(e @ StoreError::Quota(_)) => ApplyOutcome::Failed {
                class: e.class(),
                reason: e.to_string(),
            },
            Err(e) => return Err(e),
        },
    };
    Ok(outcome)
}

#[async_trait]
impl StoreAdapter for SqliteStore {
    fn origin(&self) -> Origin {
        self.origin
    }

    async fn get(&self, collection: &Collection, key: &str) -> Result<Option<Bytes>> {
        let collection = collection.as_str().to_owned();
        let key = key.to_owned();

        self.blocking(move |conn| {
            let value: Option<Option<Vec<u8>>> = conn
                .query_row(
                    "SELECT value FROM entries
                     WHERE collection = ?1 AND key = ?2 AND deleted = 0",
                    params![collection, key],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(value.flatten().map(Bytes::from))
        })
        .await
    }

    async fn set(&self, collection: &Collection, key: &str, value: Bytes) -> Result<Version> {
        validate_key(key)?;
        let collection = collection.as_str().to_owned();
        let key = key.to_owned();
        let origin = self.origin;
        let capacity = self.capacity;

        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let version = next_version(&tx, &collection, &key)?;
            let record = if is_live(&tx, &collection, &key)? {
                ChangeRecord::update(key, value, version, origin)
            } else {
                ChangeRecord::create(key, value, version, origin)
            };
            write_record(&tx, &collection, &record, capacity)?;
            tx.commit()?;
            Ok(version)
        })
        .await
    }

    async fn remove(&self, collection: &Collection, key: &str) -> Result<Option<Version>> {
        let collection = collection.as_str().to_owned();
        let key = key.to_owned();
        let origin = self.origin;
        let capacity = self.capacity;

        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            if !is_live(&tx, &collection, &key)? {
                return Ok(None);
            }
            let version = next_version(&tx, &collection, &key)?;
            write_record(&tx, &collection, &ChangeRecord::delete(key, version, origin), capacity)?;
            tx.commit()?;
            Ok(Some(version))
        })
        .await
    }

    async fn query(&self, collection: &Collection, query: &Query) -> Result<Vec<(String, Bytes)>> {
        let collection = collection.as_str().to_owned();
        let query = query.clone();

        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key, value FROM entries
                 WHERE collection = ?1 AND deleted = 0 AND key > ?2
                 ORDER BY key",
            )?;

            let after = query.start_after.clone().unwrap_or_default();
            let limit = query.limit.unwrap_or(usize::MAX);
            let mut out = Vec::new();

            let rows = stmt.query_map(params![collection, after], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<Vec<u8>>>(1)?))
            })?;
            for row in rows {
                let (key, value) = row?;
                if out.len() >= limit {
                    break;
                }
                if let (true, Some(value)) = (query.matches(&key), value) {
                    out.push((key, Bytes::from(value)));
                }
            }
            Ok(out)
        })
        .await
    }

    async fn changes_since(
        &self,
        collection: &Collection,
        marker: Option<SyncMarker>,
        limit: usize,
    ) -> Result<ChangeBatch> {
        let collection = collection.as_str().to_owned();

        self.blocking(move |conn| {
            let after = marker.map(|m| m.position()).unwrap_or(0) as i64;
            // One extra row tells us whether another page exists.
            let fetch = limit.min(i64::MAX as usize - 1) as i64 + 1;

            let mut stmt = conn.prepare(
                "SELECT seq, key, operation, payload, version, origin FROM changes
                 WHERE collection = ?1 AND seq > ?2
                 ORDER BY seq LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(params![collection, after, fetch], |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<ChangeRow>>>()?;

            let has_more = rows.len() > limit;
            let page: Vec<ChangeRow> = rows.into_iter().take(limit).collect();
            let next_marker = page
                .last()
                .map(|row| SyncMarker::at(row.0 as u64))
                .or(marker);

            let records = page
                .into_iter()
                .map(decode_change)
                .collect::<Result<Vec<_>>>()?;

            Ok(ChangeBatch {
                records,
                next_marker,
                has_more,
            })
        })
        .await
    }

    async fn apply_changes(
        &self,
        collection: &Collection,
        records: &[ChangeRecord],
    ) -> Result<Vec<ApplyOutcome>> {
        let name = collection.as_str().to_owned();
        let records = records.to_vec();
        let capacity = self.capacity;

        let outcomes = self
            .blocking(move |conn| {
                let tx = conn.transaction()?;
                let outcomes = records
                    .iter()
                    .map(|record| apply_one(&tx, &name, record, capacity))
                    .collect::<Result<Vec<_>>>()?;
                tx.commit()?;
                Ok(outcomes)
            })
            .await?;

        debug!(
            collection = %collection,
            origin = %self.origin,
            records = outcomes.len(),
            applied = outcomes.iter().filter(|o| **o == ApplyOutcome::Applied).count(),
            "applied changes"
        );

        Ok(outcomes)
    }

    async fn get_marker(&self, pair: &PairId) -> Result<Option<SyncMarker>> {
        let pair = *pair;

        self.blocking(move |conn| {
            let bytes: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT marker FROM markers WHERE pair_id = ?1",
                    params![pair.as_bytes().as_slice()],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(bytes.map(|b| SyncMarker::from_bytes(&b)).transpose()?)
        })
        .await
    }

    async fn set_marker(&self, pair: &PairId, marker: SyncMarker) -> Result<()> {
        let pair = *pair;

        self.blocking(move |conn| {
            conn.execute(
                "INSERT INTO markers (pair_id, marker, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(pair_id) DO UPDATE SET
                    marker = excluded.marker,
                    updated_at = excluded.updated_at",
                params![pair.as_bytes().as_slice(), marker.to_bytes(), now_millis()],
            )?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driftsync_core::{ErrorClass, MAX_VERSION};

    fn diaries() -> Collection {
        Collection::new("diaries").unwrap()
    }

    #[tokio::test]
    async fn test_sqlite_set_get_remove() {
        let store = SqliteStore::open_memory(Origin::Local).unwrap();
        let c = diaries();

        let v1 = store.set(&c, "a", Bytes::from_static(b"one")).await.unwrap();
        let v2 = store.set(&c, "a", Bytes::from_static(b"two")).await.unwrap();
        assert_eq!(v1, Version(1));
        assert_eq!(v2, Version(2));
        assert_eq!(store.get(&c, "a").await.unwrap().unwrap(), "two");

        assert_eq!(store.remove(&c, "a").await.unwrap(), Some(Version(3)));
        assert!(store.get(&c, "a").await.unwrap().is_none());
        assert_eq!(store.remove(&c, "a").await.unwrap(), None);
        assert_eq!(
            store.stamp(&c, "a").await.unwrap(),
            Some((Version(3), Origin::Local))
        );
    }

    #[tokio::test]
    async fn test_sqlite_change_log() {
        let store = SqliteStore::open_memory(Origin::Local).unwrap();
        let c = diaries();

        store.set(&c, "a", Bytes::from_static(b"1")).await.unwrap();
        store.set(&c, "b", Bytes::from_static(b"2")).await.unwrap();
        store.set(&c, "a", Bytes::from_static(b"3")).await.unwrap();
        store.remove(&c, "b").await.unwrap();

        let first = store.changes_since(&c, None, 1).await.unwrap();
        assert_eq!(first.records.len(), 1);
        assert_eq!(first.records[0].key, "a");
        assert_eq!(first.records[0].operation, Operation::Update);
        assert!(first.has_more);

        let rest = store.changes_since(&c, first.next_marker, 10).await.unwrap();
        assert_eq!(rest.records.len(), 1);
        assert_eq!(rest.records[0].operation, Operation::Delete);
        assert!(rest.records[0].payload.is_none());
        assert!(!rest.has_more);
        assert!(rest.next_marker > first.next_marker);

        let other = Collection::new("photos").unwrap();
        let empty = store.changes_since(&other, None, 10).await.unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty.next_marker, None);
    }

    #[tokio::test]
    async fn test_sqlite_apply_outcomes() {
        let store = SqliteStore::open_memory(Origin::Local).unwrap();
        let c = diaries();

        let mut bad = ChangeRecord::create("bad", b"x".to_vec(), Version(1), Origin::Remote);
        bad.payload = None;
        let records = vec![
            ChangeRecord::create("a", b"x".to_vec(), Version(10), Origin::Remote),
            ChangeRecord::create("a", b"x".to_vec(), Version(10), Origin::Remote),
            ChangeRecord::update("a", b"old".to_vec(), Version(4), Origin::Remote),
            bad,
        ];

        let outcomes = store.apply_changes(&c, &records).await.unwrap();
        assert_eq!(outcomes[0], ApplyOutcome::Applied);
        assert_eq!(outcomes[1], ApplyOutcome::Duplicate);
        assert_eq!(outcomes[2], ApplyOutcome::Superseded { current: Version(10) });
        assert!(matches!(
            outcomes[3],
            ApplyOutcome::Failed { class: ErrorClass::Fatal, .. }
        ));

        // Local writes continue above the highest observed version.
        let v = store.set(&c, "b", Bytes::from_static(b"y")).await.unwrap();
        assert_eq!(v, Version(11));
    }

    #[tokio::test]
    async fn test_sqlite_capacity() {
        let store = SqliteStore::open_memory(Origin::Local).unwrap().with_capacity(4);
        let c = diaries();

        store.set(&c, "a", Bytes::from_static(b"abc")).await.unwrap();
        let err = store.set(&c, "b", Bytes::from_static(b"de")).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Capacity);

        // Shrinking an existing value is always allowed.
        store.set(&c, "a", Bytes::from_static(b"a")).await.unwrap();
        assert_eq!(store.used_bytes().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sqlite_query() {
        let store = SqliteStore::open_memory(Origin::Local).unwrap();
        let c = diaries();
        for key in ["2024-01", "2024-02", "2024-03", "2023-12"] {
            store.set(&c, key, Bytes::from(key.as_bytes().to_vec())).await.unwrap();
        }
        store.remove(&c, "2024-03").await.unwrap();

        let rows = store.query(&c, &Query::prefix("2024-")).await.unwrap();
        let keys: Vec<_> = rows.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["2024-01", "2024-02"]);

        let paged = store
            .query(&c, &Query::all().start_after("2024-01").limit(1))
            .await
            .unwrap();
        assert_eq!(paged.len(), 1);
        assert_eq!(paged[0].0, "2024-02");
    }

    #[tokio::test]
    async fn test_sqlite_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("device.db");
        let c = diaries();
        let pair = PairId::derive(&c, Origin::Remote, Origin::Local);

        {
            let store = SqliteStore::open(&path, Origin::Local).unwrap();
            store.set(&c, "a", Bytes::from_static(b"kept")).await.unwrap();
            store.set_marker(&pair, SyncMarker::at(12)).await.unwrap();
        }

        let store = SqliteStore::open(&path, Origin::Local).unwrap();
        assert_eq!(store.get(&c, "a").await.unwrap().unwrap(), "kept");
        assert_eq!(store.get_marker(&pair).await.unwrap(), Some(SyncMarker::at(12)));
        assert_eq!(store.set(&c, "a", Bytes::from_static(b"next")).await.unwrap(), Version(2));
    }

    #[tokio::test]
    async fn test_sqlite_large_versions_stay_ordered() {
        let store = SqliteStore::open_memory(Origin::Local).unwrap();
        let c = diaries();
        let high = Version(1 << 62);

        let outcomes = store
            .apply_changes(&c, &[ChangeRecord::create("a", b"r".to_vec(), high, Origin::Remote)])
            .await
            .unwrap();
        assert_eq!(outcomes, vec![ApplyOutcome::Applied]);
        // The clock observed the remote version.
        assert_eq!(store.set(&c, "b", Bytes::from_static(b"l")).await.unwrap(), high.next());

        let over = ChangeRecord::create("c", b"x".to_vec(), MAX_VERSION.next(), Origin::Remote);
        let outcomes = store.apply_changes(&c, &[over]).await.unwrap();
        assert!(matches!(
            outcomes[0],
            ApplyOutcome::Failed { class: ErrorClass::Fatal, .. }
        ));
        assert!(store.get(&c, "c").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_refuses_to_write_past_max_version() {
        let store = SqliteStore::open_memory(Origin::Local).unwrap();
        let c = diaries();
        store
            .apply_changes(
                &c,
                &[ChangeRecord::create("a", b"r".to_vec(), MAX_VERSION, Origin::Remote)],
            )
            .await
            .unwrap();

        let err = store.set(&c, "a", Bytes::from_static(b"l")).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Validation(ValidationError::VersionOutOfRange(_))
        ));
        assert_eq!(store.get(&c, "a").await.unwrap().unwrap(), "r");
    }
}
