//! Database schema migrations for SQLite.
//!
//! We use a simple versioned migration system. Each migration is a SQL string
//! that transforms the schema from version N to N+1.

use rusqlite::Connection;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 1;

/// Initialize or migrate the database schema.
///
/// This function is idempotent - it can be called multiple times safely.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current > CURRENT_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema v{current} is newer than supported v{CURRENT_VERSION}"
        )));
    }

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
        }

        tx.commit()?;
        tracing::info!(from = current, to = CURRENT_VERSION, "migrated store schema");
    }

    Ok(())
}

/// Apply a specific migration version.
fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Current value per key; deleted rows are tombstones
        CREATE TABLE entries (
            collection TEXT NOT NULL,
            key TEXT NOT NULL,
            value BLOB,                       -- NULL for tombstones
            version INTEGER NOT NULL,         -- last applied version
            origin TEXT NOT NULL,             -- 'local' | 'remote'
            deleted INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (collection, key)
        );

        -- Change log; holds only the latest change per key
        CREATE TABLE changes (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            collection TEXT NOT NULL,
            key TEXT NOT NULL,
            operation TEXT NOT NULL,          -- 'create' | 'update' | 'delete'
            payload BLOB,
            version INTEGER NOT NULL,
            origin TEXT NOT NULL,
            recorded_at INTEGER NOT NULL
        );

        -- Sync markers for pairs this store receives changes for
        CREATE TABLE markers (
            pair_id BLOB PRIMARY KEY,         -- 32 bytes
            marker BLOB NOT NULL,             -- CBOR-encoded SyncMarker
            updated_at INTEGER NOT NULL
        );

        -- Scalar store state (Lamport clock)
        CREATE TABLE store_meta (
            name TEXT PRIMARY KEY,
            value INTEGER NOT NULL
        );

        INSERT INTO store_meta (name, value) VALUES ('clock', 0);

        CREATE INDEX idx_changes_collection_seq ON changes(collection, seq);
        CREATE INDEX idx_changes_collection_key ON changes(collection, key);
        "#,
    )?;

    Ok(())
}

/// Get current time in milliseconds.
pub(crate) fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
