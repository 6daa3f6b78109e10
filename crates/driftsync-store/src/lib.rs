//! # Driftsync Store
//!
//! Uniform access to heterogeneous stores. Every physical store, local or
//! remote, sits behind the [`StoreAdapter`] trait so the sync layer and the
//! scheduler never care which one they are talking to.
//!
//! ## Key Types
//!
//! - [`StoreAdapter`] - The async trait every store implements
//! - [`SqliteStore`] - On-device persistent store (SQLite)
//! - [`MemoryStore`] - In-memory store with the same semantics
//! - [`RemoteStore`] - Adapter over a [`RemoteService`] request boundary
//! - [`MemoryService`] - In-process remote service backed by a `MemoryStore`
//!
//! ## Usage
//!
//! ```rust,no_run
//! use driftsync_core::{Collection, Origin};
//! use driftsync_store::{SqliteStore, StoreAdapter};
//!
//! async fn example() {
//!     let store = SqliteStore::open("device.db", Origin::Local)
//!         .unwrap()
//!         .with_capacity(64 * 1024 * 1024);
//!
//!     let diaries = Collection::new("diaries").unwrap();
//!     let version = store.set(&diaries, "2024-01-01", b"dear diary".to_vec().into()).await.unwrap();
//!     println!("written at {version}");
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Idempotent apply**: re-applying a record with the stored stamp is a no-op
//! - **Last-writer-wins**: conflicts are settled by `driftsync_core::resolve`
//! - **Restartable feed**: the change log keeps the latest change per key, so
//!   reading from an old marker yields a safe superset of what is needed
//! - **Tombstones**: deletes are remembered so stale writes cannot resurrect keys

pub mod error;
pub mod memory;
pub mod messages;
pub mod migration;
pub mod remote;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use messages::{RemoteData, RemoteRequest, RemoteResponse, PROTOCOL_VERSION};
pub use remote::{memory::MemoryService, RemoteService, RemoteStore};
pub use sqlite::SqliteStore;
pub use traits::{Query, StoreAdapter};
