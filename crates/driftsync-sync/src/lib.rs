//! # Driftsync Sync
//!
//! Pull and push cycles between a bound pair of stores.
//!
//! ## Overview
//!
//! A [`SyncPair`] binds a local and a remote [`StoreAdapter`] for one
//! collection. A pull reads the remote change feed after the marker the local
//! store holds for the pair and applies it locally; a push does the same the
//! other way round. Bidirectional runs pull first.
//!
//! ## Key Properties
//!
//! - **Durable markers**: a marker is advanced only after the batch it covers
//!   is fully settled on the receiving side
//! - **Idempotent**: re-running after a failure or cancellation reapplies at
//!   most one batch, and reapplying is a no-op
//! - **Bounded calls**: every store call runs under [`PairConfig::call_timeout`]
//! - **Cooperative cancellation**: checked between batches, never mid-apply
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use driftsync_core::{Collection, Direction, Origin};
//! use driftsync_store::{MemoryService, RemoteStore, SqliteStore};
//! use driftsync_sync::{CancelFlag, SyncPair};
//!
//! async fn example() {
//!     let local = Arc::new(SqliteStore::open("device.db", Origin::Local).unwrap());
//!     let remote = Arc::new(RemoteStore::new(MemoryService::new()));
//!
//!     let pair = SyncPair::new(Collection::new("diaries").unwrap(), local, remote).unwrap();
//!     let report = pair.run(Direction::Bidirectional, &CancelFlag::new()).await.unwrap();
//!     println!("applied {} records", report.applied());
//! }
//! ```
//!
//! [`StoreAdapter`]: driftsync_store::StoreAdapter

pub mod cancel;
pub mod config;
pub mod error;
pub mod pair;

pub use cancel::CancelFlag;
pub use config::PairConfig;
pub use error::{Result, SyncError};
pub use pair::{SyncPair, SyncReport, TransferReport};
