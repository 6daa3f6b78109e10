//! # Driftsync
//!
//! Offline-first sync engine: a scheduler that keeps local and remote stores
//! of each collection converged, pacing itself by priority, retry policy and
//! device conditions.
//!
//! ## Overview
//!
//! - **Stores**: interchangeable [`StoreAdapter`](store::StoreAdapter)s, local
//!   (in-memory or SQLite) and remote (over a request/response service)
//! - **Pairs**: a [`SyncPair`](sync::SyncPair) pulls and pushes change records
//!   between the two stores of one collection, batch by batch
//! - **Scheduler**: a [`SyncScheduler`] queues sync tasks, admits them under a
//!   parallelism bound and the current [`SchedulerEnvironment`], and retries
//!   failures with backoff
//!
//! ## Key Properties
//!
//! - One run loop owns all task state; callers talk to it through a handle
//! - Never two tasks for the same collection at once, so markers only move
//!   forward
//! - Transient failures back off exponentially, capacity failures linearly,
//!   fatal failures are surfaced at once
//! - Every state transition is published as a [`SyncEvent`]
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use driftsync::core::{Collection, Origin};
//! use driftsync::store::{MemoryService, RemoteStore, SqliteStore};
//! use driftsync::sync::SyncPair;
//! use driftsync::{SyncScheduler, SyncTaskSpec};
//!
//! async fn example() {
//!     let diaries = Collection::new("diaries").unwrap();
//!     let local = Arc::new(SqliteStore::open("device.db", Origin::Local).unwrap());
//!     let remote = Arc::new(RemoteStore::new(MemoryService::new()));
//!
//!     let scheduler = SyncScheduler::builder()
//!         .pair(SyncPair::new(diaries.clone(), local, remote).unwrap())
//!         .spawn()
//!         .unwrap();
//!     scheduler.start().await.unwrap();
//!
//!     let id = scheduler.enqueue(SyncTaskSpec::bidirectional(diaries)).await.unwrap();
//!     let task = scheduler.wait_for(id).await.unwrap();
//!     println!("{:?}", task.map(|t| t.state));
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `driftsync::core` - Data model (ChangeRecord, SyncMarker, etc.)
//! - `driftsync::store` - Store adapters and the remote boundary
//! - `driftsync::sync` - Pull/push cycles

pub mod clock;
pub mod environment;
pub mod error;
pub mod events;
pub mod policy;
mod queue;
pub mod scheduler;
pub mod task;

// Re-export component crates
pub use driftsync_core as core;
pub use driftsync_store as store;
pub use driftsync_sync as sync;

// Re-export main types for convenience
pub use clock::{Clock, SystemClock};
pub use environment::{EnvironmentHandle, NetworkClass, PowerState, SchedulerEnvironment};
pub use error::{Result, SchedulerError};
pub use events::{BroadcastSink, EventKind, EventSink, SyncEvent, TracingSink};
pub use policy::SchedulerPolicy;
pub use scheduler::{SchedulerBuilder, SyncScheduler};
pub use task::{SyncTask, SyncTaskSpec, TaskError, TaskId, TaskState};

pub use driftsync_core::{Collection, Direction, ErrorClass, Priority};
