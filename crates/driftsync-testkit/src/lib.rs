//! # Driftsync Testkit
//!
//! Testing utilities for driftsync.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: a local store and an in-process remote service wired into
//!   a [`SyncPair`](driftsync_sync::SyncPair), with seeding helpers
//! - **Fault injection**: [`FaultyStore`] wraps any store and fails, delays,
//!   hangs or panics on scripted calls
//! - **Event recording**: [`RecordingSink`] keeps every scheduler event
//! - **Generators**: proptest strategies for records and stamps
//!
//! ## Test Fixtures
//!
//! ```rust,no_run
//! use driftsync::{SchedulerPolicy, SyncTaskSpec};
//! use driftsync_testkit::TestFixture;
//!
//! async fn example() -> anyhow::Result<()> {
//!     let fixture = TestFixture::new("diaries");
//!     fixture.seed_remote(&[("a", "1"), ("b", "2")]).await?;
//!
//!     let (scheduler, events) = fixture.scheduler(SchedulerPolicy::default())?;
//!     scheduler.start().await?;
//!     let id = scheduler.enqueue(SyncTaskSpec::pull(fixture.collection.clone())).await?;
//!     scheduler.wait_for(id).await?;
//!     println!("{:?}", events.kinds());
//!     Ok(())
//! }
//! ```
//!
//! ## Fault Injection
//!
//! ```rust,no_run
//! use driftsync_testkit::{Fault, Op, TestFixture};
//!
//! let fixture = TestFixture::new("diaries");
//! fixture.remote.fail_times(Op::GetMarker, Fault::Transient, 2);
//! ```

pub mod faults;
pub mod fixtures;
pub mod generators;
pub mod recorder;

pub use faults::{Fault, FaultyStore, Op};
pub use fixtures::TestFixture;
pub use recorder::RecordingSink;

use tracing_subscriber::EnvFilter;

/// Install a test-friendly `tracing` subscriber once per process.
///
/// Honors `RUST_LOG`; defaults to `warn`. Safe to call from every test.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}
