//! Time source for the scheduler.

use std::time::{SystemTime, UNIX_EPOCH};

use tokio::time::Instant;

/// Monotonic clock used for backoff gates and retention.
///
/// Implementations must follow tokio's timer: the scheduler sleeps with
/// `tokio::time::sleep_until` on instants derived from [`Clock::now`]. Under
/// `tokio::time::pause` the default [`SystemClock`] is therefore fully
/// simulated.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Instant;

    /// Wall-clock milliseconds since the Unix epoch, stamped on events.
    fn timestamp_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }
}

/// Clock backed by tokio's (pausable) time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}
