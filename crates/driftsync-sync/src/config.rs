//! Per-pair configuration.

use std::time::Duration;

/// Configuration for a [`SyncPair`](crate::SyncPair).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairConfig {
    /// Maximum records fetched and applied per batch.
    pub batch_size: usize,
    /// Timeout applied to every individual store call.
    pub call_timeout: Duration,
}

impl Default for PairConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            call_timeout: Duration::from_secs(30),
        }
    }
}

impl PairConfig {
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }
}
