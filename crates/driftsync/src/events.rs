//! Event bus boundary.
//!
//! Every task state transition, and every pause or resume, is published as a
//! [`SyncEvent`] to an [`EventSink`]. The scheduler keeps no event history;
//! persisting or displaying events is the sink's business.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use driftsync_core::Collection;

use crate::task::TaskId;

/// Fixed set of event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    TaskAdded,
    TaskStarted,
    TaskSucceeded,
    TaskRetryScheduled,
    TaskFailed,
    TaskCancelled,
    SchedulerPaused,
    SchedulerResumed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TaskAdded => "task-added",
            EventKind::TaskStarted => "task-started",
            EventKind::TaskSucceeded => "task-succeeded",
            EventKind::TaskRetryScheduled => "task-retry-scheduled",
            EventKind::TaskFailed => "task-failed",
            EventKind::TaskCancelled => "task-cancelled",
            EventKind::SchedulerPaused => "scheduler-paused",
            EventKind::SchedulerResumed => "scheduler-resumed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One lifecycle notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Absent for scheduler-level events.
    pub task_id: Option<TaskId>,
    pub collection: Option<Collection>,
    /// Wall-clock milliseconds since the Unix epoch.
    #[serde(rename = "timestamp")]
    pub timestamp_ms: u64,
    pub detail: String,
}

/// Receiver of scheduler events.
///
/// Called from the scheduler's run loop, so implementations must not block.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: SyncEvent);
}

impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    fn publish(&self, event: SyncEvent) {
        (**self).publish(event)
    }
}

/// Fans events out to any number of subscribers.
///
/// Slow subscribers lag and lose the oldest events; the scheduler is never
/// held up.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    sender: broadcast::Sender<SyncEvent>,
}

impl BroadcastSink {
    /// Create a sink buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventSink for BroadcastSink {
    fn publish(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }
}

/// Writes each event to the `tracing` log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn publish(&self, event: SyncEvent) {
        let task = event.task_id.map(|id| id.to_string()).unwrap_or_default();
        let collection = event
            .collection
            .as_ref()
            .map(Collection::as_str)
            .unwrap_or_default();

        match event.kind {
            EventKind::TaskFailed => {
                error!(event = %event.kind, task_id = %task, collection, detail = %event.detail, "sync event")
            }
            EventKind::TaskRetryScheduled => {
                warn!(event = %event.kind, task_id = %task, collection, detail = %event.detail, "sync event")
            }
            _ => info!(event = %event.kind, task_id = %task, collection, detail = %event.detail, "sync event"),
        }
    }
}
