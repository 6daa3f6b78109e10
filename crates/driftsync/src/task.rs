//! Task model: what callers enqueue and what they get back from `status`.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use driftsync_core::{Collection, Direction, ErrorClass, Priority};
use driftsync_sync::SyncError;

use crate::error::SchedulerError;

/// Identifier assigned by the scheduler at enqueue time.
///
/// Ids are handed out in increasing order, so they also record enqueue order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// What to sync. Passed to [`SyncScheduler::enqueue`](crate::SyncScheduler::enqueue).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncTaskSpec {
    pub collection: Collection,
    pub direction: Direction,
    #[serde(default)]
    pub priority: Priority,
    /// Deferred while the network is metered, if the policy says so.
    #[serde(default)]
    pub large_payload: bool,
}

impl SyncTaskSpec {
    pub fn new(collection: Collection, direction: Direction) -> Self {
        Self {
            collection,
            direction,
            priority: Priority::default(),
            large_payload: false,
        }
    }

    /// Parse a JSON task spec, e.g. `{"collection":"diaries","direction":"pull"}`.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json).map_err(|e| SchedulerError::InvalidSpec(e.to_string()))
    }

    pub fn pull(collection: Collection) -> Self {
        Self::new(collection, Direction::Pull)
    }

    pub fn push(collection: Collection) -> Self {
        Self::new(collection, Direction::Push)
    }

    pub fn bidirectional(collection: Collection) -> Self {
        Self::new(collection, Direction::Bidirectional)
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_large_payload(mut self, large_payload: bool) -> Self {
        self.large_payload = large_payload;
        self
    }
}

/// Lifecycle state of a task.
///
/// ```text
/// pending -> running -> succeeded
///                    -> failed-retryable -> pending (after backoff)
///                    -> failed-fatal
///                    -> cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    Pending,
    Running,
    Succeeded,
    FailedRetryable,
    FailedFatal,
    Cancelled,
}

impl TaskState {
    /// Terminal states never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::FailedFatal | TaskState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Succeeded => "succeeded",
            TaskState::FailedRetryable => "failed-retryable",
            TaskState::FailedFatal => "failed-fatal",
            TaskState::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified failure recorded on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub class: ErrorClass,
    /// Credentials were rejected; retried under the auth limit.
    pub authentication: bool,
    pub message: String,
}

impl TaskError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            authentication: false,
            message: message.into(),
        }
    }

    /// Classify a sync failure. Returns `None` for cancellation.
    pub fn from_sync(error: &SyncError) -> Option<Self> {
        error.class().map(|class| Self {
            class,
            authentication: error.is_authentication(),
            message: error.to_string(),
        })
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.class)
    }
}

/// Snapshot of a task, as returned by `status` and `wait_for`.
#[derive(Debug, Clone)]
pub struct SyncTask {
    pub id: TaskId,
    pub collection: Collection,
    pub direction: Direction,
    pub priority: Priority,
    pub large_payload: bool,
    pub state: TaskState,
    /// Executions started so far.
    pub attempt: u32,
    /// Authentication failures so far.
    pub auth_failures: u32,
    /// Backoff gate: not retried before this instant.
    pub next_eligible_at: Option<Instant>,
    pub last_error: Option<TaskError>,
    pub enqueued_at: Instant,
    /// When the task reached a terminal state.
    pub finished_at: Option<Instant>,
    /// A caller asked for cancellation while the task was running.
    pub cancel_requested: bool,
    /// Backoff jitter sample in `[0, 1)`, drawn once when the task is added.
    pub(crate) jitter_unit: f64,
}

impl SyncTask {
    pub(crate) fn new(id: TaskId, spec: SyncTaskSpec, now: Instant) -> Self {
        Self {
            id,
            collection: spec.collection,
            direction: spec.direction,
            priority: spec.priority,
            large_payload: spec.large_payload,
            state: TaskState::Pending,
            attempt: 0,
            auth_failures: 0,
            next_eligible_at: None,
            last_error: None,
            enqueued_at: now,
            finished_at: None,
            cancel_requested: false,
            jitter_unit: 0.0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether the backoff gate has passed.
    pub fn is_eligible(&self, now: Instant) -> bool {
        self.next_eligible_at.map_or(true, |at| at <= now)
    }

    pub(crate) fn finish(&mut self, state: TaskState, now: Instant) {
        self.state = state;
        self.next_eligible_at = None;
        self.finished_at = Some(now);
    }
}
