//! An event sink that remembers everything it was given.

use std::sync::Arc;

use parking_lot::Mutex;

use driftsync::{EventKind, EventSink, SyncEvent, TaskId};

/// Records scheduler events for later assertions. Clones share the log.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    events: Arc<Mutex<Vec<SyncEvent>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event so far, in publish order.
    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().iter().map(|e| e.kind).collect()
    }

    /// Events of one kind.
    pub fn count(&self, kind: EventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }

    /// Event kinds published for one task.
    pub fn kinds_for(&self, id: TaskId) -> Vec<EventKind> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.task_id == Some(id))
            .map(|e| e.kind)
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for RecordingSink {
    fn publish(&self, event: SyncEvent) {
        self.events.lock().push(event);
    }
}
