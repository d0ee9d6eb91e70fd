//! Status-change fan-out.
//!
//! Every component that mutates a task publishes the new copy of the record
//! here. Subscribers apply events last-write-wins; a subscriber that falls
//! behind gets `Lagged` from the broadcast channel and is expected to reseed
//! from the store.

use crate::tasks::{TaskId, TaskRecord};

use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// The task was inserted or changed (status, order, progress, retries).
    Updated(TaskRecord),
    /// The task left the store (retention or explicit removal).
    Removed(TaskId),
}

impl TaskEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            TaskEvent::Updated(record) => record.id,
            TaskEvent::Removed(id) => *id,
        }
    }
}

#[derive(Clone)]
pub struct TaskEvents {
    sender: broadcast::Sender<TaskEvent>,
}

impl TaskEvents {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    /// Sends to every subscriber.
    pub fn publish(&self, event: TaskEvent) {
        // No subscribers is fine; events are advisory.
        let _ = self.sender.send(event);
    }

    pub fn updated(&self, record: &TaskRecord) {
        self.publish(TaskEvent::Updated(record.clone()));
    }

    pub fn removed(&self, id: TaskId) {
        self.publish(TaskEvent::Removed(id));
    }

    /// Receives every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.sender.subscribe()
    }
}

impl Default for TaskEvents {
    fn default() -> Self {
        Self::new()
    }
}
