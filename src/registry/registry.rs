use crate::queue::TaskEvent;
use crate::store::{StoreError, TaskStore};
use crate::tasks::{Lane, TaskId, TaskRecord, TaskStatus};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

/// Per-status counts over all known tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub canceled: usize,
}

/// In-memory copy of the task table, keyed by id.
///
/// Entries are owned copies; readers get clones and never observe a record
/// that is being mutated elsewhere.
pub struct LiveRegistry {
    tasks: DashMap<TaskId, TaskRecord>,
}

impl LiveRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            tasks: DashMap::new(),
        })
    }

    /// Replaces the contents with the store's current rows.
    pub async fn seed(&self, store: &dyn TaskStore) -> Result<usize, StoreError> {
        let records = store.list_all().await?;
        let live: HashSet<TaskId> = records.iter().map(|r| r.id).collect();

        self.tasks.retain(|id, _| live.contains(id));
        for record in records {
            self.tasks.insert(record.id, record);
        }

        tracing::debug!("Registry seeded with {} tasks", self.tasks.len());
        Ok(self.tasks.len())
    }

    /// Applies one status-change event, last write wins.
    pub fn apply(&self, event: TaskEvent) {
        match event {
            TaskEvent::Updated(record) => {
                tracing::trace!("Registry: task {} is {}", record.id, record.status);
                self.tasks.insert(record.id, record);
            }
            TaskEvent::Removed(id) => {
                tracing::trace!("Registry: task {} removed", id);
                self.tasks.remove(&id);
            }
        }
    }

    /// Follows the event bus until shutdown. Reseeds from the store when the
    /// subscription falls behind.
    pub async fn run(
        self: Arc<Self>,
        store: Arc<dyn TaskStore>,
        mut events: broadcast::Receiver<TaskEvent>,
        shutdown: CancellationToken,
    ) {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Ok(event) => self.apply(event),
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!("Registry missed {} events, reseeding", missed);
                    if let Err(e) = self.seed(store.as_ref()).await {
                        tracing::error!("Failed to reseed registry: {}", e);
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }

        tracing::debug!("Registry loop stopped");
    }

    /// Copy of the current view of one task.
    pub fn get(&self, id: TaskId) -> Option<TaskRecord> {
        self.tasks.get(&id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Tasks of one lane sorted by order, then creation time.
    pub fn lane_tasks(&self, lane: Lane) -> Vec<TaskRecord> {
        let mut tasks: Vec<TaskRecord> = self
            .tasks
            .iter()
            .filter(|entry| entry.value().lane() == lane)
            .map(|entry| entry.value().clone())
            .collect();
        tasks.sort_by_key(TaskRecord::sort_key);
        tasks
    }

    /// Standard lane, sorted by order.
    pub fn standard_tasks(&self) -> Vec<TaskRecord> {
        self.lane_tasks(Lane::Standard)
    }

    /// Compute-heavy lane, sorted by order.
    pub fn compute_tasks(&self) -> Vec<TaskRecord> {
        self.lane_tasks(Lane::ComputeHeavy)
    }

    /// Both lanes, standard first.
    pub fn all_tasks(&self) -> Vec<TaskRecord> {
        let mut tasks = self.standard_tasks();
        tasks.extend(self.compute_tasks());
        tasks
    }

    /// Per-status counts over every known task.
    pub fn stats(&self) -> TaskStats {
        let mut stats = TaskStats::default();
        for entry in self.tasks.iter() {
            stats.total += 1;
            match entry.value().status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Processing => stats.processing += 1,
                TaskStatus::Completed => stats.completed += 1,
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Canceled => stats.canceled += 1,
            }
        }
        stats
    }
}
