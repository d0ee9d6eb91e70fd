//! Dual-Lane Task Queue
//!
//! Owns the in-memory pending sets of both lanes and keeps them in step with
//! the durable store. The store is written first; the pending set follows.
//!
//! ## Responsibilities
//! - **Enqueue**: Persist with the next order, insert into the lane, notify, run retention.
//! - **Dispatch**: One pump per lane moves the lowest-order pending task into the
//!   lane's capacity-1 channel. The slot is reserved before a task is popped, so at
//!   most one task per lane waits for its consumer.
//! - **Recovery & Replay**: Reset interrupted `Processing` rows at startup and
//!   re-insert `Pending` and retriable `Failed` rows.
//! - **Admin**: Retry, remove and reorder, each writing the store and the lane.

use super::events::TaskEvents;
use super::lanes::PendingLane;
use super::retention::RetentionPolicy;
use crate::store::{StoreError, TaskStore};
use crate::tasks::{Lane, TaskId, TaskPayload, TaskProgress, TaskRecord, TaskStatus};

use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error("cannot {action} task {id} while it is {from}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        action: &'static str,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

struct LaneState {
    /// Tasks waiting for the pump, lowest order first.
    pending: PendingLane,
    /// Producer end of the capacity-1 channel, used by the pump only.
    sender: mpsc::Sender<TaskRecord>,
    /// Consumer end, handed out once by `take_receiver`.
    receiver: Mutex<Option<mpsc::Receiver<TaskRecord>>>,
}

impl LaneState {
    fn new() -> Self {
        let (sender, receiver) = mpsc::channel(1);
        Self {
            pending: PendingLane::new(),
            sender,
            receiver: Mutex::new(Some(receiver)),
        }
    }
}

/// Dual-lane queue in front of the task store.
pub struct TaskQueue {
    /// Source of truth for every record.
    store: Arc<dyn TaskStore>,
    standard: LaneState,
    compute: LaneState,
    /// Fan-out of every status change to the registry.
    events: TaskEvents,
    /// Applied after each enqueue.
    retention: RetentionPolicy,
}

impl TaskQueue {
    /// Creates the queue with empty lanes. Nothing is loaded until recovery runs.
    pub fn new(store: Arc<dyn TaskStore>, retention: RetentionPolicy) -> Arc<Self> {
        Arc::new(Self {
            store,
            standard: LaneState::new(),
            compute: LaneState::new(),
            events: TaskEvents::new(),
            retention,
        })
    }

    fn lane(&self, lane: Lane) -> &LaneState {
        match lane {
            Lane::Standard => &self.standard,
            Lane::ComputeHeavy => &self.compute,
        }
    }

    /// The backing store, for components that read it directly.
    pub fn store(&self) -> &Arc<dyn TaskStore> {
        &self.store
    }

    /// Event bus every write of this queue publishes on.
    pub fn events(&self) -> &TaskEvents {
        &self.events
    }

    /// Hands out the consumer end of a lane's channel. Only the first caller
    /// per lane gets it: each lane has exactly one consumer.
    pub fn take_receiver(&self, lane: Lane) -> Option<mpsc::Receiver<TaskRecord>> {
        self.lane(lane)
            .receiver
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
    }

    /// Tasks waiting in a lane's pending set, in dispatch order.
    pub fn pending(&self, lane: Lane) -> Vec<TaskRecord> {
        self.lane(lane).pending.snapshot()
    }

    /// Current stored record, if the task still exists.
    pub async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, QueueError> {
        Ok(self.store.get(id).await?)
    }

    async fn require(&self, id: TaskId) -> Result<TaskRecord, QueueError> {
        self.store.get(id).await?.ok_or(QueueError::NotFound(id))
    }

    /// Writes a record and tells every subscriber about it.
    pub async fn persist(&self, record: &TaskRecord) -> Result<(), QueueError> {
        self.store.update(record).await?;
        self.events.updated(record);
        Ok(())
    }

    /// Writes a record only while its stored status is still `expected`.
    /// Returns `false`, and publishes nothing, when another writer got there first.
    pub async fn persist_if(&self, record: &TaskRecord, expected: TaskStatus) -> Result<bool, QueueError> {
        if !self.store.update_if(record, expected).await? {
            return Ok(false);
        }
        self.events.updated(record);
        Ok(true)
    }

    /// Persists a new `Pending` task, puts it on its lane and runs retention.
    pub async fn enqueue(&self, payload: TaskPayload) -> Result<TaskRecord, QueueError> {
        let record = self.store.insert(payload).await?;
        tracing::info!(
            "Enqueued task {} ({}) on {} lane with order {}",
            record.id,
            record.payload.kind(),
            record.lane(),
            record.order
        );

        self.lane(record.lane()).pending.insert(record.clone());
        self.events.updated(&record);
        self.apply_retention().await;

        Ok(record)
    }

    /// Runs retention and evicts whatever it deleted. Failures are logged;
    /// the next enqueue tries again.
    pub async fn apply_retention(&self) -> Vec<TaskId> {
        match self.retention.cleanup(self.store.as_ref()).await {
            Ok(removed) => {
                for id in &removed {
                    for lane in Lane::ALL {
                        self.lane(lane).pending.remove(*id);
                    }
                    self.events.removed(*id);
                }
                removed
            }
            Err(e) => {
                tracing::error!("Retention cleanup failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Startup only: every `Processing` row belongs to a run that no longer
    /// exists, so it goes back to `Pending`.
    pub async fn recover_interrupted(&self) -> Result<usize, QueueError> {
        let interrupted = self.store.list_by_status(&[TaskStatus::Processing]).await?;
        let count = interrupted.len();

        for mut record in interrupted {
            tracing::warn!("Task {} was interrupted, resetting to pending", record.id);
            record.status = TaskStatus::Pending;
            record.last_keep_alive = None;
            self.persist(&record).await?;
        }

        Ok(count)
    }

    /// Re-inserts every `Pending` task and every `Failed` task that still has
    /// retries left. Safe to call repeatedly: the pending set deduplicates and
    /// consumers skip anything that stopped being `Pending`.
    pub async fn replay_pending_or_failed(&self) -> Result<usize, QueueError> {
        let candidates = self
            .store
            .list_by_status(&[TaskStatus::Pending, TaskStatus::Failed])
            .await?;

        let mut replayed = 0;
        for mut record in candidates {
            match record.status {
                TaskStatus::Pending => {}
                TaskStatus::Failed if record.can_retry() => {
                    tracing::info!(
                        "Replaying failed task {} (retry {} of {})",
                        record.id,
                        record.retry_count,
                        record.payload.retry_for()
                    );
                    record.status = TaskStatus::Pending;
                    if !self.persist_if(&record, TaskStatus::Failed).await? {
                        tracing::debug!("Task {} changed during replay, skipped", record.id);
                        continue;
                    }
                }
                _ => continue,
            }

            self.lane(record.lane()).pending.insert(record);
            replayed += 1;
        }

        Ok(replayed)
    }

    /// Calls `replay_pending_or_failed` every `every` until shutdown.
    pub async fn run_replay_loop(self: Arc<Self>, every: Duration, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match self.replay_pending_or_failed().await {
                        Ok(n) => tracing::trace!("Replay pass re-queued {} tasks", n),
                        Err(e) => tracing::error!("Replay pass failed: {}", e),
                    }
                }
            }
        }
    }

    /// Feeds one lane's channel until shutdown.
    pub async fn run_pump(self: Arc<Self>, lane: Lane, shutdown: CancellationToken) {
        let state = self.lane(lane);
        let sender = state.sender.clone();
        tracing::info!("Pump for {} lane started", lane);

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = sender.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let Some(record) = state.pending.next(&shutdown).await else {
                break;
            };
            tracing::debug!("Dispatching task {} on {} lane", record.id, lane);
            permit.send(record);
        }

        tracing::info!("Pump for {} lane stopped", lane);
    }

    /// Manual retry of a `Failed` or `Canceled` task. Starts a fresh retry budget.
    pub async fn retry(&self, id: TaskId) -> Result<TaskRecord, QueueError> {
        let mut record = self.require(id).await?;
        let from = record.status;
        if !matches!(from, TaskStatus::Failed | TaskStatus::Canceled) {
            return Err(QueueError::InvalidTransition {
                id,
                from,
                action: "retry",
            });
        }

        record.status = TaskStatus::Pending;
        record.retry_count = 0;
        record.progress = TaskProgress::default();
        record.last_error = None;
        if !self.persist_if(&record, from).await? {
            return Err(self.moved_on(id, "retry").await);
        }
        self.lane(record.lane()).pending.insert(record.clone());

        tracing::info!("Task {} queued again by manual retry", id);
        Ok(record)
    }

    /// Deletes a task that is not running.
    pub async fn remove(&self, id: TaskId) -> Result<(), QueueError> {
        let record = self.require(id).await?;
        if record.status == TaskStatus::Processing {
            return Err(QueueError::InvalidTransition {
                id,
                from: record.status,
                action: "remove",
            });
        }

        self.store.delete(&[id]).await?;
        self.lane(record.lane()).pending.remove(id);
        self.events.removed(id);

        tracing::info!("Task {} removed", id);
        Ok(())
    }

    /// Moves a pending task to `new_order`. If another task holds that order
    /// the two swap, written to the store as one batch.
    pub async fn reorder(&self, id: TaskId, new_order: i64) -> Result<TaskRecord, QueueError> {
        let mut record = self.require(id).await?;
        if record.status != TaskStatus::Pending {
            return Err(QueueError::InvalidTransition {
                id,
                from: record.status,
                action: "reorder",
            });
        }
        if record.order == new_order {
            return Ok(record);
        }

        let previous = record.order;
        record.order = new_order;
        let mut changed = vec![(record.clone(), TaskStatus::Pending)];
        if let Some(mut occupant) = self.store.find_by_order(new_order).await? {
            let status = occupant.status;
            if status == TaskStatus::Processing {
                return Err(QueueError::InvalidTransition {
                    id: occupant.id,
                    from: status,
                    action: "swap order of",
                });
            }
            occupant.order = previous;
            changed.push((occupant, status));
        }

        // Conditional so a task claimed meanwhile is never written back as Pending.
        if !self.store.update_many_if(&changed).await? {
            return Err(self.moved_on(id, "reorder").await);
        }
        for (task, _) in &changed {
            if task.status == TaskStatus::Pending {
                self.lane(task.lane()).pending.insert(task.clone());
            }
            self.events.updated(task);
        }

        tracing::info!("Task {} moved from order {} to {}", id, previous, new_order);
        Ok(record)
    }

    /// Error for an admin write that lost a race with another writer.
    async fn moved_on(&self, id: TaskId, action: &'static str) -> QueueError {
        match self.store.get(id).await {
            Ok(Some(current)) => QueueError::InvalidTransition {
                id,
                from: current.status,
                action,
            },
            Ok(None) => QueueError::NotFound(id),
            Err(e) => QueueError::Store(e),
        }
    }
}
