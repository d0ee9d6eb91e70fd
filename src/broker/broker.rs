//! Remote Work Broker
//!
//! Turns the compute-heavy lane into a lease pool for pull-based workers.
//!
//! ## Flow
//! 1. `get_task` adds one permit to the request semaphore and waits (bounded)
//!    on the distribution channel.
//! 2. The distribution loop takes a permit, reads one task from the lane,
//!    marks it `Processing`, records a lease and republishes it.
//! 3. The requester claims the lease it received; from then on the worker
//!    must send keepalives.
//! 4. The reaper fails claimed leases that have been silent for longer than
//!    the staleness window.
//!
//! The lease table sits behind one mutex. Decisions are taken under the lock,
//! store writes happen after it is released. Keepalive progress events are
//! the one publish made under the lock.

use crate::executor::CancelCurrent;
use crate::queue::{QueueError, TaskQueue};
use crate::tasks::{TaskId, TaskProgress, TaskRecord, TaskStatus, now_ms};

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeasePolicy {
    /// Silence after which a claimed lease is failed.
    pub staleness: Duration,
    /// Pause between reaper passes.
    pub reaper_interval: Duration,
    /// Upper bound on how long `get_task` waits for work.
    pub get_task_timeout: Duration,
}

impl Default for LeasePolicy {
    fn default() -> Self {
        Self {
            staleness: Duration::from_secs(60),
            reaper_interval: Duration::from_secs(10),
            get_task_timeout: Duration::from_secs(10),
        }
    }
}

/// A task handed to a remote worker.
#[derive(Debug, Clone)]
pub struct Lease {
    /// The `Processing` record, carrying the latest relayed progress.
    pub record: TaskRecord,
    /// When the lease was opened, in ms since the epoch.
    pub created_at: u64,
    /// Last keepalive (or the claim itself), in ms since the epoch.
    pub last_keep_alive: u64,
    /// Set once a requester actually received the task.
    pub claimed: bool,
}

/// Lease pool serving the compute-heavy lane to remote workers.
pub struct RemoteWorkBroker {
    queue: Arc<TaskQueue>,
    policy: LeasePolicy,
    /// One permit per `get_task` call currently waiting.
    requests: Semaphore,
    leases: Mutex<HashMap<TaskId, Lease>>,
    distribution_tx: mpsc::UnboundedSender<TaskRecord>,
    distribution_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<TaskRecord>>,
}

impl RemoteWorkBroker {
    /// Creates the broker. Call `run_distribution` and `run_reaper` to start it.
    pub fn new(queue: Arc<TaskQueue>, policy: LeasePolicy) -> Arc<Self> {
        let (distribution_tx, distribution_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            queue,
            policy,
            requests: Semaphore::new(0),
            leases: Mutex::new(HashMap::new()),
            distribution_tx,
            distribution_rx: tokio::sync::Mutex::new(distribution_rx),
        })
    }

    /// Timing the broker was created with.
    pub fn policy(&self) -> LeasePolicy {
        self.policy
    }

    fn leases(&self) -> MutexGuard<'_, HashMap<TaskId, Lease>> {
        self.leases.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open leases, claimed or not.
    pub fn lease_count(&self) -> usize {
        self.leases().len()
    }

    /// The record behind a claimed lease.
    pub fn leased(&self, id: TaskId) -> Option<TaskRecord> {
        self.leases()
            .get(&id)
            .filter(|lease| lease.claimed)
            .map(|lease| lease.record.clone())
    }

    /// Moves tasks from the compute lane to waiting requesters.
    pub async fn run_distribution(
        self: Arc<Self>,
        mut lane: mpsc::Receiver<TaskRecord>,
        shutdown: CancellationToken,
    ) {
        tracing::info!("Remote work broker started");

        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = self.requests.acquire() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            permit.forget();

            let queued = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = lane.recv() => match next {
                    Some(record) => record,
                    None => break,
                },
            };

            match self.open_lease(queued).await {
                Ok(Some(record)) => {
                    if self.distribution_tx.send(record).is_err() {
                        break;
                    }
                }
                Ok(None) => self.requests.add_permits(1),
                Err(e) => {
                    tracing::error!("Failed to lease task: {}", e);
                    self.requests.add_permits(1);
                }
            }
        }

        tracing::info!("Remote work broker stopped");
    }

    async fn open_lease(&self, queued: TaskRecord) -> Result<Option<TaskRecord>, QueueError> {
        let mut record = match self.queue.get(queued.id).await? {
            Some(record) if record.status == TaskStatus::Pending => record,
            _ => {
                tracing::debug!("Skipping task {}: no longer pending", queued.id);
                return Ok(None);
            }
        };

        let now = now_ms();
        record.status = TaskStatus::Processing;
        record.progress = TaskProgress::default();
        record.last_keep_alive = Some(now);
        if !self.queue.persist_if(&record, TaskStatus::Pending).await? {
            tracing::debug!("Skipping task {}: claimed or changed meanwhile", record.id);
            return Ok(None);
        }

        self.leases().insert(
            record.id,
            Lease {
                record: record.clone(),
                created_at: now,
                last_keep_alive: now,
                claimed: false,
            },
        );
        tracing::info!("Leased task {} for remote execution", record.id);
        Ok(Some(record))
    }

    /// Waits up to `get_task_timeout` for a task. `None` means "poll again".
    pub async fn get_task(&self) -> Option<TaskRecord> {
        self.requests.add_permits(1);

        let handoff = tokio::time::timeout(self.policy.get_task_timeout, async {
            let mut distribution = self.distribution_rx.lock().await;
            loop {
                let record = distribution.recv().await?;
                if let Some(claimed) = self.claim(record.id) {
                    return Some(claimed);
                }
                // Lease ended while the task sat in the channel; ask again.
                self.requests.add_permits(1);
            }
        })
        .await;

        match handoff {
            Ok(Some(record)) => Some(record),
            _ => {
                if let Ok(permit) = self.requests.try_acquire() {
                    permit.forget();
                }
                None
            }
        }
    }

    fn claim(&self, id: TaskId) -> Option<TaskRecord> {
        let mut leases = self.leases();
        let lease = leases.get_mut(&id)?;
        lease.claimed = true;
        lease.last_keep_alive = now_ms();
        Some(lease.record.clone())
    }

    /// Refreshes a lease. `false` tells the worker to abandon the task.
    ///
    /// Progress is published while the lease lock is held. `complete`, `fail`
    /// and the reaper remove the lease under that lock before publishing the
    /// final status, so a progress event can never arrive after it.
    pub fn keep_alive(&self, id: TaskId, progress: Option<TaskProgress>) -> bool {
        let mut leases = self.leases();
        let Some(lease) = leases.get_mut(&id).filter(|lease| lease.claimed) else {
            return false;
        };
        let now = now_ms();
        lease.last_keep_alive = now;
        lease.record.last_keep_alive = Some(now);
        if let Some(progress) = progress {
            lease.record.progress = progress;
            self.queue.events().updated(&lease.record);
        }
        drop(leases);

        tracing::trace!("Keepalive for task {}", id);
        true
    }

    fn take_lease(&self, id: TaskId) -> Option<Lease> {
        self.leases().remove(&id)
    }

    /// Worker delivered the result. Returns `false` if the lease was gone.
    pub async fn complete(&self, id: TaskId) -> Result<bool, QueueError> {
        let Some(lease) = self.take_lease(id) else {
            return Ok(false);
        };

        let mut record = lease.record;
        record.status = TaskStatus::Completed;
        record.processed_at = Some(now_ms());
        record.last_error = None;
        self.queue.persist(&record).await?;

        tracing::info!("Remote task {} completed", id);
        Ok(true)
    }

    /// Worker gave up on the task.
    pub async fn fail(&self, id: TaskId, message: &str) -> Result<bool, QueueError> {
        let Some(lease) = self.take_lease(id) else {
            return Ok(false);
        };

        self.record_failure(lease.record, message).await?;
        Ok(true)
    }

    async fn record_failure(&self, mut record: TaskRecord, message: &str) -> Result<(), QueueError> {
        record.status = TaskStatus::Failed;
        record.processed_at = Some(now_ms());
        record.retry_count += 1;
        record.last_error = Some(message.to_string());
        tracing::warn!(
            "Remote task {} failed (attempt {}/{}): {}",
            record.id,
            record.retry_count,
            record.payload.retry_for(),
            message
        );
        self.queue.persist(&record).await
    }

    /// One reaper pass. Returns the ids whose leases expired.
    pub async fn reap_expired(&self) -> Vec<TaskId> {
        let staleness = self.policy.staleness.as_millis() as u64;
        let now = now_ms();

        let expired: Vec<Lease> = {
            let mut leases = self.leases();
            let ids: Vec<TaskId> = leases
                .iter()
                .filter(|(_, lease)| lease.claimed && now.saturating_sub(lease.last_keep_alive) > staleness)
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| leases.remove(id)).collect()
        };

        let mut reaped = Vec::with_capacity(expired.len());
        for lease in expired {
            let id = lease.record.id;
            tracing::warn!(
                "Lease for task {} expired ({} ms since last keepalive)",
                id,
                now.saturating_sub(lease.last_keep_alive)
            );
            if let Err(e) = self.record_failure(lease.record, "lease expired").await {
                tracing::error!("Failed to record expiry of task {}: {}", id, e);
            }
            reaped.push(id);
        }
        reaped
    }

    /// Runs `reap_expired` every `reaper_interval` until shutdown.
    pub async fn run_reaper(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.policy.reaper_interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let reaped = self.reap_expired().await;
                    if !reaped.is_empty() {
                        tracing::info!("Reaper failed {} stale leases", reaped.len());
                    }
                }
            }
        }
    }
}

#[async_trait]
impl CancelCurrent for RemoteWorkBroker {
    async fn cancel_current(&self, expected: TaskId) -> bool {
        let Some(lease) = self.take_lease(expected) else {
            return false;
        };

        let mut record = lease.record;
        record.status = TaskStatus::Canceled;
        record.processed_at = Some(now_ms());
        if let Err(e) = self.queue.persist(&record).await {
            tracing::error!("Failed to record cancellation of task {}: {}", expected, e);
        }
        tracing::info!("Lease for task {} canceled", expected);
        true
    }
}
