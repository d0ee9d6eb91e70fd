//! Local Lane Executor
//!
//! Single consumer of one lane's channel. Runs every task in-process and
//! records the outcome.
//!
//! ## Responsibilities
//! - **Claiming**: Re-reads the task and skips it unless it is still `Pending`.
//! - **Execution**: Invokes the payload with a per-task cancellation token; panics are caught.
//! - **Outcome**: `Completed`, `Failed` (retry count + last error) or `Canceled`.
//! - **Cancellation**: `cancel_current` only fires for the task the caller expects.

use super::CancelCurrent;
use crate::queue::TaskQueue;
use crate::tasks::{
    Lane, ProgressFn, TaskContext, TaskEnvironment, TaskId, TaskProgress, TaskRecord, TaskStatus,
    now_ms,
};

use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How a single run ended.
enum Outcome {
    Completed,
    Failed(String),
    Canceled,
    Interrupted,
}

/// Single consumer of one lane, running each task in-process.
pub struct LocalExecutor {
    lane: Lane,
    queue: Arc<TaskQueue>,
    environment: Arc<dyn TaskEnvironment>,
    /// Task under execution and the token that cancels it.
    current: Mutex<Option<(TaskId, CancellationToken)>>,
}

impl LocalExecutor {
    pub fn new(lane: Lane, queue: Arc<TaskQueue>, environment: Arc<dyn TaskEnvironment>) -> Arc<Self> {
        Arc::new(Self {
            lane,
            queue,
            environment,
            current: Mutex::new(None),
        })
    }

    pub fn lane(&self) -> Lane {
        self.lane
    }

    /// Task being executed right now, if any.
    pub fn current_task(&self) -> Option<TaskId> {
        self.current
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|(id, _)| *id))
    }

    /// Consumes the lane until shutdown. A task's failure never ends the loop.
    pub async fn run(self: Arc<Self>, mut tasks: mpsc::Receiver<TaskRecord>, shutdown: CancellationToken) {
        tracing::info!("{} executor started", self.lane);

        loop {
            let queued = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = tasks.recv() => match next {
                    Some(record) => record,
                    None => break,
                },
            };
            self.process(queued, &shutdown).await;
        }

        tracing::info!("{} executor stopped", self.lane);
    }

    async fn process(&self, queued: TaskRecord, shutdown: &CancellationToken) {
        let mut record = match self.queue.get(queued.id).await {
            Ok(Some(record)) if record.status == TaskStatus::Pending => record,
            Ok(Some(record)) => {
                tracing::debug!("Skipping task {}: now {}", record.id, record.status);
                return;
            }
            Ok(None) => {
                tracing::debug!("Skipping task {}: removed", queued.id);
                return;
            }
            Err(e) => {
                tracing::error!("Failed to load task {}: {}", queued.id, e);
                return;
            }
        };

        record.status = TaskStatus::Processing;
        record.progress = TaskProgress::default();
        match self.queue.persist_if(&record, TaskStatus::Pending).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!("Skipping task {}: claimed or changed meanwhile", record.id);
                return;
            }
            Err(e) => {
                tracing::error!("Failed to mark task {} as processing: {}", record.id, e);
                return;
            }
        }
        tracing::info!("Executing task {} ({})", record.id, record.payload.kind());

        let token = CancellationToken::new();
        self.set_current(Some((record.id, token.clone())));

        let live = Arc::new(Mutex::new(record.clone()));
        let ctx = TaskContext::new(
            record.id,
            token.clone(),
            self.environment.clone(),
            self.progress_sink(live.clone()),
        );

        let outcome = tokio::select! {
            result = AssertUnwindSafe(record.payload.execute(&ctx)).catch_unwind() => match result {
                Ok(Ok(())) => Outcome::Completed,
                Ok(Err(_)) if token.is_cancelled() => Outcome::Canceled,
                Ok(Err(e)) => Outcome::Failed(format!("{:#}", e)),
                Err(panic) => Outcome::Failed(panic_message(panic.as_ref())),
            },
            _ = shutdown.cancelled() => {
                token.cancel();
                Outcome::Interrupted
            }
        };

        self.set_current(None);
        if let Ok(latest) = live.lock() {
            record.progress = latest.progress.clone();
        }

        match outcome {
            Outcome::Completed => {
                record.status = TaskStatus::Completed;
                record.processed_at = Some(now_ms());
                record.last_error = None;
                tracing::info!("Task {} completed", record.id);
            }
            Outcome::Failed(message) => {
                record.status = TaskStatus::Failed;
                record.processed_at = Some(now_ms());
                record.retry_count += 1;
                tracing::warn!(
                    "Task {} failed (attempt {}/{}): {}",
                    record.id,
                    record.retry_count,
                    record.payload.retry_for(),
                    message
                );
                record.last_error = Some(message);
            }
            Outcome::Canceled => {
                record.status = TaskStatus::Canceled;
                record.processed_at = Some(now_ms());
                tracing::info!("Task {} canceled", record.id);
            }
            Outcome::Interrupted => {
                // Left `Processing`: startup recovery picks it up again.
                tracing::warn!("Task {} interrupted by shutdown", record.id);
                return;
            }
        }

        if let Err(e) = self.queue.persist(&record).await {
            tracing::error!("Failed to record outcome of task {}: {}", record.id, e);
        }
    }

    fn set_current(&self, value: Option<(TaskId, CancellationToken)>) {
        if let Ok(mut slot) = self.current.lock() {
            *slot = value;
        }
    }

    /// Progress callback: updates the live copy and publishes it.
    fn progress_sink(&self, live: Arc<Mutex<TaskRecord>>) -> ProgressFn {
        let events = self.queue.events().clone();
        Arc::new(move |progress: TaskProgress| {
            if let Ok(mut record) = live.lock() {
                record.progress = progress;
                events.updated(&record);
            }
        })
    }
}

#[async_trait]
impl CancelCurrent for LocalExecutor {
    async fn cancel_current(&self, expected: TaskId) -> bool {
        let Ok(slot) = self.current.lock() else {
            return false;
        };
        match slot.as_ref() {
            Some((running, token)) if *running == expected => {
                tracing::info!("Cancel requested for running task {}", expected);
                token.cancel();
                true
            }
            _ => false,
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("task panicked: {}", message)
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("task panicked: {}", message)
    } else {
        "task panicked".to_string()
    }
}
