use super::environment::TaskEnvironment;
use super::types::{TaskId, TaskProgress};

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Callback receiving every progress update of a running task.
pub type ProgressFn = Arc<dyn Fn(TaskProgress) + Send + Sync>;

/// Everything a payload gets to see while it runs.
#[derive(Clone)]
pub struct TaskContext {
    task_id: TaskId,
    cancel: CancellationToken,
    environment: Arc<dyn TaskEnvironment>,
    progress: ProgressFn,
}

impl TaskContext {
    pub fn new(
        task_id: TaskId,
        cancel: CancellationToken,
        environment: Arc<dyn TaskEnvironment>,
        progress: ProgressFn,
    ) -> Self {
        Self {
            task_id,
            cancel,
            environment,
            progress,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn environment(&self) -> &Arc<dyn TaskEnvironment> {
        &self.environment
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Cheap check for loops that want to stop between steps.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Publishes progress for the running task. The executor relays it; it is never interpreted.
    pub fn report_progress(&self, current: u64, total: u64, message: impl Into<String>) {
        (self.progress)(TaskProgress {
            current,
            total,
            status_message: message.into(),
        });
    }
}
