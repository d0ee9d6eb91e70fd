//! Admin API Definitions
//!
//! Endpoints and DTOs of the HTTP surface used to manage the queue. Listing
//! and stats are served from the live registry, everything that mutates goes
//! through the queue (or the engine for cancellation).

use crate::tasks::{Lane, TaskId, TaskStatus};
use serde::{Deserialize, Serialize};

pub const ENDPOINT_TASKS: &str = "/api/tasks";
pub const ENDPOINT_TASK: &str = "/api/tasks/:id";
pub const ENDPOINT_TASK_RETRY: &str = "/api/tasks/:id/retry";
pub const ENDPOINT_TASK_REORDER: &str = "/api/tasks/:id/reorder";
pub const ENDPOINT_TASK_CANCEL: &str = "/api/tasks/:id/cancel";
pub const ENDPOINT_TASK_STATS: &str = "/api/tasks/stats";

#[derive(Debug, Serialize, Deserialize)]
pub struct ReorderRequest {
    pub order: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListTasksQuery {
    pub lane: Option<Lane>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RemoveTaskResponse {
    pub task_id: TaskId,
    pub removed: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelTaskResponse {
    pub task_id: TaskId,
    pub canceled: bool,
    pub status: Option<TaskStatus>,
}
