use super::registry::{LiveRegistry, TaskStats};
use crate::queue::protocol::{ErrorResponse, ListTasksQuery};
use crate::tasks::{TaskId, TaskRecord};

use axum::{
    Extension, Json,
    extract::{Path, Query},
    http::StatusCode,
};
use std::sync::Arc;

pub async fn handle_list_tasks(
    Extension(registry): Extension<Arc<LiveRegistry>>,
    Query(query): Query<ListTasksQuery>,
) -> Json<Vec<TaskRecord>> {
    let tasks = match query.lane {
        Some(lane) => registry.lane_tasks(lane),
        None => registry.all_tasks(),
    };
    Json(tasks)
}

pub async fn handle_get_task(
    Extension(registry): Extension<Arc<LiveRegistry>>,
    Path(task_id): Path<i64>,
) -> Result<Json<TaskRecord>, (StatusCode, Json<ErrorResponse>)> {
    match registry.get(TaskId(task_id)) {
        Some(record) => Ok(Json(record)),
        None => {
            tracing::debug!("Task not found: {}", task_id);
            Err((
                StatusCode::NOT_FOUND,
                Json(ErrorResponse {
                    error: format!("task {} not found", task_id),
                }),
            ))
        }
    }
}

pub async fn handle_stats(Extension(registry): Extension<Arc<LiveRegistry>>) -> Json<TaskStats> {
    Json(registry.stats())
}
