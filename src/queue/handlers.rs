use super::protocol::*;
use super::queue::{QueueError, TaskQueue};
use crate::tasks::{TaskId, TaskPayload, TaskRecord};

use axum::{Extension, Json, extract::Path, http::StatusCode};
use std::sync::Arc;

pub type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorResponse>)>;

/// 404 for unknown tasks, 409 for refused transitions.
pub fn error_status(err: &QueueError) -> StatusCode {
    match err {
        QueueError::NotFound(_) => StatusCode::NOT_FOUND,
        QueueError::InvalidTransition { .. } => StatusCode::CONFLICT,
        QueueError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn error_response(err: QueueError) -> (StatusCode, Json<ErrorResponse>) {
    let status = error_status(&err);
    if status.is_server_error() {
        tracing::error!("Queue request failed: {}", err);
    } else {
        tracing::debug!("Queue request rejected: {}", err);
    }
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

pub async fn handle_enqueue(
    Extension(queue): Extension<Arc<TaskQueue>>,
    Json(payload): Json<TaskPayload>,
) -> ApiResult<TaskRecord> {
    queue.enqueue(payload).await.map(Json).map_err(error_response)
}

pub async fn handle_retry(
    Extension(queue): Extension<Arc<TaskQueue>>,
    Path(task_id): Path<i64>,
) -> ApiResult<TaskRecord> {
    queue
        .retry(TaskId(task_id))
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn handle_remove(
    Extension(queue): Extension<Arc<TaskQueue>>,
    Path(task_id): Path<i64>,
) -> ApiResult<RemoveTaskResponse> {
    let task_id = TaskId(task_id);
    queue.remove(task_id).await.map_err(error_response)?;
    Ok(Json(RemoveTaskResponse {
        task_id,
        removed: true,
    }))
}

pub async fn handle_reorder(
    Extension(queue): Extension<Arc<TaskQueue>>,
    Path(task_id): Path<i64>,
    Json(req): Json<ReorderRequest>,
) -> ApiResult<TaskRecord> {
    queue
        .reorder(TaskId(task_id), req.order)
        .await
        .map(Json)
        .map_err(error_response)
}
