use super::engine::Engine;
use crate::queue::handlers::{
    ApiResult, error_response, handle_enqueue, handle_remove, handle_reorder, handle_retry,
};
use crate::queue::protocol::*;
use crate::registry::handlers::{handle_get_task, handle_list_tasks, handle_stats};
use crate::tasks::TaskId;
use crate::transfer::handlers::*;
use crate::transfer::protocol::*;

use axum::{
    Extension, Json, Router,
    extract::{DefaultBodyLimit, Path},
    routing::{get, post},
};
use std::sync::Arc;

pub async fn handle_cancel(
    Extension(engine): Extension<Arc<Engine>>,
    Path(task_id): Path<i64>,
) -> ApiResult<CancelTaskResponse> {
    engine
        .cancel(TaskId(task_id))
        .await
        .map(Json)
        .map_err(error_response)
}

/// Admin API, plus the worker protocol when the broker is running.
pub fn router(engine: &Arc<Engine>) -> Router {
    let mut app = Router::new()
        .route(ENDPOINT_TASKS, get(handle_list_tasks).post(handle_enqueue))
        .route(ENDPOINT_TASK_STATS, get(handle_stats))
        .route(ENDPOINT_TASK, get(handle_get_task).delete(handle_remove))
        .route(ENDPOINT_TASK_RETRY, post(handle_retry))
        .route(ENDPOINT_TASK_REORDER, post(handle_reorder))
        .route(ENDPOINT_TASK_CANCEL, post(handle_cancel));

    if let Some(service) = engine.worker_service() {
        let input_file = format!("{}/:task_id", ENDPOINT_INPUT_FILE);
        let input_chunk = format!("{}/:task_id/:chunk", ENDPOINT_INPUT_CHUNK);

        app = app
            .route(ENDPOINT_CHECK_CONNECTION, get(handle_check_connection))
            .route(ENDPOINT_REQUEST_TASK, post(handle_request_task))
            .route(ENDPOINT_KEEP_ALIVE, post(handle_keep_alive))
            .route(&input_file, get(handle_input_file))
            .route(&input_chunk, get(handle_input_chunk))
            .route(
                ENDPOINT_UPLOAD_RESULT,
                post(handle_upload_result).layer(DefaultBodyLimit::disable()),
            )
            .route(ENDPOINT_REPORT_FAILURE, post(handle_report_failure))
            .layer(Extension(service.clone()));
    }

    app.layer(Extension(engine.queue().clone()))
        .layer(Extension(engine.registry().clone()))
        .layer(Extension(engine.clone()))
}
