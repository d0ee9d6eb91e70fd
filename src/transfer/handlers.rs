use super::TransferError;
use super::protocol::*;
use super::service::WorkerService;
use crate::queue::protocol::ErrorResponse;
use crate::tasks::TaskId;

use axum::{Extension, Json, body::Body, extract::Path, http::StatusCode};
use futures::TryStreamExt;
use std::sync::Arc;

type ErrorReply = (StatusCode, Json<ErrorResponse>);

/// HTTP status for a transfer error.
pub fn error_status(err: &TransferError) -> StatusCode {
    match err {
        TransferError::NotLeased(_) | TransferError::UnknownTask(_) => StatusCode::NOT_FOUND,
        TransferError::ChunkOutOfRange { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
        TransferError::MissingChunks { .. }
        | TransferError::CorruptUpload { .. }
        | TransferError::Frame(_) => StatusCode::UNPROCESSABLE_ENTITY,
        TransferError::Io(_) | TransferError::Environment(_) | TransferError::Queue(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_response(err: TransferError) -> ErrorReply {
    let status = error_status(&err);
    if status.is_server_error() {
        tracing::error!("Worker request failed: {}", err);
    } else {
        tracing::debug!("Worker request rejected: {}", err);
    }
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

pub async fn handle_check_connection(
    Extension(service): Extension<Arc<WorkerService>>,
) -> Json<CheckConnectionResponse> {
    Json(service.check_connection())
}

pub async fn handle_request_task(
    Extension(service): Extension<Arc<WorkerService>>,
) -> Json<TaskDescriptor> {
    Json(service.request_task().await)
}

pub async fn handle_keep_alive(
    Extension(service): Extension<Arc<WorkerService>>,
    Json(req): Json<KeepAliveRequest>,
) -> Json<KeepAliveResponse> {
    Json(service.keep_alive(req))
}

/// Streams the whole input file as length-delimited frames.
pub async fn handle_input_file(
    Extension(service): Extension<Arc<WorkerService>>,
    Path(task_id): Path<i64>,
) -> Result<Body, ErrorReply> {
    let frames = service
        .input_stream(TaskId(task_id))
        .await
        .map_err(error_response)?;
    Ok(Body::from_stream(frames))
}

pub async fn handle_input_chunk(
    Extension(service): Extension<Arc<WorkerService>>,
    Path((task_id, chunk_number)): Path<(i64, u64)>,
) -> Result<Vec<u8>, ErrorReply> {
    service
        .input_chunk(TaskId(task_id), chunk_number)
        .await
        .map_err(error_response)
}

pub async fn handle_upload_result(
    Extension(service): Extension<Arc<WorkerService>>,
    body: Body,
) -> Result<Json<UploadResultResponse>, ErrorReply> {
    let stream = body.into_data_stream().map_err(std::io::Error::other);
    service
        .upload_result(stream)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn handle_report_failure(
    Extension(service): Extension<Arc<WorkerService>>,
    Json(req): Json<ReportFailureRequest>,
) -> Result<Json<ReportFailureResponse>, ErrorReply> {
    service
        .report_failure(req)
        .await
        .map(Json)
        .map_err(error_response)
}
