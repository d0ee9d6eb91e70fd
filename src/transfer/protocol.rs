//! Worker Wire Protocol
//!
//! Endpoints and DTOs exchanged between the server and remote workers.
//! Control messages are JSON. File contents travel as raw bytes (single
//! chunk) or as a stream of length-delimited bincode [`ChunkFrame`]s.

use crate::tasks::{TaskId, TaskProgress, UpscalerProfile};
use serde::{Deserialize, Serialize};

pub const ENDPOINT_CHECK_CONNECTION: &str = "/worker/ping";
pub const ENDPOINT_REQUEST_TASK: &str = "/worker/request_task";
pub const ENDPOINT_KEEP_ALIVE: &str = "/worker/keep_alive";
pub const ENDPOINT_INPUT_FILE: &str = "/worker/input";
pub const ENDPOINT_INPUT_CHUNK: &str = "/worker/input_chunk";
pub const ENDPOINT_UPLOAD_RESULT: &str = "/worker/upload_result";
pub const ENDPOINT_REPORT_FAILURE: &str = "/worker/report_failure";

pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
pub struct CheckConnectionResponse {
    pub ok: bool,
    pub server_time: u64,
}

/// What a worker needs to run a leased task. `task_id < 0` means there was
/// nothing to hand out and the worker should poll again later.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskDescriptor {
    pub task_id: TaskId,
    pub kind: String,
    pub chapter_id: i64,
    pub profile: Option<UpscalerProfile>,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: u64,
    pub chunk_count: u64,
}

impl TaskDescriptor {
    /// Descriptor meaning "no work right now".
    pub fn none() -> Self {
        Self {
            task_id: TaskId::NONE,
            kind: String::new(),
            chapter_id: 0,
            profile: None,
            file_name: String::new(),
            file_size: 0,
            chunk_size: 0,
            chunk_count: 0,
        }
    }

    pub fn is_none(&self) -> bool {
        self.task_id.is_sentinel()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KeepAliveRequest {
    pub task_id: TaskId,
    pub progress: Option<TaskProgress>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KeepAliveResponse {
    pub alive: bool,
}

/// One numbered slice of a file, tagged with the task it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkFrame {
    pub task_id: TaskId,
    pub chunk_number: u64,
    /// Total number of chunks of the file this frame belongs to.
    pub chunk_count: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UploadOutcome {
    pub task_id: TaskId,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResultResponse {
    pub results: Vec<UploadOutcome>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReportFailureRequest {
    pub task_id: TaskId,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReportFailureResponse {
    pub accepted: bool,
}

/// Number of chunks a file of `file_size` bytes splits into. An empty file
/// is one empty chunk, so it still travels as a frame.
pub fn chunk_count(file_size: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    file_size.div_ceil(chunk_size).max(1)
}
