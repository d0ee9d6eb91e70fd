//! Worker Transfer Protocol
//!
//! The RPC surface remote workers use: pull a lease, fetch the input file in
//! chunks, send keepalives, upload results and report failures.
//!
//! ## Submodules
//! - **`protocol`**: Endpoints and wire DTOs.
//! - **`chunks`**: Chunk reader, frame codec and upload reassembly.
//! - **`service`**: Server-side operations, independent of HTTP.
//! - **`handlers`**: Axum handlers mapping the service onto HTTP.
//! - **`client`** / **`worker`**: The worker side (used by `manga-worker`).

pub mod chunks;
pub mod client;
pub mod handlers;
pub mod protocol;
pub mod service;
pub mod worker;

pub use client::WorkerClient;
pub use service::WorkerService;

use crate::queue::QueueError;
use crate::tasks::TaskId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("task {0} is not leased")]
    NotLeased(TaskId),

    #[error("task {0} has no transferable file")]
    UnknownTask(TaskId),

    #[error("chunk {chunk} of task {task} is out of range")]
    ChunkOutOfRange { task: TaskId, chunk: u64 },

    /// `missing` lists at most the first few gaps; `count` is the full number.
    #[error("upload of task {task} is missing {count} chunks, first {missing:?}")]
    MissingChunks { task: TaskId, count: u64, missing: Vec<u64> },

    #[error("upload of task {task} is corrupt: {reason}")]
    CorruptUpload { task: TaskId, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Frame(#[from] bincode::Error),

    #[error("result handling failed: {0:#}")]
    Environment(#[from] anyhow::Error),

    #[error(transparent)]
    Queue(#[from] QueueError),
}
