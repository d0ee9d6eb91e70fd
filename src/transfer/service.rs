//! Server side of the worker protocol.
//!
//! Every RPC is a method here; the axum handlers only translate between HTTP
//! and these calls.

use super::TransferError;
use super::chunks::{UploadAssembler, chunk_stream, decode_frames, encode_frames, read_chunk};
use super::protocol::*;
use crate::broker::RemoteWorkBroker;
use crate::tasks::{TaskEnvironment, TaskId, TaskRecord, now_ms};

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt, TryStreamExt};
use std::path::PathBuf;
use std::sync::Arc;

/// Server side of the worker protocol, on top of the broker.
pub struct WorkerService {
    broker: Arc<RemoteWorkBroker>,
    environment: Arc<dyn TaskEnvironment>,
    chunk_size: u64,
    staging_dir: PathBuf,
}

impl WorkerService {
    pub fn new(
        broker: Arc<RemoteWorkBroker>,
        environment: Arc<dyn TaskEnvironment>,
        chunk_size: u64,
        staging_dir: impl Into<PathBuf>,
    ) -> Arc<Self> {
        Arc::new(Self {
            broker,
            environment,
            chunk_size: chunk_size.max(1),
            staging_dir: staging_dir.into(),
        })
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn check_connection(&self) -> CheckConnectionResponse {
        CheckConnectionResponse {
            ok: true,
            server_time: now_ms(),
        }
    }

    /// Leases a compute task. Returns the sentinel when nothing is available
    /// or the task cannot be described; in the latter case the lease is failed
    /// right away.
    pub async fn request_task(&self) -> TaskDescriptor {
        let Some(record) = self.broker.get_task().await else {
            return TaskDescriptor::none();
        };

        match self.describe(&record).await {
            Ok(descriptor) => {
                tracing::info!(
                    "Handing task {} to a worker ({} bytes in {} chunks)",
                    record.id,
                    descriptor.file_size,
                    descriptor.chunk_count
                );
                descriptor
            }
            Err(message) => {
                tracing::warn!("Cannot hand out task {}: {}", record.id, message);
                if let Err(e) = self.broker.fail(record.id, &message).await {
                    tracing::error!("Failed to fail task {}: {}", record.id, e);
                }
                TaskDescriptor::none()
            }
        }
    }

    async fn describe(&self, record: &TaskRecord) -> Result<TaskDescriptor, String> {
        let (chapter_id, profile_id) = record
            .payload
            .upscale_target()
            .ok_or_else(|| format!("{} tasks cannot run remotely", record.payload.kind()))?;
        let profile = self
            .environment
            .profile(profile_id)
            .await
            .ok_or_else(|| format!("Upscaler profile {} not found", profile_id))?;
        let input = self
            .environment
            .input_file(&record.payload)
            .ok_or_else(|| format!("No source file for chapter {}", chapter_id))?;
        let metadata = tokio::fs::metadata(&input)
            .await
            .map_err(|e| format!("Cannot read {}: {}", input.display(), e))?;

        let file_size = metadata.len();
        Ok(TaskDescriptor {
            task_id: record.id,
            kind: record.payload.kind().to_string(),
            chapter_id,
            profile: Some(profile),
            file_name: input
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| format!("chapter-{}", chapter_id)),
            file_size,
            chunk_size: self.chunk_size,
            chunk_count: chunk_count(file_size, self.chunk_size),
        })
    }

    /// Refreshes the lease and relays progress. `alive = false` tells the worker to drop the job.
    pub fn keep_alive(&self, req: KeepAliveRequest) -> KeepAliveResponse {
        let alive = self.broker.keep_alive(req.task_id, req.progress);
        if !alive {
            tracing::debug!("Keepalive for task {} refused: no lease", req.task_id);
        }
        KeepAliveResponse { alive }
    }

    async fn input_file(&self, task_id: TaskId) -> Result<(PathBuf, u64), TransferError> {
        let record = self
            .broker
            .leased(task_id)
            .ok_or(TransferError::NotLeased(task_id))?;
        let path = self
            .environment
            .input_file(&record.payload)
            .ok_or(TransferError::UnknownTask(task_id))?;
        let size = tokio::fs::metadata(&path).await?.len();
        Ok((path, size))
    }

    /// Bytes of chunk `chunk_number` of a leased task's input.
    pub async fn input_chunk(&self, task_id: TaskId, chunk_number: u64) -> Result<Vec<u8>, TransferError> {
        let (path, size) = self.input_file(task_id).await?;
        if chunk_number >= chunk_count(size, self.chunk_size) {
            return Err(TransferError::ChunkOutOfRange {
                task: task_id,
                chunk: chunk_number,
            });
        }
        read_chunk(&path, chunk_number, self.chunk_size).await
    }

    /// The whole input file as encoded frames.
    pub async fn input_stream(
        &self,
        task_id: TaskId,
    ) -> Result<BoxStream<'static, Result<Bytes, TransferError>>, TransferError> {
        let (path, size) = self.input_file(task_id).await?;
        let count = chunk_count(size, self.chunk_size);
        let frames = chunk_stream(path, task_id, self.chunk_size, count);
        Ok(encode_frames(frames, self.chunk_size).boxed())
    }

    /// Receives a framed upload, then finalizes every task found in it.
    ///
    /// A broken stream fails the whole call. Once the stream is complete each
    /// task succeeds or fails on its own.
    pub async fn upload_result<S>(&self, body: S) -> Result<UploadResultResponse, TransferError>
    where
        S: Stream<Item = std::io::Result<Bytes>>,
    {
        let mut assembler = UploadAssembler::new(&self.staging_dir).await?;

        let received = self.receive(&mut assembler, body).await;
        let response = match received {
            Ok(frames) => {
                tracing::debug!("Upload stream carried {} frames", frames);
                Ok(self.finish_uploads(&assembler).await)
            }
            Err(e) => {
                tracing::warn!("Upload stream rejected: {}", e);
                Err(e)
            }
        };

        assembler.cleanup().await;
        response
    }

    async fn receive<S>(&self, assembler: &mut UploadAssembler, body: S) -> Result<usize, TransferError>
    where
        S: Stream<Item = std::io::Result<Bytes>>,
    {
        let frames = decode_frames(body, self.chunk_size);
        futures::pin_mut!(frames);

        let mut count = 0;
        while let Some(frame) = frames.try_next().await? {
            assembler.accept(&frame).await?;
            count += 1;
        }
        Ok(count)
    }

    async fn finish_uploads(&self, assembler: &UploadAssembler) -> UploadResultResponse {
        let mut results = Vec::new();

        for task_id in assembler.tasks() {
            let outcome = match self.finish_upload(assembler, task_id).await {
                Ok(()) => UploadOutcome {
                    task_id,
                    success: true,
                    error: None,
                },
                Err(e) => {
                    tracing::warn!("Upload for task {} rejected: {}", task_id, e);
                    UploadOutcome {
                        task_id,
                        success: false,
                        error: Some(e.to_string()),
                    }
                }
            };
            results.push(outcome);
        }

        UploadResultResponse { results }
    }

    async fn finish_upload(&self, assembler: &UploadAssembler, task_id: TaskId) -> Result<(), TransferError> {
        let record = self
            .broker
            .leased(task_id)
            .ok_or(TransferError::NotLeased(task_id))?;
        let destination = self
            .environment
            .output_file(&record.payload)
            .ok_or(TransferError::UnknownTask(task_id))?;

        let written = assembler.assemble(task_id, &destination).await?;
        self.environment.mark_result_ready(&record.payload).await?;

        if !self.broker.complete(task_id).await? {
            return Err(TransferError::NotLeased(task_id));
        }

        tracing::info!(
            "Stored result of task {} at {} ({} bytes)",
            task_id,
            destination.display(),
            written
        );
        Ok(())
    }

    /// Fails the worker's lease with its message.
    pub async fn report_failure(&self, req: ReportFailureRequest) -> Result<ReportFailureResponse, TransferError> {
        let accepted = self.broker.fail(req.task_id, &req.message).await?;
        if !accepted {
            tracing::debug!("Failure report for task {} ignored: no lease", req.task_id);
        }
        Ok(ReportFailureResponse { accepted })
    }
}
