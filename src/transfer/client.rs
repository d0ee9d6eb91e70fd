//! HTTP client for the worker protocol, used by `manga-worker`.

use super::chunks::{chunk_stream, decode_frames, encode_frames};
use super::protocol::*;
use crate::tasks::{TaskId, TaskProgress};

use anyhow::{Context, Result};
use futures::TryStreamExt;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);
/// Covers the server's `get_task` wait with room to spare.
const REQUEST_TASK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct WorkerClient {
    http_client: reqwest::Client,
    base_url: String,
}

impl WorkerClient {
    /// Client for the server at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    pub async fn check_connection(&self) -> Result<CheckConnectionResponse> {
        let resp = self
            .http_client
            .get(self.url(ENDPOINT_CHECK_CONNECTION))
            .timeout(CONTROL_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    /// Asks for a lease. The sentinel descriptor means there is no work.
    pub async fn request_task(&self) -> Result<TaskDescriptor> {
        let resp = self
            .post_with_retry(self.url(ENDPOINT_REQUEST_TASK), &(), REQUEST_TASK_TIMEOUT, 3)
            .await?
            .error_for_status()?;
        Ok(resp.json().await?)
    }

    /// `Ok(false)` means the lease is gone and the job must be abandoned.
    pub async fn keep_alive(&self, task_id: TaskId, progress: Option<TaskProgress>) -> Result<bool> {
        let req = KeepAliveRequest { task_id, progress };
        let resp: KeepAliveResponse = self
            .post_with_retry(self.url(ENDPOINT_KEEP_ALIVE), &req, CONTROL_TIMEOUT, 3)
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.alive)
    }

    /// Downloads the input file of a leased task into `destination`,
    /// checking that frames arrive in order and that none are missing.
    pub async fn download_input(&self, descriptor: &TaskDescriptor, destination: &Path) -> Result<u64> {
        let task_id = descriptor.task_id;
        let resp = self
            .http_client
            .get(format!("{}/{}", self.url(ENDPOINT_INPUT_FILE), task_id))
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("Input of task {} unavailable", task_id))?;

        let body = resp.bytes_stream().map_err(std::io::Error::other);
        let frames = decode_frames(body, descriptor.chunk_size);
        futures::pin_mut!(frames);

        let mut file = tokio::fs::File::create(destination).await?;
        let mut expected = 0u64;
        let mut written = 0u64;
        while let Some(frame) = frames.try_next().await? {
            if frame.task_id != task_id || frame.chunk_number != expected {
                anyhow::bail!(
                    "Unexpected frame {}/{} while downloading task {} (wanted chunk {})",
                    frame.task_id,
                    frame.chunk_number,
                    task_id,
                    expected
                );
            }
            file.write_all(&frame.data).await?;
            written += frame.data.len() as u64;
            expected += 1;
        }
        file.flush().await?;

        if expected != descriptor.chunk_count {
            anyhow::bail!(
                "Download of task {} ended after {} of {} chunks",
                task_id,
                expected,
                descriptor.chunk_count
            );
        }
        Ok(written)
    }

    /// Downloads one input chunk by number.
    pub async fn fetch_chunk(&self, task_id: TaskId, chunk_number: u64) -> Result<Vec<u8>> {
        let resp = self
            .http_client
            .get(format!(
                "{}/{}/{}",
                self.url(ENDPOINT_INPUT_CHUNK),
                task_id,
                chunk_number
            ))
            .timeout(Duration::from_secs(60))
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.bytes().await?.to_vec())
    }

    /// Streams `path` as the result of `task_id` and returns the server's
    /// verdict for that task.
    pub async fn upload_result(&self, task_id: TaskId, path: &Path, chunk_size: u64) -> Result<UploadOutcome> {
        let size = tokio::fs::metadata(path).await?.len();
        let count = chunk_count(size, chunk_size);
        let frames = chunk_stream(path.to_path_buf(), task_id, chunk_size, count);
        let body = reqwest::Body::wrap_stream(encode_frames(frames, chunk_size));

        let resp: UploadResultResponse = self
            .http_client
            .post(self.url(ENDPOINT_UPLOAD_RESULT))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await?
            .error_for_status()
            .with_context(|| format!("Upload of task {} rejected", task_id))?
            .json()
            .await?;

        resp.results
            .into_iter()
            .find(|outcome| outcome.task_id == task_id)
            .with_context(|| format!("Server reported no outcome for task {}", task_id))
    }

    /// Fails the lease now instead of waiting for the reaper. `false` if it had already ended.
    pub async fn report_failure(&self, task_id: TaskId, message: &str) -> Result<bool> {
        let req = ReportFailureRequest {
            task_id,
            message: message.to_string(),
        };
        let resp: ReportFailureResponse = self
            .post_with_retry(self.url(ENDPOINT_REPORT_FAILURE), &req, CONTROL_TIMEOUT, 3)
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(resp.accepted)
    }

    async fn post_with_retry<T: serde::Serialize>(
        &self,
        url: String,
        payload: &T,
        timeout: Duration,
        attempts: usize,
    ) -> Result<reqwest::Response> {
        let mut delay_ms = 150u64;

        for attempt in 0..attempts {
            let response = self
                .http_client
                .post(url.clone())
                .json(payload)
                .timeout(timeout)
                .send()
                .await;

            match response {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt + 1 == attempts {
                        return Err(anyhow::anyhow!(e));
                    }
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }

        Err(anyhow::anyhow!("Retry attempts exhausted"))
    }
}
