//! Remote worker loop.
//!
//! Polls the server for compute tasks and runs them one at a time: download
//! the input, run the upscaler, upload the result. A side task keeps the lease
//! alive and relays progress; when the server answers `alive=false` the job is
//! abandoned on the spot.

use super::client::WorkerClient;
use super::protocol::TaskDescriptor;
use crate::config::WorkerConfig;
use crate::tasks::environment::run_upscaler_command;
use crate::tasks::{TaskId, TaskProgress};

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const STAGES: u64 = 3;

type SharedProgress = Arc<Mutex<Option<TaskProgress>>>;

/// Pull loop of a `manga-worker` process.
pub struct RemoteWorker {
    client: WorkerClient,
    config: WorkerConfig,
}

impl RemoteWorker {
    pub fn new(client: WorkerClient, config: WorkerConfig) -> Self {
        Self { client, config }
    }

    /// Polls for work until shutdown. Job errors are reported, never fatal.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!("Worker polling {} for tasks", self.config.server_url);

        while !shutdown.is_cancelled() {
            let next = tokio::select! {
                next = self.client.request_task() => next,
                _ = shutdown.cancelled() => break,
            };

            match next {
                Ok(descriptor) if descriptor.is_none() => {
                    tracing::trace!("No task available");
                    idle(self.config.poll_interval, &shutdown).await;
                }
                Ok(descriptor) => self.run_job(descriptor, &shutdown).await,
                Err(e) => {
                    tracing::warn!("Failed to request a task: {:#}", e);
                    idle(self.config.poll_interval, &shutdown).await;
                }
            }
        }

        tracing::info!("Worker stopped");
    }

    async fn run_job(&self, descriptor: TaskDescriptor, shutdown: &CancellationToken) {
        let task_id = descriptor.task_id;
        tracing::info!(
            "Leased task {} ({} for chapter {}, {} bytes)",
            task_id,
            descriptor.kind,
            descriptor.chapter_id,
            descriptor.file_size
        );

        let job = shutdown.child_token();
        let progress: SharedProgress = Arc::new(Mutex::new(None));
        let keep_alive = self.spawn_keep_alive(task_id, progress.clone(), job.clone());
        let work_dir = self.config.work_dir.join(task_id.to_string());

        let result = tokio::select! {
            result = self.execute(&descriptor, &work_dir, &progress, &job) => result,
            _ = job.cancelled() => Err(anyhow::anyhow!("Job abandoned")),
        };
        keep_alive.abort();

        match result {
            Ok(()) => tracing::info!("Task {} completed", task_id),
            Err(e) if job.is_cancelled() => {
                tracing::warn!("Task {} abandoned: {:#}", task_id, e);
            }
            Err(e) => {
                tracing::warn!("Task {} failed: {:#}", task_id, e);
                if let Err(report) = self.client.report_failure(task_id, &format!("{:#}", e)).await {
                    tracing::error!("Failed to report failure of task {}: {:#}", task_id, report);
                }
            }
        }

        if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("Failed to clean up {}: {}", work_dir.display(), e);
            }
        }
    }

    /// Sends keepalives until aborted. Cancels `job` once the lease is gone.
    fn spawn_keep_alive(
        &self,
        task_id: TaskId,
        progress: SharedProgress,
        job: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let client = self.client.clone();
        let interval = self.config.keep_alive_interval;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = job.cancelled() => break,
                }

                let snapshot = progress.lock().unwrap_or_else(|e| e.into_inner()).clone();
                match client.keep_alive(task_id, snapshot).await {
                    Ok(true) => tracing::trace!("Renewed lease for task {}", task_id),
                    Ok(false) => {
                        tracing::warn!("Server dropped the lease of task {}", task_id);
                        job.cancel();
                        break;
                    }
                    Err(e) => tracing::debug!("Keepalive for task {} failed: {:#}", task_id, e),
                }
            }
        })
    }

    async fn execute(
        &self,
        descriptor: &TaskDescriptor,
        work_dir: &Path,
        progress: &SharedProgress,
        job: &CancellationToken,
    ) -> Result<()> {
        let task_id = descriptor.task_id;
        let profile = descriptor
            .profile
            .as_ref()
            .context("Task descriptor carries no upscaler profile")?;
        let command = self
            .config
            .upscaler_command
            .as_deref()
            .context("No upscaler command configured (TASKD_UPSCALER_COMMAND)")?;

        tokio::fs::create_dir_all(work_dir).await?;
        let file_name = safe_file_name(&descriptor.file_name, task_id);
        let input = work_dir.join(&file_name);
        let output = work_dir.join("out").join(&file_name);

        set_progress(progress, 0, "Downloading");
        let downloaded = self.client.download_input(descriptor, &input).await?;
        tracing::debug!("Downloaded {} bytes for task {}", downloaded, task_id);

        set_progress(progress, 1, "Upscaling");
        run_upscaler_command(command, &input, &output, profile, job).await?;

        set_progress(progress, 2, "Uploading");
        let outcome = self
            .client
            .upload_result(task_id, &output, descriptor.chunk_size)
            .await?;
        if !outcome.success {
            anyhow::bail!(
                "Server rejected the result: {}",
                outcome.error.unwrap_or_else(|| "unknown error".to_string())
            );
        }

        set_progress(progress, STAGES, "Done");
        Ok(())
    }
}

fn set_progress(progress: &SharedProgress, current: u64, message: &str) {
    *progress.lock().unwrap_or_else(|e| e.into_inner()) = Some(TaskProgress {
        current,
        total: STAGES,
        status_message: message.to_string(),
    });
}

/// Keeps only the final path component of a server-supplied name.
fn safe_file_name(name: &str, task_id: TaskId) -> PathBuf {
    Path::new(name)
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(format!("task-{}.cbz", task_id)))
}

async fn idle(duration: Duration, shutdown: &CancellationToken) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        _ = shutdown.cancelled() => {}
    }
}
