use crate::broker::RemoteWorkBroker;
use crate::config::{ComputeMode, EngineConfig};
use crate::executor::{CancelCurrent, LocalExecutor};
use crate::queue::protocol::CancelTaskResponse;
use crate::queue::{QueueError, TaskQueue};
use crate::registry::LiveRegistry;
use crate::store::{MemoryTaskStore, SqliteTaskStore, TaskStore};
use crate::tasks::{CommandEnvironment, Lane, TaskEnvironment, TaskId, TaskRecord, TaskStatus};
use crate::transfer::WorkerService;

use anyhow::{Context, Result};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Opens the store named by the configuration.
pub fn open_store(config: &EngineConfig) -> Result<Arc<dyn TaskStore>> {
    match &config.database_path {
        Some(path) => {
            let store = SqliteTaskStore::open(path)
                .with_context(|| format!("Failed to open task database {}", path.display()))?;
            tracing::info!("Using task database {}", path.display());
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("Using in-memory task store, tasks will not survive a restart");
            Ok(Arc::new(MemoryTaskStore::new()))
        }
    }
}

/// Production environment: external upscaler command plus reader notification.
pub fn command_environment(config: &EngineConfig) -> Arc<dyn TaskEnvironment> {
    Arc::new(
        CommandEnvironment::new(&config.library_root, &config.upscaled_root)
            .with_upscaler_command(config.upscaler_command.clone())
            .with_notify_url(config.reader_notify_url.clone()),
    )
}

/// The running task engine.
pub struct Engine {
    queue: Arc<TaskQueue>,
    registry: Arc<LiveRegistry>,
    executors: Vec<Arc<LocalExecutor>>,
    broker: Option<Arc<RemoteWorkBroker>>,
    worker_service: Option<Arc<WorkerService>>,
    cancellers: Vec<Arc<dyn CancelCurrent>>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Recovers persisted state and starts every loop.
    ///
    /// Order matters: the registry subscribes before recovery so it sees the
    /// resets, and the lanes are refilled before the pumps start.
    pub async fn start(
        config: &EngineConfig,
        store: Arc<dyn TaskStore>,
        environment: Arc<dyn TaskEnvironment>,
    ) -> Result<Arc<Self>> {
        let shutdown = CancellationToken::new();
        let queue = TaskQueue::new(store.clone(), config.retention);

        let registry = LiveRegistry::new();
        let events = queue.events().subscribe();
        registry.seed(store.as_ref()).await?;

        let recovered = queue.recover_interrupted().await?;
        let replayed = queue.replay_pending_or_failed().await?;
        tracing::info!(
            "Recovered {} interrupted tasks, {} tasks waiting",
            recovered,
            replayed
        );

        let mut handles = Vec::new();
        let mut executors = Vec::new();
        let mut cancellers: Vec<Arc<dyn CancelCurrent>> = Vec::new();
        let mut broker = None;
        let mut worker_service = None;

        handles.push(tokio::spawn(registry.clone().run(
            store.clone(),
            events,
            shutdown.clone(),
        )));
        for lane in Lane::ALL {
            handles.push(tokio::spawn(queue.clone().run_pump(lane, shutdown.clone())));
        }

        let standard = LocalExecutor::new(Lane::Standard, queue.clone(), environment.clone());
        let receiver = take_receiver(&queue, Lane::Standard)?;
        handles.push(tokio::spawn(standard.clone().run(receiver, shutdown.clone())));
        executors.push(standard);

        let receiver = take_receiver(&queue, Lane::ComputeHeavy)?;
        match config.compute_mode {
            ComputeMode::Local => {
                let compute = LocalExecutor::new(Lane::ComputeHeavy, queue.clone(), environment.clone());
                handles.push(tokio::spawn(compute.clone().run(receiver, shutdown.clone())));
                cancellers.push(compute.clone());
                executors.push(compute);
            }
            ComputeMode::Remote => {
                let remote = RemoteWorkBroker::new(queue.clone(), config.lease);
                handles.push(tokio::spawn(
                    remote.clone().run_distribution(receiver, shutdown.clone()),
                ));
                handles.push(tokio::spawn(remote.clone().run_reaper(shutdown.clone())));
                worker_service = Some(WorkerService::new(
                    remote.clone(),
                    environment.clone(),
                    config.chunk_size,
                    &config.staging_dir,
                ));
                cancellers.push(remote.clone());
                broker = Some(remote);
                tracing::info!("Compute lane served to remote workers");
            }
        }

        handles.push(tokio::spawn(
            queue
                .clone()
                .run_replay_loop(config.replay_interval, shutdown.clone()),
        ));

        Ok(Arc::new(Self {
            queue,
            registry,
            executors,
            broker,
            worker_service,
            cancellers,
            shutdown,
            handles: Mutex::new(handles),
        }))
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<LiveRegistry> {
        &self.registry
    }

    pub fn executors(&self) -> &[Arc<LocalExecutor>] {
        &self.executors
    }

    /// Present in remote compute mode only.
    pub fn broker(&self) -> Option<&Arc<RemoteWorkBroker>> {
        self.broker.as_ref()
    }

    /// Present in remote compute mode only.
    pub fn worker_service(&self) -> Option<&Arc<WorkerService>> {
        self.worker_service.as_ref()
    }

    /// Token cancelled by `shutdown`, for tying other loops (the HTTP server) to the engine.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancels a running compute task, wherever it runs.
    ///
    /// Only `Processing` tasks can be canceled. Each executor or the broker
    /// checks that the task is still the one it is running, so a request that
    /// arrives late never hits a successor.
    pub async fn cancel(&self, id: TaskId) -> Result<CancelTaskResponse, QueueError> {
        let record = self.queue.get(id).await?.ok_or(QueueError::NotFound(id))?;
        if record.status != TaskStatus::Processing {
            return Err(QueueError::InvalidTransition {
                id,
                from: record.status,
                action: "cancel",
            });
        }

        let mut canceled = false;
        for canceller in &self.cancellers {
            if canceller.cancel_current(id).await {
                canceled = true;
                break;
            }
        }

        if canceled {
            tracing::info!("Cancellation of task {} requested", id);
        } else {
            tracing::debug!("Task {} is not running anywhere cancellable", id);
        }

        let status = self.queue.get(id).await?.map(|record| record.status);
        Ok(CancelTaskResponse {
            task_id: id,
            canceled,
            status,
        })
    }

    /// Stops every loop and waits for them to wind down.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down task engine");
        self.shutdown.cancel();

        let handles: Vec<JoinHandle<()>> = self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();

        let joined = tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(handles)).await;
        match joined {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        tracing::error!("Engine loop ended abnormally: {}", e);
                    }
                }
            }
            Err(_) => tracing::warn!("Engine loops did not stop within {:?}", SHUTDOWN_GRACE),
        }
    }
}

fn take_receiver(queue: &TaskQueue, lane: Lane) -> Result<mpsc::Receiver<TaskRecord>> {
    queue
        .take_receiver(lane)
        .with_context(|| format!("Receiver of the {} lane already taken", lane))
}
