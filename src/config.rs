//! Runtime configuration for both binaries.
//!
//! Values come from the process environment (a `.env` file is loaded first by
//! the binaries through `dotenvy`). Unset or unparsable variables fall back to
//! the defaults below.

use crate::broker::LeasePolicy;
use crate::queue::RetentionPolicy;
use crate::transfer::protocol::DEFAULT_CHUNK_SIZE;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Where compute-heavy tasks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeMode {
    /// A local executor drains the compute lane.
    Local,
    /// The broker leases compute tasks to remote workers.
    Remote,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub bind_addr: SocketAddr,
    /// `None` selects the in-memory store.
    pub database_path: Option<PathBuf>,
    pub staging_dir: PathBuf,
    pub library_root: PathBuf,
    pub upscaled_root: PathBuf,
    pub compute_mode: ComputeMode,
    pub lease: LeasePolicy,
    pub chunk_size: u64,
    pub retention: RetentionPolicy,
    pub replay_interval: Duration,
    pub upscaler_command: Option<String>,
    pub reader_notify_url: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 7070)),
            database_path: Some(PathBuf::from("data/tasks.db")),
            staging_dir: PathBuf::from("data/staging"),
            library_root: PathBuf::from("library"),
            upscaled_root: PathBuf::from("library-upscaled"),
            compute_mode: ComputeMode::Local,
            lease: LeasePolicy::default(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            retention: RetentionPolicy::default(),
            replay_interval: Duration::from_secs(30),
            upscaler_command: None,
            reader_notify_url: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let database_path = match std::env::var("TASKD_DATABASE") {
            Ok(path) if path == ":memory:" => None,
            Ok(path) => Some(PathBuf::from(path)),
            Err(_) => defaults.database_path,
        };
        let compute_mode = if env_parse("TASKD_REMOTE_WORKERS", false) {
            ComputeMode::Remote
        } else {
            ComputeMode::Local
        };

        Self {
            bind_addr: env_parse("TASKD_BIND", defaults.bind_addr),
            database_path,
            staging_dir: env_path("TASKD_STAGING_DIR", defaults.staging_dir),
            library_root: env_path("TASKD_LIBRARY_ROOT", defaults.library_root),
            upscaled_root: env_path("TASKD_UPSCALED_ROOT", defaults.upscaled_root),
            compute_mode,
            lease: LeasePolicy {
                staleness: env_secs("TASKD_LEASE_STALE_SECS", defaults.lease.staleness),
                reaper_interval: env_secs("TASKD_REAPER_INTERVAL_SECS", defaults.lease.reaper_interval),
                get_task_timeout: env_secs("TASKD_GET_TASK_TIMEOUT_SECS", defaults.lease.get_task_timeout),
            },
            chunk_size: env_parse("TASKD_CHUNK_SIZE", defaults.chunk_size).max(1),
            retention: RetentionPolicy {
                keep: env_parse("TASKD_RETENTION_KEEP", defaults.retention.keep),
                buffer: env_parse("TASKD_RETENTION_BUFFER", defaults.retention.buffer),
            },
            replay_interval: env_secs("TASKD_REPLAY_INTERVAL_SECS", defaults.replay_interval),
            upscaler_command: env_opt("TASKD_UPSCALER_COMMAND"),
            reader_notify_url: env_opt("TASKD_READER_NOTIFY_URL"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub server_url: String,
    pub work_dir: PathBuf,
    pub poll_interval: Duration,
    pub keep_alive_interval: Duration,
    pub upscaler_command: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:7070".to_string(),
            work_dir: std::env::temp_dir().join("manga-worker"),
            poll_interval: Duration::from_secs(5),
            keep_alive_interval: Duration::from_secs(15),
            upscaler_command: None,
        }
    }
}

impl WorkerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            server_url: env_opt("WORKER_SERVER_URL").unwrap_or(defaults.server_url),
            work_dir: env_path("WORKER_WORK_DIR", defaults.work_dir),
            poll_interval: env_secs("WORKER_POLL_INTERVAL_SECS", defaults.poll_interval),
            keep_alive_interval: env_secs("WORKER_KEEPALIVE_SECS", defaults.keep_alive_interval),
            upscaler_command: env_opt("TASKD_UPSCALER_COMMAND"),
        }
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    env_opt(key).map(PathBuf::from).unwrap_or(default)
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match env_opt(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!("Ignoring invalid value '{}' for {}", raw, key);
                default
            }
        },
        None => default,
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_parse(key, default.as_secs()).max(1))
}
