use super::payload::TaskPayload;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Identity of a task record.
///
/// Assigned by the store on insert and never changed afterwards. On the
/// worker wire a negative id is the "no task available" sentinel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl TaskId {
    /// Sentinel handed to workers when there is nothing to lease.
    pub const NONE: TaskId = TaskId(-1);

    /// `true` for the "no work" id handed to idle workers.
    pub fn is_sentinel(&self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The two independent task categories, each with its own FIFO channel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Standard,
    ComputeHeavy,
}

impl Lane {
    pub const ALL: [Lane; 2] = [Lane::Standard, Lane::ComputeHeavy];

    pub fn as_str(&self) -> &'static str {
        match self {
            Lane::Standard => "standard",
            Lane::ComputeHeavy => "compute_heavy",
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Lane {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "standard" => Ok(Lane::Standard),
            "compute_heavy" | "compute" => Ok(Lane::ComputeHeavy),
            _ => Err(format!("Invalid lane: {}", s)),
        }
    }
}

/// Lifecycle state of a task.
///
/// `Pending -> Processing -> {Completed, Failed}`, `Processing -> Canceled`,
/// and `Failed -> Pending` on retry. `Completed` and `Canceled` only leave
/// the table through retention or explicit removal (or a manual retry of a
/// canceled task).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Canceled,
}

impl TaskStatus {
    /// Completed, failed and canceled tasks only leave their state through an explicit retry.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Canceled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Processing => write!(f, "processing"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Canceled => write!(f, "canceled"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "canceled" => Ok(TaskStatus::Canceled),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

/// Progress of a running task. Relayed to observers, never interpreted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskProgress {
    pub current: u64,
    pub total: u64,
    pub status_message: String,
}

/// The persisted unit of work.
///
/// Equality and hashing only look at `id`, so status, retry count and
/// timestamps can change in place without breaking set membership.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    /// Per-enqueue sequence; dispatch within a lane follows ascending order.
    pub order: i64,
    pub status: TaskStatus,
    pub payload: TaskPayload,
    pub progress: TaskProgress,
    /// Timestamp (ms) of the enqueue.
    pub created_at: u64,
    /// Timestamp (ms) of the last finished execution.
    pub processed_at: Option<u64>,
    pub retry_count: u32,
    /// Timestamp (ms) of the last keepalive from a remote worker.
    pub last_keep_alive: Option<u64>,
    pub last_error: Option<String>,
}

impl TaskRecord {
    /// Lane picked by the payload variant.
    pub fn lane(&self) -> Lane {
        self.payload.lane()
    }

    /// Whether an automatic replay may bring this task back to `Pending`.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.payload.retry_for()
    }

    /// Sort key shared by the pending sets and the registry views.
    pub fn sort_key(&self) -> (i64, u64, TaskId) {
        (self.order, self.created_at, self.id)
    }
}

impl PartialEq for TaskRecord {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TaskRecord {}

impl Hash for TaskRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Helper to get the current system time in milliseconds.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
