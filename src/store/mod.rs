//! Durable Task Storage
//!
//! The store is the single source of truth for task state. Every in-memory
//! structure elsewhere in the crate (pending sets, lease table, registry) is
//! a projection that is allowed to lag behind it.
//!
//! ## Submodules
//! - **`sqlite`**: `rusqlite`-backed store used by the server.
//! - **`memory`**: `DashMap`-backed store for tests and throwaway runs.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryTaskStore;
pub use sqlite::SqliteTaskStore;

use crate::tasks::{TaskId, TaskPayload, TaskRecord, TaskStatus};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid task row {id}: {reason}")]
    InvalidRow { id: i64, reason: String },

    #[error("task {0} not found")]
    UnknownTask(TaskId),

    #[error("storage worker failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("storage lock poisoned")]
    Poisoned,
}

/// Storage contract used by the queue, executors, broker and registry.
///
/// Lists are always returned in ascending `order`.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persists a new `Pending` task, assigning its id and the next order
    /// (current max + 1, never reusing an order handed out before).
    async fn insert(&self, payload: TaskPayload) -> Result<TaskRecord, StoreError>;

    async fn update(&self, record: &TaskRecord) -> Result<(), StoreError>;

    /// Writes several records as one unit.
    async fn update_many(&self, records: &[TaskRecord]) -> Result<(), StoreError>;

    /// Writes each record only if its stored status still equals the status
    /// paired with it. All or nothing: when any row has moved on, nothing is
    /// written and `false` comes back.
    async fn update_many_if(&self, records: &[(TaskRecord, TaskStatus)]) -> Result<bool, StoreError>;

    /// Single-record form of [`TaskStore::update_many_if`].
    async fn update_if(&self, record: &TaskRecord, expected: TaskStatus) -> Result<bool, StoreError> {
        self.update_many_if(&[(record.clone(), expected)]).await
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError>;

    async fn find_by_order(&self, order: i64) -> Result<Option<TaskRecord>, StoreError>;

    async fn list_by_status(&self, statuses: &[TaskStatus]) -> Result<Vec<TaskRecord>, StoreError>;

    async fn list_all(&self) -> Result<Vec<TaskRecord>, StoreError>;

    /// Deletes every listed task and returns how many rows went away.
    async fn delete(&self, ids: &[TaskId]) -> Result<usize, StoreError>;
}

#[cfg(test)]
mod tests;
