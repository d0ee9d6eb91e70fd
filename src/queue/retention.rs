//! Retention Cleanup
//!
//! Keeps the most recent `keep` completed tasks. Nothing is deleted until the
//! overflow grows past `buffer`, so cleanup runs in batches instead of on
//! every single enqueue.

use crate::store::{StoreError, TaskStore};
use crate::tasks::{TaskId, TaskRecord, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub keep: usize,
    pub buffer: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep: 100,
            buffer: 25,
        }
    }
}

impl RetentionPolicy {
    /// Picks the completed tasks that should go, oldest first.
    pub fn select_expired(&self, completed: &[TaskRecord]) -> Vec<TaskId> {
        let overflow = completed.len().saturating_sub(self.keep);
        if overflow <= self.buffer {
            return Vec::new();
        }

        let mut by_age: Vec<&TaskRecord> = completed.iter().collect();
        by_age.sort_by_key(|r| (r.processed_at.unwrap_or(r.created_at), r.order));
        by_age.into_iter().take(overflow).map(|r| r.id).collect()
    }

    /// Deletes the expired completed rows and returns their ids.
    pub async fn cleanup(&self, store: &dyn TaskStore) -> Result<Vec<TaskId>, StoreError> {
        let completed = store.list_by_status(&[TaskStatus::Completed]).await?;
        let expired = self.select_expired(&completed);
        if expired.is_empty() {
            return Ok(expired);
        }

        let deleted = store.delete(&expired).await?;
        tracing::info!(
            "Retention removed {} completed tasks (keeping {})",
            deleted,
            self.keep
        );
        Ok(expired)
    }
}
