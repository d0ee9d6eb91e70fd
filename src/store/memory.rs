use super::{StoreError, TaskStore};
use crate::tasks::{TaskId, TaskPayload, TaskProgress, TaskRecord, TaskStatus, now_ms};

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Mutex;

/// Sequence state: last issued id and the highest order ever handed out.
#[derive(Default)]
struct Sequence {
    last_id: i64,
    high_water: i64,
}

/// Non-durable store keeping every record in a `DashMap`.
#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: DashMap<TaskId, TaskRecord>,
    sequence: Mutex<Sequence>,
    /// Held by every write so conditional batches see no interleaved writer.
    writes: Mutex<()>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sorted(&self, mut records: Vec<TaskRecord>) -> Vec<TaskRecord> {
        records.sort_by_key(|r| r.order);
        records
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert(&self, payload: TaskPayload) -> Result<TaskRecord, StoreError> {
        let mut seq = self.sequence.lock().map_err(|_| StoreError::Poisoned)?;
        let current_max = self.tasks.iter().map(|e| e.order).max().unwrap_or(0);

        seq.last_id += 1;
        seq.high_water = seq.high_water.max(current_max) + 1;

        let record = TaskRecord {
            id: TaskId(seq.last_id),
            order: seq.high_water,
            status: TaskStatus::Pending,
            payload,
            progress: TaskProgress::default(),
            created_at: now_ms(),
            processed_at: None,
            retry_count: 0,
            last_keep_alive: None,
            last_error: None,
        };
        self.tasks.insert(record.id, record.clone());

        Ok(record)
    }

    async fn update(&self, record: &TaskRecord) -> Result<(), StoreError> {
        let _writes = self.writes.lock().map_err(|_| StoreError::Poisoned)?;
        match self.tasks.get_mut(&record.id) {
            Some(mut entry) => {
                *entry = record.clone();
                Ok(())
            }
            None => Err(StoreError::UnknownTask(record.id)),
        }
    }

    async fn update_many(&self, records: &[TaskRecord]) -> Result<(), StoreError> {
        let _writes = self.writes.lock().map_err(|_| StoreError::Poisoned)?;
        if let Some(missing) = records.iter().find(|r| !self.tasks.contains_key(&r.id)) {
            return Err(StoreError::UnknownTask(missing.id));
        }
        for record in records {
            self.tasks.insert(record.id, record.clone());
        }
        Ok(())
    }

    async fn update_many_if(&self, records: &[(TaskRecord, TaskStatus)]) -> Result<bool, StoreError> {
        let _writes = self.writes.lock().map_err(|_| StoreError::Poisoned)?;
        for (record, expected) in records {
            match self.tasks.get(&record.id) {
                None => return Err(StoreError::UnknownTask(record.id)),
                Some(stored) if stored.status != *expected => return Ok(false),
                Some(_) => {}
            }
        }
        for (record, _) in records {
            self.tasks.insert(record.id, record.clone());
        }
        Ok(true)
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.tasks.get(&id).map(|entry| entry.value().clone()))
    }

    async fn find_by_order(&self, order: i64) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self
            .tasks
            .iter()
            .find(|entry| entry.order == order)
            .map(|entry| entry.value().clone()))
    }

    async fn list_by_status(&self, statuses: &[TaskStatus]) -> Result<Vec<TaskRecord>, StoreError> {
        let records = self
            .tasks
            .iter()
            .filter(|entry| statuses.contains(&entry.status))
            .map(|entry| entry.value().clone())
            .collect();
        Ok(self.sorted(records))
    }

    async fn list_all(&self) -> Result<Vec<TaskRecord>, StoreError> {
        let records = self.tasks.iter().map(|entry| entry.value().clone()).collect();
        Ok(self.sorted(records))
    }

    async fn delete(&self, ids: &[TaskId]) -> Result<usize, StoreError> {
        let _writes = self.writes.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(ids
            .iter()
            .filter(|id| self.tasks.remove(id).is_some())
            .count())
    }
}
