//! In-memory pending set of one lane.
//!
//! Keyed by `(order, created_at, id)` so the pump always pops the lowest
//! `order`. An id appears at most once: re-inserting a task (after a reorder,
//! retry or replay) replaces its previous position.

use crate::tasks::{TaskId, TaskRecord};

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

type SortKey = (i64, u64, TaskId);

#[derive(Default)]
struct PendingSet {
    ordered: BTreeMap<SortKey, TaskRecord>,
    keys: HashMap<TaskId, SortKey>,
}

#[derive(Default)]
pub struct PendingLane {
    set: Mutex<PendingSet>,
    notify: Notify,
}

impl PendingLane {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PendingSet> {
        self.set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds or replaces a task, keeping the set sorted, and wakes the pump.
    pub fn insert(&self, record: TaskRecord) {
        {
            let mut set = self.lock();
            if let Some(previous) = set.keys.remove(&record.id) {
                set.ordered.remove(&previous);
            }
            let key = record.sort_key();
            set.keys.insert(record.id, key);
            set.ordered.insert(key, record);
        }
        self.notify.notify_one();
    }

    /// Drops a task from the set. Returns whether it was there.
    pub fn remove(&self, id: TaskId) -> bool {
        let mut set = self.lock();
        match set.keys.remove(&id) {
            Some(key) => set.ordered.remove(&key).is_some(),
            None => false,
        }
    }

    /// Pops the lowest-order task without waiting.
    pub fn take_first(&self) -> Option<TaskRecord> {
        let mut set = self.lock();
        let (_, record) = set.ordered.pop_first()?;
        set.keys.remove(&record.id);
        Some(record)
    }

    /// Waits for the lowest-order task. `None` once `cancel` fires.
    pub async fn next(&self, cancel: &CancellationToken) -> Option<TaskRecord> {
        loop {
            if let Some(record) = self.take_first() {
                return Some(record);
            }
            // notify_one stores a permit, so an insert racing with the
            // empty check above still wakes this waiter.
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    pub fn contains(&self, id: TaskId) -> bool {
        self.lock().keys.contains_key(&id)
    }

    /// Copy of the pending tasks in dispatch order.
    pub fn snapshot(&self) -> Vec<TaskRecord> {
        self.lock().ordered.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
