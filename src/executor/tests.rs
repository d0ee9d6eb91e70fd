//! Executor Module Tests
//!
//! Drives a real `TaskQueue` (memory store) into a `LocalExecutor` backed by
//! the scripted environment.
//!
//! ## Test Scopes
//! - **Ordering**: FIFO completion and single-flight per lane.
//! - **Failure isolation**: Errors and panics fail one task, the loop keeps going.
//! - **Cancellation**: Guarded `cancel_current` and shutdown behaviour.

#[cfg(test)]
mod tests {
    use crate::executor::{CancelCurrent, LocalExecutor};
    use crate::queue::{RetentionPolicy, TaskEvent, TaskQueue};
    use crate::store::{MemoryTaskStore, TaskStore};
    use crate::tasks::testing::{self, Behavior, ScriptedEnvironment};
    use crate::tasks::{Lane, TaskId, TaskRecord, TaskStatus};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Harness {
        store: Arc<MemoryTaskStore>,
        queue: Arc<TaskQueue>,
        env: Arc<ScriptedEnvironment>,
        executor: Arc<LocalExecutor>,
        shutdown: CancellationToken,
        _dir: tempfile::TempDir,
    }

    fn harness(lane: Lane) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryTaskStore::new());
        let queue = TaskQueue::new(store.clone(), RetentionPolicy::default());
        let env = ScriptedEnvironment::new(dir.path());
        let executor = LocalExecutor::new(lane, queue.clone(), env.clone());
        Harness {
            store,
            queue,
            env,
            executor,
            shutdown: CancellationToken::new(),
            _dir: dir,
        }
    }

    impl Harness {
        fn start(&self) {
            let lane = self.executor.lane();
            let rx = self.queue.take_receiver(lane).unwrap();
            tokio::spawn(self.queue.clone().run_pump(lane, self.shutdown.clone()));
            tokio::spawn(self.executor.clone().run(rx, self.shutdown.clone()));
        }

        async fn wait_for(&self, id: TaskId, status: TaskStatus) -> TaskRecord {
            for _ in 0..200 {
                if let Some(record) = self.store.get(id).await.unwrap() {
                    if record.status == status {
                        return record;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("task {} never reached {}", id, status);
        }

        async fn wait_until_running(&self, id: TaskId) {
            for _ in 0..200 {
                if self.executor.current_task() == Some(id) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("task {} never started", id);
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.shutdown.cancel();
        }
    }

    // ============================================================
    // ORDERING
    // ============================================================

    #[tokio::test]
    async fn test_standard_lane_runs_in_enqueue_order() {
        // ARRANGE
        let h = harness(Lane::Standard);
        let mut ids = Vec::new();
        for name in ["A", "B", "C"] {
            ids.push(h.queue.enqueue(testing::scan(name)).await.unwrap().id);
        }

        // ACT
        h.start();
        for id in &ids {
            h.wait_for(*id, TaskStatus::Completed).await;
        }

        // ASSERT
        assert_eq!(h.env.executed(), vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_lane_is_single_flight() {
        let h = harness(Lane::Standard);
        let mut last = TaskId::NONE;
        for i in 0..5 {
            let name = format!("slow-{}", i);
            h.env.script(&name, Behavior::Delay(Duration::from_millis(20)));
            last = h.queue.enqueue(testing::scan(&name)).await.unwrap().id;
        }

        h.start();
        h.wait_for(last, TaskStatus::Completed).await;

        assert_eq!(h.env.max_concurrent(), 1);
        assert_eq!(h.env.executed().len(), 5);
    }

    #[tokio::test]
    async fn test_completed_task_has_processed_at() {
        let h = harness(Lane::Standard);
        let id = h.queue.enqueue(testing::scan("a")).await.unwrap().id;

        h.start();
        let done = h.wait_for(id, TaskStatus::Completed).await;

        assert!(done.processed_at.is_some());
        assert_eq!(done.retry_count, 0);
    }

    #[tokio::test]
    async fn test_skips_task_that_is_no_longer_pending() {
        let h = harness(Lane::Standard);
        let mut stale = h.queue.enqueue(testing::scan("stale")).await.unwrap();
        let fresh = h.queue.enqueue(testing::scan("fresh")).await.unwrap();
        stale.status = TaskStatus::Canceled;
        h.store.update(&stale).await.unwrap();

        h.start();
        h.wait_for(fresh.id, TaskStatus::Completed).await;

        assert_eq!(h.env.executed(), vec!["fresh"]);
        assert_eq!(
            h.store.get(stale.id).await.unwrap().unwrap().status,
            TaskStatus::Canceled
        );
    }

    // ============================================================
    // FAILURE ISOLATION
    // ============================================================

    #[tokio::test]
    async fn test_failure_is_recorded_and_loop_continues() {
        let h = harness(Lane::Standard);
        h.env.script("broken", Behavior::Fail);
        let broken = h.queue.enqueue(testing::scan("broken")).await.unwrap();
        let next = h.queue.enqueue(testing::scan("next")).await.unwrap();

        h.start();
        let failed = h.wait_for(broken.id, TaskStatus::Failed).await;
        h.wait_for(next.id, TaskStatus::Completed).await;

        assert_eq!(failed.retry_count, 1);
        assert!(failed.last_error.unwrap().contains("scripted failure"));
        assert!(failed.processed_at.is_some());
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let h = harness(Lane::Standard);
        h.env.script("explodes", Behavior::Panic);
        let explodes = h.queue.enqueue(testing::scan("explodes")).await.unwrap();
        let next = h.queue.enqueue(testing::scan("next")).await.unwrap();

        h.start();
        let failed = h.wait_for(explodes.id, TaskStatus::Failed).await;
        h.wait_for(next.id, TaskStatus::Completed).await;

        assert!(failed.last_error.unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn test_progress_is_published_and_stored() {
        let h = harness(Lane::ComputeHeavy);
        tokio::fs::create_dir_all(h.env.library_root.join("s")).await.unwrap();
        tokio::fs::write(h.env.library_root.join("s/ch.cbz"), b"data").await.unwrap();
        let mut events = h.queue.events().subscribe();
        let task = h.queue.enqueue(testing::upscale(9, "s/ch.cbz")).await.unwrap();

        h.start();
        let done = h.wait_for(task.id, TaskStatus::Completed).await;

        assert_eq!(done.progress.current, 1);
        assert_eq!(done.progress.total, 1);
        assert_eq!(h.env.ready_chapters(), vec![9]);

        let mut saw_running_progress = false;
        while let Ok(event) = events.try_recv() {
            if let TaskEvent::Updated(record) = event {
                if record.status == TaskStatus::Processing && record.progress.total > 0 {
                    saw_running_progress = true;
                }
            }
        }
        assert!(saw_running_progress);
    }

    // ============================================================
    // CANCELLATION
    // ============================================================

    #[tokio::test]
    async fn test_cancel_current_checks_identity() {
        let h = harness(Lane::Standard);
        h.env.script("long", Behavior::BlockUntilCancelled);
        let long = h.queue.enqueue(testing::scan("long")).await.unwrap();

        h.start();
        h.wait_until_running(long.id).await;

        assert!(!h.executor.cancel_current(TaskId(long.id.0 + 1)).await);
        assert!(h.executor.cancel_current(long.id).await);

        let canceled = h.wait_for(long.id, TaskStatus::Canceled).await;
        assert_eq!(canceled.retry_count, 0);
        assert!(h.executor.current_task().is_none());
    }

    #[tokio::test]
    async fn test_cancel_of_finished_task_does_not_touch_successor() {
        let h = harness(Lane::Standard);
        h.env.script("second", Behavior::BlockUntilCancelled);
        let first = h.queue.enqueue(testing::scan("first")).await.unwrap();
        let second = h.queue.enqueue(testing::scan("second")).await.unwrap();

        h.start();
        h.wait_for(first.id, TaskStatus::Completed).await;
        h.wait_until_running(second.id).await;

        assert!(!h.executor.cancel_current(first.id).await);
        assert_eq!(h.executor.current_task(), Some(second.id));
        h.executor.cancel_current(second.id).await;
    }

    #[tokio::test]
    async fn test_shutdown_leaves_running_task_processing() {
        let h = harness(Lane::Standard);
        h.env.script("long", Behavior::BlockUntilCancelled);
        let long = h.queue.enqueue(testing::scan("long")).await.unwrap();

        h.start();
        h.wait_until_running(long.id).await;
        h.shutdown.cancel();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            h.store.get(long.id).await.unwrap().unwrap().status,
            TaskStatus::Processing
        );
    }
}
