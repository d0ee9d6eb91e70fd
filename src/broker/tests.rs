//! Broker Module Tests
//!
//! ## Test Scopes
//! - **Leasing**: `get_task` handoff, timeout, many concurrent leases.
//! - **Liveness**: Keepalive semantics and the reaper (including the worker-silence scenario).
//! - **Lease end**: Completion, worker-reported failure, guarded cancellation.

#[cfg(test)]
mod tests {
    use crate::broker::{LeasePolicy, RemoteWorkBroker};
    use crate::executor::CancelCurrent;
    use crate::queue::{RetentionPolicy, TaskEvent, TaskQueue};
    use crate::store::{MemoryTaskStore, TaskStore};
    use crate::tasks::testing;
    use crate::tasks::{Lane, TaskId, TaskProgress, TaskStatus};
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Harness {
        store: Arc<MemoryTaskStore>,
        queue: Arc<TaskQueue>,
        broker: Arc<RemoteWorkBroker>,
        shutdown: CancellationToken,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.shutdown.cancel();
        }
    }

    fn harness(staleness_ms: u64, timeout_ms: u64) -> Harness {
        let store = Arc::new(MemoryTaskStore::new());
        let queue = TaskQueue::new(store.clone(), RetentionPolicy::default());
        let broker = RemoteWorkBroker::new(
            queue.clone(),
            LeasePolicy {
                staleness: Duration::from_millis(staleness_ms),
                reaper_interval: Duration::from_secs(3600),
                get_task_timeout: Duration::from_millis(timeout_ms),
            },
        );
        let shutdown = CancellationToken::new();

        let lane = queue.take_receiver(Lane::ComputeHeavy).unwrap();
        tokio::spawn(queue.clone().run_pump(Lane::ComputeHeavy, shutdown.clone()));
        tokio::spawn(broker.clone().run_distribution(lane, shutdown.clone()));

        Harness {
            store,
            queue,
            broker,
            shutdown,
        }
    }

    async fn status(store: &MemoryTaskStore, id: TaskId) -> TaskStatus {
        store.get(id).await.unwrap().unwrap().status
    }

    // ============================================================
    // LEASING
    // ============================================================

    #[tokio::test]
    async fn test_get_task_hands_out_pending_task() {
        let h = harness(60_000, 1_000);
        let task = h.queue.enqueue(testing::upscale(1, "a.cbz")).await.unwrap();

        let leased = h.broker.get_task().await.unwrap();

        assert_eq!(leased.id, task.id);
        assert_eq!(leased.status, TaskStatus::Processing);
        assert_eq!(status(&h.store, task.id).await, TaskStatus::Processing);
        assert!(h.broker.leased(task.id).is_some());
    }

    #[tokio::test]
    async fn test_get_task_times_out_when_lane_is_empty() {
        let h = harness(60_000, 50);

        let started = std::time::Instant::now();
        let leased = h.broker.get_task().await;

        assert!(leased.is_none());
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(h.broker.lease_count(), 0);
    }

    #[tokio::test]
    async fn test_task_enqueued_after_timeout_reaches_next_requester() {
        let h = harness(60_000, 50);
        assert!(h.broker.get_task().await.is_none());

        let task = h.queue.enqueue(testing::upscale(1, "late.cbz")).await.unwrap();
        let mut leased = None;
        for _ in 0..20 {
            leased = h.broker.get_task().await;
            if leased.is_some() {
                break;
            }
        }

        assert_eq!(leased.unwrap().id, task.id);
    }

    #[tokio::test]
    async fn test_many_concurrent_leases() {
        let h = harness(60_000, 1_000);
        for i in 0..3 {
            h.queue
                .enqueue(testing::upscale(i, &format!("{}.cbz", i)))
                .await
                .unwrap();
        }

        let mut ids = HashSet::new();
        for _ in 0..3 {
            ids.insert(h.broker.get_task().await.unwrap().id);
        }

        assert_eq!(ids.len(), 3);
        assert_eq!(h.broker.lease_count(), 3);
        for id in ids {
            assert_eq!(status(&h.store, id).await, TaskStatus::Processing);
        }
    }

    // ============================================================
    // LIVENESS
    // ============================================================

    #[tokio::test]
    async fn test_silent_worker_lease_is_failed() {
        // ARRANGE: one compute task leased by a worker
        let h = harness(100, 1_000);
        h.queue.enqueue(testing::upscale(1, "a.cbz")).await.unwrap();
        let id = h.broker.get_task().await.unwrap().id;
        assert!(!id.is_sentinel());

        // ACT: one keepalive, then silence past the staleness window
        assert!(h.broker.keep_alive(id, None));
        tokio::time::sleep(Duration::from_millis(200)).await;
        let reaped = h.broker.reap_expired().await;

        // ASSERT
        assert_eq!(reaped, vec![id]);
        let failed = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.last_error.as_deref(), Some("lease expired"));
        assert!(!h.broker.keep_alive(id, None));
    }

    #[tokio::test]
    async fn test_keep_alive_defers_the_reaper() {
        let h = harness(150, 1_000);
        h.queue.enqueue(testing::upscale(1, "a.cbz")).await.unwrap();
        let id = h.broker.get_task().await.unwrap().id;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(h.broker.keep_alive(id, None));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(h.broker.reap_expired().await.is_empty());
        assert_eq!(status(&h.store, id).await, TaskStatus::Processing);
    }

    #[tokio::test]
    async fn test_keep_alive_on_unknown_task_is_not_alive() {
        let h = harness(60_000, 1_000);
        assert!(!h.broker.keep_alive(TaskId(12345), None));
    }

    #[tokio::test]
    async fn test_keep_alive_relays_progress() {
        let h = harness(60_000, 1_000);
        h.queue.enqueue(testing::upscale(1, "a.cbz")).await.unwrap();
        let id = h.broker.get_task().await.unwrap().id;
        let mut events = h.queue.events().subscribe();

        let progress = TaskProgress {
            current: 3,
            total: 10,
            status_message: "Upscaling page 3".into(),
        };
        assert!(h.broker.keep_alive(id, Some(progress.clone())));

        match events.recv().await.unwrap() {
            TaskEvent::Updated(record) => {
                assert_eq!(record.id, id);
                assert_eq!(record.progress, progress);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    // ============================================================
    // LEASE END
    // ============================================================

    #[tokio::test]
    async fn test_complete_ends_the_lease() {
        let h = harness(60_000, 1_000);
        h.queue.enqueue(testing::upscale(1, "a.cbz")).await.unwrap();
        let id = h.broker.get_task().await.unwrap().id;

        assert!(h.broker.complete(id).await.unwrap());

        let done = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        assert!(done.processed_at.is_some());
        assert!(!h.broker.keep_alive(id, None));
        assert!(!h.broker.complete(id).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_progress_never_arrives_after_completion() {
        // ARRANGE
        let h = harness(60_000, 1_000);
        h.queue.enqueue(testing::upscale(1, "a.cbz")).await.unwrap();
        let id = h.broker.get_task().await.unwrap().id;
        let mut events = h.queue.events().subscribe();

        // ACT: a worker keeps reporting progress while the result lands
        let broker = h.broker.clone();
        let reporter = tokio::spawn(async move {
            for step in 0..300u64 {
                let progress = TaskProgress {
                    current: step,
                    total: 300,
                    status_message: "Upscaling".to_string(),
                };
                if !broker.keep_alive(id, Some(progress)) {
                    break;
                }
                tokio::task::yield_now().await;
            }
        });
        tokio::time::sleep(Duration::from_millis(2)).await;
        assert!(h.broker.complete(id).await.unwrap());
        reporter.await.unwrap();

        // ASSERT: the last event seen for the task is the completion
        let mut last = None;
        while let Ok(event) = events.try_recv() {
            if let TaskEvent::Updated(record) = event {
                if record.id == id {
                    last = Some(record.status);
                }
            }
        }
        assert_eq!(last, Some(TaskStatus::Completed));
        assert!(!h.broker.keep_alive(id, None));
    }

    #[tokio::test]
    async fn test_worker_reported_failure() {
        let h = harness(60_000, 1_000);
        h.queue.enqueue(testing::upscale(1, "a.cbz")).await.unwrap();
        let id = h.broker.get_task().await.unwrap().id;

        assert!(h.broker.fail(id, "upscaler crashed").await.unwrap());

        let failed = h.store.get(id).await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.last_error.as_deref(), Some("upscaler crashed"));
        assert_eq!(h.broker.lease_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_current_requires_live_lease() {
        let h = harness(60_000, 1_000);
        h.queue.enqueue(testing::upscale(1, "a.cbz")).await.unwrap();
        let id = h.broker.get_task().await.unwrap().id;

        assert!(!h.broker.cancel_current(TaskId(id.0 + 100)).await);
        assert!(h.broker.cancel_current(id).await);
        assert!(!h.broker.cancel_current(id).await);

        assert_eq!(status(&h.store, id).await, TaskStatus::Canceled);
        assert!(!h.broker.keep_alive(id, None));
    }

    #[tokio::test]
    async fn test_removed_task_is_not_leased() {
        let h = harness(60_000, 200);
        let doomed = h.queue.enqueue(testing::upscale(1, "a.cbz")).await.unwrap();
        let kept = h.queue.enqueue(testing::upscale(2, "b.cbz")).await.unwrap();

        // The pump may already hold `doomed` in the channel slot.
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.queue.remove(doomed.id).await.unwrap();

        let leased = h.broker.get_task().await.unwrap();
        assert_eq!(leased.id, kept.id);
    }
}
