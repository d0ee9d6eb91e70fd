//! Store Module Tests
//!
//! Every contract test runs against both the SQLite and the in-memory store.
//!
//! ## Test Scopes
//! - **Insert**: id/order assignment, order monotonicity (also after deletes).
//! - **Queries**: status filters, ordering, lookup by order.
//! - **Mutation**: update, batch update, conditional update, batch delete.
//! - **Durability**: SQLite rows survive reopening the database file.

#[cfg(test)]
mod tests {
    use crate::store::{MemoryTaskStore, SqliteTaskStore, StoreError, TaskStore};
    use crate::tasks::testing;
    use crate::tasks::{TaskId, TaskStatus};
    use std::sync::Arc;

    fn stores() -> Vec<(&'static str, Arc<dyn TaskStore>)> {
        vec![
            ("memory", Arc::new(MemoryTaskStore::new())),
            ("sqlite", Arc::new(SqliteTaskStore::open_in_memory().unwrap())),
        ]
    }

    // ============================================================
    // INSERT
    // ============================================================

    #[tokio::test]
    async fn test_insert_assigns_increasing_orders() {
        for (name, store) in stores() {
            let mut last = 0;
            for i in 0..10 {
                let record = store.insert(testing::scan(&format!("f{}", i))).await.unwrap();
                assert!(record.order > last, "{}: order must grow", name);
                assert_eq!(record.status, TaskStatus::Pending, "{}", name);
                assert_eq!(record.retry_count, 0, "{}", name);
                last = record.order;
            }
        }
    }

    #[tokio::test]
    async fn test_order_is_not_reused_after_deleting_the_newest_task() {
        for (name, store) in stores() {
            store.insert(testing::scan("a")).await.unwrap();
            let newest = store.insert(testing::scan("b")).await.unwrap();

            store.delete(&[newest.id]).await.unwrap();
            let next = store.insert(testing::scan("c")).await.unwrap();

            assert!(next.order > newest.order, "{}: order reused", name);
            assert_ne!(next.id, newest.id, "{}: id reused", name);
        }
    }

    // ============================================================
    // QUERIES
    // ============================================================

    #[tokio::test]
    async fn test_list_by_status_filters_and_sorts() {
        for (name, store) in stores() {
            let a = store.insert(testing::scan("a")).await.unwrap();
            let mut b = store.insert(testing::scan("b")).await.unwrap();
            let c = store.insert(testing::upscale(1, "c.cbz")).await.unwrap();

            b.status = TaskStatus::Failed;
            store.update(&b).await.unwrap();

            let pending = store.list_by_status(&[TaskStatus::Pending]).await.unwrap();
            let ids: Vec<TaskId> = pending.iter().map(|r| r.id).collect();
            assert_eq!(ids, vec![a.id, c.id], "{}", name);

            let both = store
                .list_by_status(&[TaskStatus::Failed, TaskStatus::Pending])
                .await
                .unwrap();
            assert_eq!(both.len(), 3, "{}", name);
            assert!(both.windows(2).all(|w| w[0].order < w[1].order), "{}", name);

            assert!(store.list_by_status(&[]).await.unwrap().is_empty(), "{}", name);
        }
    }

    #[tokio::test]
    async fn test_find_by_order() {
        for (name, store) in stores() {
            let a = store.insert(testing::scan("a")).await.unwrap();

            let found = store.find_by_order(a.order).await.unwrap().unwrap();
            assert_eq!(found.id, a.id, "{}", name);
            assert!(store.find_by_order(a.order + 100).await.unwrap().is_none(), "{}", name);
        }
    }

    // ============================================================
    // MUTATION
    // ============================================================

    #[tokio::test]
    async fn test_update_round_trips_mutable_fields() {
        for (name, store) in stores() {
            let mut record = store.insert(testing::upscale(3, "x.cbz")).await.unwrap();
            record.status = TaskStatus::Completed;
            record.processed_at = Some(1234);
            record.retry_count = 2;
            record.last_keep_alive = Some(999);
            record.last_error = Some("boom".to_string());
            record.progress.current = 4;
            record.progress.total = 9;
            record.progress.status_message = "almost".to_string();

            store.update(&record).await.unwrap();
            let loaded = store.get(record.id).await.unwrap().unwrap();

            assert_eq!(loaded.status, TaskStatus::Completed, "{}", name);
            assert_eq!(loaded.processed_at, Some(1234), "{}", name);
            assert_eq!(loaded.retry_count, 2, "{}", name);
            assert_eq!(loaded.last_keep_alive, Some(999), "{}", name);
            assert_eq!(loaded.last_error.as_deref(), Some("boom"), "{}", name);
            assert_eq!(loaded.progress, record.progress, "{}", name);
            assert_eq!(loaded.payload, record.payload, "{}", name);
        }
    }

    #[tokio::test]
    async fn test_update_unknown_task_is_an_error() {
        for (name, store) in stores() {
            let mut record = store.insert(testing::scan("a")).await.unwrap();
            store.delete(&[record.id]).await.unwrap();
            record.status = TaskStatus::Failed;

            let err = store.update(&record).await.unwrap_err();
            assert!(matches!(err, StoreError::UnknownTask(id) if id == record.id), "{}", name);
        }
    }

    #[tokio::test]
    async fn test_update_many_swaps_orders() {
        for (name, store) in stores() {
            let mut a = store.insert(testing::scan("a")).await.unwrap();
            let mut b = store.insert(testing::scan("b")).await.unwrap();
            std::mem::swap(&mut a.order, &mut b.order);

            store.update_many(&[a.clone(), b.clone()]).await.unwrap();

            let all = store.list_all().await.unwrap();
            assert_eq!(all[0].id, b.id, "{}", name);
            assert_eq!(all[1].id, a.id, "{}", name);
        }
    }

    #[tokio::test]
    async fn test_update_if_writes_only_matching_status() {
        for (name, store) in stores() {
            let mut record = store.insert(testing::scan("a")).await.unwrap();
            record.status = TaskStatus::Processing;

            assert!(!store.update_if(&record, TaskStatus::Failed).await.unwrap(), "{}", name);
            assert_eq!(
                store.get(record.id).await.unwrap().unwrap().status,
                TaskStatus::Pending,
                "{}",
                name
            );

            assert!(store.update_if(&record, TaskStatus::Pending).await.unwrap(), "{}", name);
            assert_eq!(
                store.get(record.id).await.unwrap().unwrap().status,
                TaskStatus::Processing,
                "{}",
                name
            );

            // Second claim with the same expectation loses.
            assert!(!store.update_if(&record, TaskStatus::Pending).await.unwrap(), "{}", name);
        }
    }

    #[tokio::test]
    async fn test_update_many_if_is_all_or_nothing() {
        for (name, store) in stores() {
            let mut a = store.insert(testing::scan("a")).await.unwrap();
            let mut b = store.insert(testing::scan("b")).await.unwrap();
            let mut running = b.clone();
            running.status = TaskStatus::Processing;
            store.update(&running).await.unwrap();

            std::mem::swap(&mut a.order, &mut b.order);
            let written = store
                .update_many_if(&[(a.clone(), TaskStatus::Pending), (b.clone(), TaskStatus::Pending)])
                .await
                .unwrap();

            assert!(!written, "{}", name);
            assert_eq!(store.get(a.id).await.unwrap().unwrap().order, b.order, "{}: a moved", name);
            assert_eq!(
                store.get(b.id).await.unwrap().unwrap().status,
                TaskStatus::Processing,
                "{}",
                name
            );
        }
    }

    #[tokio::test]
    async fn test_update_if_unknown_task_is_an_error() {
        for (name, store) in stores() {
            let mut ghost = store.insert(testing::scan("ghost")).await.unwrap();
            store.delete(&[ghost.id]).await.unwrap();
            ghost.status = TaskStatus::Processing;

            let result = store.update_if(&ghost, TaskStatus::Pending).await;
            assert!(matches!(result, Err(StoreError::UnknownTask(_))), "{}", name);
        }
    }

    #[tokio::test]
    async fn test_batch_delete_counts_removed_rows() {
        for (name, store) in stores() {
            let a = store.insert(testing::scan("a")).await.unwrap();
            let b = store.insert(testing::scan("b")).await.unwrap();
            let c = store.insert(testing::scan("c")).await.unwrap();

            let deleted = store.delete(&[a.id, c.id, TaskId(9_999)]).await.unwrap();

            assert_eq!(deleted, 2, "{}", name);
            let remaining = store.list_all().await.unwrap();
            assert_eq!(remaining.len(), 1, "{}", name);
            assert_eq!(remaining[0].id, b.id, "{}", name);
        }
    }

    // ============================================================
    // DURABILITY
    // ============================================================

    #[tokio::test]
    async fn test_sqlite_rows_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tasks.db");

        let inserted = {
            let store = SqliteTaskStore::open(&path).unwrap();
            let mut record = store.insert(testing::upscale(8, "s/ch8.cbz")).await.unwrap();
            record.status = TaskStatus::Processing;
            store.update(&record).await.unwrap();
            record
        };

        let reopened = SqliteTaskStore::open(&path).unwrap();
        let loaded = reopened.get(inserted.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Processing);
        assert_eq!(loaded.order, inserted.order);

        let next = reopened.insert(testing::scan("later")).await.unwrap();
        assert!(next.order > inserted.order);
    }
}
