use super::{StoreError, TaskStore};
use crate::tasks::{TaskId, TaskPayload, TaskProgress, TaskRecord, TaskStatus, now_ms};

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    sort_order INTEGER NOT NULL,
    status TEXT NOT NULL,
    lane TEXT NOT NULL,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    progress TEXT NOT NULL,
    created_at_ms INTEGER NOT NULL,
    processed_at_ms INTEGER,
    retry_count INTEGER NOT NULL DEFAULT 0,
    last_keep_alive_ms INTEGER,
    last_error TEXT
);
CREATE INDEX IF NOT EXISTS idx_tasks_status_order ON tasks(status, sort_order);
CREATE TABLE IF NOT EXISTS task_sequence (
    name TEXT PRIMARY KEY,
    value INTEGER NOT NULL
);
INSERT OR IGNORE INTO task_sequence(name, value) VALUES ('order', 0);
";

const COLUMNS: &str = "id, sort_order, status, payload, progress, created_at_ms, \
                       processed_at_ms, retry_count, last_keep_alive_ms, last_error";

/// SQLite-backed task store.
///
/// `rusqlite` is blocking, so every call runs on the blocking pool behind a
/// single connection mutex.
#[derive(Clone)]
pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTaskStore {
    /// Opens (creating if needed) the database file in WAL mode and applies the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&mut guard)
        })
        .await?
    }
}

/// Raw column values, converted to a `TaskRecord` outside of rusqlite's row closure.
struct TaskRow {
    id: i64,
    order: i64,
    status: String,
    payload: String,
    progress: String,
    created_at: i64,
    processed_at: Option<i64>,
    retry_count: i64,
    last_keep_alive: Option<i64>,
    last_error: Option<String>,
}

fn read_row(row: &rusqlite::Row<'_>) -> Result<TaskRow, rusqlite::Error> {
    Ok(TaskRow {
        id: row.get(0)?,
        order: row.get(1)?,
        status: row.get(2)?,
        payload: row.get(3)?,
        progress: row.get(4)?,
        created_at: row.get(5)?,
        processed_at: row.get(6)?,
        retry_count: row.get(7)?,
        last_keep_alive: row.get(8)?,
        last_error: row.get(9)?,
    })
}

impl TryFrom<TaskRow> for TaskRecord {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<TaskStatus>()
            .map_err(|reason| StoreError::InvalidRow { id: row.id, reason })?;
        let payload: TaskPayload = serde_json::from_str(&row.payload)?;
        let progress: TaskProgress = serde_json::from_str(&row.progress)?;

        Ok(TaskRecord {
            id: TaskId(row.id),
            order: row.order,
            status,
            payload,
            progress,
            created_at: row.created_at as u64,
            processed_at: row.processed_at.map(|ms| ms as u64),
            retry_count: row.retry_count as u32,
            last_keep_alive: row.last_keep_alive.map(|ms| ms as u64),
            last_error: row.last_error,
        })
    }
}

fn query_records(
    conn: &Connection,
    sql: &str,
    values: Vec<rusqlite::types::Value>,
) -> Result<Vec<TaskRecord>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params_from_iter(values), read_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(TaskRecord::try_from).collect()
}

fn write_record(conn: &Connection, record: &TaskRecord) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE tasks SET sort_order = ?1, status = ?2, payload = ?3, progress = ?4, \
         processed_at_ms = ?5, retry_count = ?6, last_keep_alive_ms = ?7, last_error = ?8 \
         WHERE id = ?9",
        params![
            record.order,
            record.status.to_string(),
            serde_json::to_string(&record.payload)?,
            serde_json::to_string(&record.progress)?,
            record.processed_at.map(|ms| ms as i64),
            record.retry_count as i64,
            record.last_keep_alive.map(|ms| ms as i64),
            record.last_error,
            record.id.0,
        ],
    )?;

    if changed == 0 {
        return Err(StoreError::UnknownTask(record.id));
    }
    Ok(())
}

/// Compares the stored status before writing; both happen inside the caller's transaction.
fn write_record_if(conn: &Connection, record: &TaskRecord, expected: TaskStatus) -> Result<bool, StoreError> {
    let current: Option<String> = conn
        .query_row("SELECT status FROM tasks WHERE id = ?1", params![record.id.0], |row| row.get(0))
        .optional()?;
    match current {
        None => Err(StoreError::UnknownTask(record.id)),
        Some(status) if status != expected.to_string() => Ok(false),
        Some(_) => write_record(conn, record).map(|_| true),
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert(&self, payload: TaskPayload) -> Result<TaskRecord, StoreError> {
        self.run(move |conn| {
            let tx = conn.transaction()?;

            let high_water: i64 = tx.query_row(
                "SELECT MAX(value, (SELECT COALESCE(MAX(sort_order), 0) FROM tasks)) \
                 FROM task_sequence WHERE name = 'order'",
                [],
                |row| row.get(0),
            )?;
            let order = high_water + 1;
            let created_at = now_ms();
            let progress = TaskProgress::default();

            tx.execute(
                "INSERT INTO tasks (sort_order, status, lane, kind, payload, progress, created_at_ms, retry_count) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
                params![
                    order,
                    TaskStatus::Pending.to_string(),
                    payload.lane().as_str(),
                    payload.kind(),
                    serde_json::to_string(&payload)?,
                    serde_json::to_string(&progress)?,
                    created_at as i64,
                ],
            )?;
            let id = tx.last_insert_rowid();
            tx.execute(
                "UPDATE task_sequence SET value = ?1 WHERE name = 'order'",
                params![order],
            )?;
            tx.commit()?;

            Ok(TaskRecord {
                id: TaskId(id),
                order,
                status: TaskStatus::Pending,
                payload,
                progress,
                created_at,
                processed_at: None,
                retry_count: 0,
                last_keep_alive: None,
                last_error: None,
            })
        })
        .await
    }

    async fn update(&self, record: &TaskRecord) -> Result<(), StoreError> {
        let record = record.clone();
        self.run(move |conn| write_record(conn, &record)).await
    }

    async fn update_many(&self, records: &[TaskRecord]) -> Result<(), StoreError> {
        let records = records.to_vec();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            for record in &records {
                write_record(&tx, record)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn update_many_if(&self, records: &[(TaskRecord, TaskStatus)]) -> Result<bool, StoreError> {
        let records = records.to_vec();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            for (record, expected) in &records {
                if !write_record_if(&tx, record, *expected)? {
                    // Dropping the transaction rolls back earlier rows.
                    return Ok(false);
                }
            }
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn get(&self, id: TaskId) -> Result<Option<TaskRecord>, StoreError> {
        self.run(move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {} FROM tasks WHERE id = ?1", COLUMNS),
                    params![id.0],
                    read_row,
                )
                .optional()?;
            row.map(TaskRecord::try_from).transpose()
        })
        .await
    }

    async fn find_by_order(&self, order: i64) -> Result<Option<TaskRecord>, StoreError> {
        self.run(move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {} FROM tasks WHERE sort_order = ?1 LIMIT 1", COLUMNS),
                    params![order],
                    read_row,
                )
                .optional()?;
            row.map(TaskRecord::try_from).transpose()
        })
        .await
    }

    async fn list_by_status(&self, statuses: &[TaskStatus]) -> Result<Vec<TaskRecord>, StoreError> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let values: Vec<rusqlite::types::Value> = statuses
            .iter()
            .map(|s| rusqlite::types::Value::Text(s.to_string()))
            .collect();
        let placeholders = vec!["?"; values.len()].join(", ");
        let sql = format!(
            "SELECT {} FROM tasks WHERE status IN ({}) ORDER BY sort_order ASC",
            COLUMNS, placeholders
        );

        self.run(move |conn| query_records(conn, &sql, values)).await
    }

    async fn list_all(&self) -> Result<Vec<TaskRecord>, StoreError> {
        let sql = format!("SELECT {} FROM tasks ORDER BY sort_order ASC", COLUMNS);
        self.run(move |conn| query_records(conn, &sql, Vec::new())).await
    }

    async fn delete(&self, ids: &[TaskId]) -> Result<usize, StoreError> {
        let ids = ids.to_vec();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let mut deleted = 0;
            {
                let mut stmt = tx.prepare("DELETE FROM tasks WHERE id = ?1")?;
                for id in &ids {
                    deleted += stmt.execute(params![id.0])?;
                }
            }
            tx.commit()?;
            Ok(deleted)
        })
        .await
    }
}
