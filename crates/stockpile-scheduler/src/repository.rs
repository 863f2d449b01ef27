//! SQLite-backed task repository — the single owner of task and result
//! records. All mutation goes through atomic single-row updates; the claim
//! is a conditional UPDATE so at most one executor wins a given task.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use stockpile_core::{Result, StockpileError};

use crate::task::{CollectionResult, CollectionTask, TaskSpec, TaskStatus};

/// Durable store of tasks and results.
///
/// Implementations must make `claim` atomic at single-row granularity:
/// under N concurrent claims for the same id, exactly one returns the task.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Create a new PENDING task from a spec. Returns its id.
    async fn create(&self, spec: &TaskSpec) -> Result<Uuid>;

    async fn get(&self, id: Uuid) -> Result<Option<CollectionTask>>;

    /// Most recently created tasks, newest first.
    async fn list(&self, limit: usize) -> Result<Vec<CollectionTask>>;

    /// Ids of PENDING tasks whose `scheduled_at` has passed, oldest first.
    async fn find_due(&self, limit: usize) -> Result<Vec<Uuid>>;

    /// Conditionally transition PENDING→RUNNING and stamp `started_at`.
    /// Returns the freshly re-read task on success, `None` when the task is
    /// not claimable (already claimed, not due, terminal, or missing).
    async fn claim(&self, id: Uuid) -> Result<Option<CollectionTask>>;

    /// Terminal success: COMPLETED, `completed_at` stamped, error cleared.
    async fn mark_completed(&self, id: Uuid, completed_at: DateTime<Utc>) -> Result<()>;

    /// Terminal failure: FAILED with the last error and final retry count.
    async fn mark_failed(&self, id: Uuid, error: &str, retry_count: u32) -> Result<()>;

    /// Failed attempt with retry budget left: back to PENDING, due again at
    /// `next_at`, bookkeeping updated.
    async fn reschedule_retry(
        &self,
        id: Uuid,
        error: &str,
        retry_count: u32,
        next_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Append one immutable result record.
    async fn append_result(&self, result: &CollectionResult) -> Result<()>;

    async fn results_for(&self, task_id: Uuid) -> Result<Vec<CollectionResult>>;

    /// Cancel a PENDING task. Rejected while RUNNING.
    async fn cancel(&self, id: Uuid) -> Result<()>;

    /// Delete a task and (cascade) its results. Rejected while RUNNING.
    async fn delete(&self, id: Uuid) -> Result<()>;

    /// Startup sweep: RUNNING tasks whose `started_at` predates
    /// `older_than` lost their owner in a crash; reset them to PENDING.
    /// Returns how many were reset.
    async fn reset_stale_running(&self, older_than: DateTime<Utc>) -> Result<usize>;
}

/// rfc3339 with fixed sub-second width so TEXT comparison orders correctly.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> std::result::Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp '{s}': {e}"))
}

fn conversion_err(msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, msg.into())
}

/// SQLite implementation. The connection is guarded by a short mutex; no
/// await happens while it is held.
pub struct SqliteTaskRepository {
    conn: Mutex<Connection>,
}

impl SqliteTaskRepository {
    /// Open or create the task database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)
            .map_err(|e| StockpileError::Database(format!("DB open: {e}")))?;
        Self::init(conn)
    }

    /// In-memory database, used by tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StockpileError::Database(format!("DB open: {e}")))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS collection_tasks (
                id TEXT PRIMARY KEY,
                collection_type TEXT NOT NULL,
                parameters TEXT NOT NULL DEFAULT 'null',
                status TEXT NOT NULL DEFAULT 'pending',
                scheduled_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                error_message TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                is_recurring INTEGER NOT NULL DEFAULT 0,
                interval_minutes INTEGER,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_due
                ON collection_tasks (status, scheduled_at);

            CREATE TABLE IF NOT EXISTS collection_results (
                id TEXT PRIMARY KEY,
                task_id TEXT NOT NULL
                    REFERENCES collection_tasks(id) ON DELETE CASCADE,
                data_count INTEGER NOT NULL DEFAULT 0,
                storage_location TEXT,
                metadata TEXT NOT NULL DEFAULT 'null',
                created_at TEXT NOT NULL
            );
            ",
        )
        .map_err(|e| StockpileError::Database(format!("Migration: {e}")))?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A poisoned lock only means another thread panicked mid-query;
        // the connection itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn map_task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CollectionTask> {
        let id: String = row.get(0)?;
        let collection_type: String = row.get(1)?;
        let parameters: String = row.get(2)?;
        let status: String = row.get(3)?;
        let scheduled_at: String = row.get(4)?;
        let started_at: Option<String> = row.get(5)?;
        let completed_at: Option<String> = row.get(6)?;
        let error_message: Option<String> = row.get(7)?;
        let retry_count: u32 = row.get(8)?;
        let max_retries: u32 = row.get(9)?;
        let is_recurring: bool = row.get::<_, i64>(10)? != 0;
        let interval_minutes: Option<i64> = row.get(11)?;
        let created_at: String = row.get(12)?;

        Ok(CollectionTask {
            id: Uuid::parse_str(&id)
                .map_err(|e| conversion_err(format!("bad task id '{id}': {e}")))?,
            collection_type: collection_type.parse().map_err(conversion_err)?,
            parameters: serde_json::from_str(&parameters)
                .unwrap_or(serde_json::Value::Null),
            status: status.parse().map_err(conversion_err)?,
            scheduled_at: parse_ts(&scheduled_at).map_err(conversion_err)?,
            started_at: started_at.as_deref().map(parse_ts).transpose().map_err(conversion_err)?,
            completed_at: completed_at.as_deref().map(parse_ts).transpose().map_err(conversion_err)?,
            error_message,
            retry_count,
            max_retries,
            is_recurring,
            interval_minutes,
            created_at: parse_ts(&created_at).map_err(conversion_err)?,
        })
    }

    fn get_sync(conn: &Connection, id: Uuid) -> Result<Option<CollectionTask>> {
        let mut stmt = conn
            .prepare(
                "SELECT id, collection_type, parameters, status, scheduled_at, started_at,
                        completed_at, error_message, retry_count, max_retries, is_recurring,
                        interval_minutes, created_at
                 FROM collection_tasks WHERE id = ?1",
            )
            .map_err(|e| StockpileError::Database(format!("Prepare get: {e}")))?;
        let task = stmt
            .query_row([id.to_string()], Self::map_task_row)
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(StockpileError::Database(format!("Get task: {other}"))),
            })?;
        Ok(task)
    }

    fn status_of(conn: &Connection, id: Uuid) -> Result<TaskStatus> {
        let status: String = conn
            .query_row(
                "SELECT status FROM collection_tasks WHERE id = ?1",
                [id.to_string()],
                |row| row.get(0),
            )
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    Err(StockpileError::TaskNotFound(id.to_string()))
                }
                other => Err(StockpileError::Database(format!("Get status: {other}"))),
            })?;
        status
            .parse()
            .map_err(StockpileError::Database)
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    async fn create(&self, spec: &TaskSpec) -> Result<Uuid> {
        let task = CollectionTask::from_spec(spec);
        let conn = self.conn();
        conn.execute(
            "INSERT INTO collection_tasks
             (id, collection_type, parameters, status, scheduled_at, started_at, completed_at,
              error_message, retry_count, max_retries, is_recurring, interval_minutes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL, NULL, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                task.id.to_string(),
                task.collection_type.as_str(),
                task.parameters.to_string(),
                task.status.as_str(),
                fmt_ts(task.scheduled_at),
                task.retry_count,
                task.max_retries,
                task.is_recurring as i64,
                task.interval_minutes,
                fmt_ts(task.created_at),
            ],
        )
        .map_err(|e| StockpileError::Database(format!("Create task: {e}")))?;
        Ok(task.id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<CollectionTask>> {
        Self::get_sync(&self.conn(), id)
    }

    async fn list(&self, limit: usize) -> Result<Vec<CollectionTask>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, collection_type, parameters, status, scheduled_at, started_at,
                        completed_at, error_message, retry_count, max_retries, is_recurring,
                        interval_minutes, created_at
                 FROM collection_tasks ORDER BY created_at DESC LIMIT ?1",
            )
            .map_err(|e| StockpileError::Database(format!("Prepare list: {e}")))?;
        let tasks = stmt
            .query_map([limit as i64], Self::map_task_row)
            .map_err(|e| StockpileError::Database(format!("List tasks: {e}")))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| StockpileError::Database(format!("List tasks: {e}")))?;
        Ok(tasks)
    }

    async fn find_due(&self, limit: usize) -> Result<Vec<Uuid>> {
        let now = fmt_ts(Utc::now());
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id FROM collection_tasks
                 WHERE status = 'pending' AND scheduled_at <= ?1
                 ORDER BY scheduled_at LIMIT ?2",
            )
            .map_err(|e| StockpileError::Database(format!("Prepare find_due: {e}")))?;
        let ids = stmt
            .query_map(rusqlite::params![now, limit as i64], |row| {
                let id: String = row.get(0)?;
                Uuid::parse_str(&id)
                    .map_err(|e| conversion_err(format!("bad task id '{id}': {e}")))
            })
            .map_err(|e| StockpileError::Database(format!("Find due: {e}")))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| StockpileError::Database(format!("Find due: {e}")))?;
        Ok(ids)
    }

    async fn claim(&self, id: Uuid) -> Result<Option<CollectionTask>> {
        let now = Utc::now();
        let conn = self.conn();
        // Compare-and-set on status: the WHERE clause is the eligibility
        // check and the UPDATE is the transition, one atomic statement.
        let changed = conn
            .execute(
                "UPDATE collection_tasks
                 SET status = 'running', started_at = ?1
                 WHERE id = ?2 AND status = 'pending' AND scheduled_at <= ?1",
                rusqlite::params![fmt_ts(now), id.to_string()],
            )
            .map_err(|e| StockpileError::Database(format!("Claim: {e}")))?;
        if changed == 0 {
            return Ok(None);
        }
        Self::get_sync(&conn, id)
    }

    async fn mark_completed(&self, id: Uuid, completed_at: DateTime<Utc>) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE collection_tasks
                 SET status = 'completed', completed_at = ?1, error_message = NULL
                 WHERE id = ?2",
                rusqlite::params![fmt_ts(completed_at), id.to_string()],
            )
            .map_err(|e| StockpileError::Database(format!("Mark completed: {e}")))?;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str, retry_count: u32) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE collection_tasks
                 SET status = 'failed', error_message = ?1, retry_count = ?2
                 WHERE id = ?3",
                rusqlite::params![error, retry_count, id.to_string()],
            )
            .map_err(|e| StockpileError::Database(format!("Mark failed: {e}")))?;
        Ok(())
    }

    async fn reschedule_retry(
        &self,
        id: Uuid,
        error: &str,
        retry_count: u32,
        next_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE collection_tasks
                 SET status = 'pending', error_message = ?1, retry_count = ?2,
                     scheduled_at = ?3, started_at = NULL
                 WHERE id = ?4",
                rusqlite::params![error, retry_count, fmt_ts(next_at), id.to_string()],
            )
            .map_err(|e| StockpileError::Database(format!("Reschedule: {e}")))?;
        Ok(())
    }

    async fn append_result(&self, result: &CollectionResult) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO collection_results
                 (id, task_id, data_count, storage_location, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                rusqlite::params![
                    result.id.to_string(),
                    result.task_id.to_string(),
                    result.data_count,
                    result.storage_location,
                    result.metadata.to_string(),
                    fmt_ts(result.created_at),
                ],
            )
            .map_err(|e| StockpileError::Database(format!("Append result: {e}")))?;
        Ok(())
    }

    async fn results_for(&self, task_id: Uuid) -> Result<Vec<CollectionResult>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, task_id, data_count, storage_location, metadata, created_at
                 FROM collection_results WHERE task_id = ?1 ORDER BY created_at",
            )
            .map_err(|e| StockpileError::Database(format!("Prepare results: {e}")))?;
        let results = stmt
            .query_map([task_id.to_string()], |row| {
                let id: String = row.get(0)?;
                let tid: String = row.get(1)?;
                let metadata: String = row.get(4)?;
                let created_at: String = row.get(5)?;
                Ok(CollectionResult {
                    id: Uuid::parse_str(&id)
                        .map_err(|e| conversion_err(format!("bad result id: {e}")))?,
                    task_id: Uuid::parse_str(&tid)
                        .map_err(|e| conversion_err(format!("bad task id: {e}")))?,
                    data_count: row.get(2)?,
                    storage_location: row.get(3)?,
                    metadata: serde_json::from_str(&metadata)
                        .unwrap_or(serde_json::Value::Null),
                    created_at: parse_ts(&created_at).map_err(conversion_err)?,
                })
            })
            .map_err(|e| StockpileError::Database(format!("Results: {e}")))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| StockpileError::Database(format!("Results: {e}")))?;
        Ok(results)
    }

    async fn cancel(&self, id: Uuid) -> Result<()> {
        let conn = self.conn();
        match Self::status_of(&conn, id)? {
            TaskStatus::Running => Err(StockpileError::TaskRunning(id.to_string())),
            _ => {
                conn.execute(
                    "UPDATE collection_tasks SET status = 'cancelled'
                     WHERE id = ?1 AND status = 'pending'",
                    [id.to_string()],
                )
                .map_err(|e| StockpileError::Database(format!("Cancel: {e}")))?;
                Ok(())
            }
        }
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        let conn = self.conn();
        match Self::status_of(&conn, id)? {
            TaskStatus::Running => Err(StockpileError::TaskRunning(id.to_string())),
            _ => {
                conn.execute("DELETE FROM collection_tasks WHERE id = ?1", [id.to_string()])
                    .map_err(|e| StockpileError::Database(format!("Delete: {e}")))?;
                Ok(())
            }
        }
    }

    async fn reset_stale_running(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let reset = self
            .conn()
            .execute(
                "UPDATE collection_tasks
                 SET status = 'pending', started_at = NULL
                 WHERE status = 'running' AND started_at <= ?1",
                [fmt_ts(older_than)],
            )
            .map_err(|e| StockpileError::Database(format!("Stale sweep: {e}")))?;
        Ok(reset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::CollectionType;
    use chrono::Duration;
    use std::sync::Arc;

    fn spec() -> TaskSpec {
        TaskSpec::immediate(
            CollectionType::StockPrice,
            serde_json::json!({"symbol": "005930"}),
        )
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let repo = SqliteTaskRepository::in_memory().unwrap();
        let id = repo.create(&spec()).await.unwrap();
        let task = repo.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.collection_type, CollectionType::StockPrice);
        assert_eq!(task.parameters["symbol"], "005930");
        assert!(repo.get(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_due_excludes_future_and_nonpending() {
        let repo = SqliteTaskRepository::in_memory().unwrap();
        let due = repo.create(&spec()).await.unwrap();

        let mut future = spec();
        future.scheduled_at = Some(Utc::now() + Duration::hours(1));
        repo.create(&future).await.unwrap();

        let claimed = repo.create(&spec()).await.unwrap();
        repo.claim(claimed).await.unwrap().unwrap();

        let ids = repo.find_due(10).await.unwrap();
        assert_eq!(ids, vec![due]);
    }

    #[tokio::test]
    async fn test_claim_stamps_started_at() {
        let repo = SqliteTaskRepository::in_memory().unwrap();
        let id = repo.create(&spec()).await.unwrap();
        let task = repo.claim(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.started_at.is_some());

        // Second claim must lose.
        assert!(repo.claim(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_rejects_future_task() {
        let repo = SqliteTaskRepository::in_memory().unwrap();
        let mut s = spec();
        s.scheduled_at = Some(Utc::now() + Duration::hours(1));
        let id = repo.create(&s).await.unwrap();
        assert!(repo.claim(id).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_at_most_one_concurrent_claim() {
        let repo = Arc::new(SqliteTaskRepository::in_memory().unwrap());
        let id = repo.create(&spec()).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let repo = Arc::clone(&repo);
            handles.push(tokio::spawn(async move {
                repo.claim(id).await.unwrap().is_some()
            }));
        }
        let mut wins = 0;
        for h in handles {
            if h.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }

    #[tokio::test]
    async fn test_reschedule_makes_task_due_later() {
        let repo = SqliteTaskRepository::in_memory().unwrap();
        let id = repo.create(&spec()).await.unwrap();
        repo.claim(id).await.unwrap().unwrap();

        let next = Utc::now() + Duration::minutes(2);
        repo.reschedule_retry(id, "boom", 1, next).await.unwrap();

        let task = repo.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.error_message.as_deref(), Some("boom"));
        assert!(task.started_at.is_none());
        assert!(repo.find_due(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_completed_clears_error() {
        let repo = SqliteTaskRepository::in_memory().unwrap();
        let id = repo.create(&spec()).await.unwrap();
        repo.claim(id).await.unwrap().unwrap();
        repo.reschedule_retry(id, "transient", 1, Utc::now()).await.unwrap();
        repo.claim(id).await.unwrap().unwrap();

        let done = Utc::now();
        repo.mark_completed(id, done).await.unwrap();
        let task = repo.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.error_message.is_none());
        assert!(task.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_cancel_rejected_while_running() {
        let repo = SqliteTaskRepository::in_memory().unwrap();
        let id = repo.create(&spec()).await.unwrap();
        repo.claim(id).await.unwrap().unwrap();

        match repo.cancel(id).await {
            Err(StockpileError::TaskRunning(_)) => {}
            other => panic!("expected TaskRunning, got {other:?}"),
        }
        match repo.delete(id).await {
            Err(StockpileError::TaskRunning(_)) => {}
            other => panic!("expected TaskRunning, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_pending_then_unclaimable() {
        let repo = SqliteTaskRepository::in_memory().unwrap();
        let id = repo.create(&spec()).await.unwrap();
        repo.cancel(id).await.unwrap();
        let task = repo.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(repo.claim(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_cascades_results() {
        let repo = SqliteTaskRepository::in_memory().unwrap();
        let id = repo.create(&spec()).await.unwrap();
        repo.append_result(&CollectionResult::new(
            id,
            5,
            Some("data/test.json".into()),
            serde_json::json!({"count": 5}),
        ))
        .await
        .unwrap();
        assert_eq!(repo.results_for(id).await.unwrap().len(), 1);

        repo.delete(id).await.unwrap();
        assert!(repo.get(id).await.unwrap().is_none());
        assert!(repo.results_for(id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stale_running_sweep() {
        let repo = SqliteTaskRepository::in_memory().unwrap();
        let id = repo.create(&spec()).await.unwrap();
        repo.claim(id).await.unwrap().unwrap();

        // Grace period in the future relative to started_at → stale.
        let reset = repo
            .reset_stale_running(Utc::now() + Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(reset, 1);
        let task = repo.get(id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Pending);

        // Nothing left to sweep.
        assert_eq!(
            repo.reset_stale_running(Utc::now()).await.unwrap(),
            0
        );
    }
}
