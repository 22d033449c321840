//! cadence-storage: SQLite persistence for scheduled tasks and executions.
//!
//! Two tables, `scheduled_tasks` and `task_executions`, mutated row by row.
//! Execution status changes are conditional UPDATEs, so a record can only
//! move forward through its state machine no matter how many processes
//! write to the same database.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex;

use cadence_types::{ScheduledTask, TaskExecution, TaskStatus, TaskType};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Blocking task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS scheduled_tasks (
        id TEXT PRIMARY KEY,
        agent_name TEXT NOT NULL,
        task_name TEXT NOT NULL,
        description TEXT,
        enabled INTEGER NOT NULL DEFAULT 1,
        schedule TEXT NOT NULL,
        task_type TEXT NOT NULL,
        function_ref TEXT NOT NULL,
        args TEXT NOT NULL DEFAULT '[]',
        kwargs TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_scheduled_tasks_agent ON scheduled_tasks(agent_name);

    CREATE TABLE IF NOT EXISTS task_executions (
        id TEXT PRIMARY KEY,
        scheduled_task_id TEXT,
        agent_name TEXT NOT NULL,
        task_name TEXT NOT NULL,
        status TEXT NOT NULL,
        function_ref TEXT NOT NULL,
        args TEXT NOT NULL DEFAULT '[]',
        kwargs TEXT NOT NULL DEFAULT '{}',
        result TEXT,
        error TEXT,
        started_at TEXT,
        completed_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_task_executions_task ON task_executions(scheduled_task_id);
    CREATE INDEX IF NOT EXISTS idx_task_executions_agent ON task_executions(agent_name);
    CREATE INDEX IF NOT EXISTS idx_task_executions_status ON task_executions(status);
";

const TASK_COLUMNS: &str = "id, agent_name, task_name, description, enabled, schedule, task_type, \
     function_ref, args, kwargs, created_at, updated_at";

const EXECUTION_COLUMNS: &str = "id, scheduled_task_id, agent_name, task_name, status, function_ref, \
     args, kwargs, result, error, started_at, completed_at, created_at, updated_at";

/// A forward-only status change for an execution record.
#[derive(Debug, Clone)]
pub enum Transition {
    /// `queued → running`.
    Start,
    /// `running → success`, storing the result.
    Succeed(Value),
    /// `running → failed`, storing the error message.
    Fail(String),
    /// `queued | running → cancelled`.
    Cancel,
}

impl Transition {
    pub fn target(&self) -> TaskStatus {
        match self {
            Transition::Start => TaskStatus::Running,
            Transition::Succeed(_) => TaskStatus::Success,
            Transition::Fail(_) => TaskStatus::Failed,
            Transition::Cancel => TaskStatus::Cancelled,
        }
    }
}

/// Query filter for listing executions. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub agent_name: Option<String>,
    pub status: Option<TaskStatus>,
    pub scheduled_task_id: Option<String>,
    pub limit: Option<usize>,
}

/// SQLite-backed store for task definitions and execution records.
pub struct CadenceStorage {
    conn: Arc<Mutex<Connection>>,
}

impl CadenceStorage {
    /// Open (or create) the SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // Several processes (scheduler, workers, CLI) share this file
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        conn.execute_batch(SCHEMA)?;

        tracing::info!("Storage opened: {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ─── Scheduled Tasks ────────────────────────────────────

    /// Insert a task definition, or replace the configuration of an existing one.
    ///
    /// `created_at` of an existing row is preserved.
    pub async fn upsert_task(&self, task: &ScheduledTask) -> Result<()> {
        let conn = self.conn.clone();
        let task = task.clone();
        let args = serde_json::to_string(&task.args)?;
        let kwargs = serde_json::to_string(&task.kwargs)?;
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT INTO scheduled_tasks
                    (id, agent_name, task_name, description, enabled, schedule, task_type,
                     function_ref, args, kwargs, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(id) DO UPDATE SET
                    agent_name = excluded.agent_name,
                    task_name = excluded.task_name,
                    description = excluded.description,
                    enabled = excluded.enabled,
                    schedule = excluded.schedule,
                    task_type = excluded.task_type,
                    function_ref = excluded.function_ref,
                    args = excluded.args,
                    kwargs = excluded.kwargs,
                    updated_at = excluded.updated_at",
                rusqlite::params![
                    task.id,
                    task.agent_name,
                    task.task_name,
                    task.description,
                    task.enabled as i32,
                    task.schedule,
                    task.task_type.as_str(),
                    task.function_ref,
                    args,
                    kwargs,
                    ts(task.created_at),
                    ts(Utc::now()),
                ],
            )?;
            Ok(())
        })
        .await?
    }

    /// Get a task definition by id.
    pub async fn get_task(&self, id: &str) -> Result<Option<ScheduledTask>> {
        let conn = self.conn.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let result = conn
                .query_row(
                    &format!("SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE id = ?1"),
                    rusqlite::params![id],
                    row_to_task,
                )
                .optional()?;
            Ok(result)
        })
        .await?
    }

    /// List task definitions, optionally for a single agent.
    pub async fn list_tasks(&self, agent_name: Option<&str>) -> Result<Vec<ScheduledTask>> {
        let conn = self.conn.clone();
        let agent_name = agent_name.map(str::to_string);
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let rows = match agent_name {
                Some(agent) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {TASK_COLUMNS} FROM scheduled_tasks
                         WHERE agent_name = ?1 ORDER BY id"
                    ))?;
                    stmt.query_map(rusqlite::params![agent], row_to_task)?
                        .collect::<std::result::Result<Vec<_>, _>>()?
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {TASK_COLUMNS} FROM scheduled_tasks ORDER BY id"
                    ))?;
                    stmt.query_map([], row_to_task)?
                        .collect::<std::result::Result<Vec<_>, _>>()?
                }
            };
            Ok(rows)
        })
        .await?
    }

    /// Flip the enabled flag. Returns false if the task does not exist.
    pub async fn set_task_enabled(&self, id: &str, enabled: bool) -> Result<bool> {
        let conn = self.conn.clone();
        let id = id.to_string();
        let now = ts(Utc::now());
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let count = conn.execute(
                "UPDATE scheduled_tasks SET enabled = ?1, updated_at = ?2 WHERE id = ?3",
                rusqlite::params![enabled as i32, now, id],
            )?;
            Ok(count > 0)
        })
        .await?
    }

    /// Remove a task definition. Its execution history is kept.
    pub async fn delete_task(&self, id: &str) -> Result<bool> {
        let conn = self.conn.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let count = conn.execute(
                "DELETE FROM scheduled_tasks WHERE id = ?1",
                rusqlite::params![id],
            )?;
            Ok(count > 0)
        })
        .await?
    }

    // ─── Task Executions ────────────────────────────────────

    /// Insert a new execution record. Returns false if the id already exists.
    pub async fn insert_execution(&self, execution: &TaskExecution) -> Result<bool> {
        let conn = self.conn.clone();
        let exec = execution.clone();
        let args = serde_json::to_string(&exec.args)?;
        let kwargs = serde_json::to_string(&exec.kwargs)?;
        let result = exec.result.as_ref().map(serde_json::to_string).transpose()?;
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let count = conn.execute(
                "INSERT OR IGNORE INTO task_executions
                    (id, scheduled_task_id, agent_name, task_name, status, function_ref,
                     args, kwargs, result, error, started_at, completed_at, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                rusqlite::params![
                    exec.id,
                    exec.scheduled_task_id,
                    exec.agent_name,
                    exec.task_name,
                    exec.status.as_str(),
                    exec.function_ref,
                    args,
                    kwargs,
                    result,
                    exec.error,
                    exec.started_at.map(ts),
                    exec.completed_at.map(ts),
                    ts(exec.created_at),
                    ts(exec.updated_at),
                ],
            )?;
            Ok(count > 0)
        })
        .await?
    }

    /// Remove an execution record that never reached the broker.
    pub async fn delete_execution(&self, id: &str) -> Result<bool> {
        let conn = self.conn.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let count = conn.execute(
                "DELETE FROM task_executions WHERE id = ?1 AND status = 'queued'",
                rusqlite::params![id],
            )?;
            Ok(count > 0)
        })
        .await?
    }

    /// Get an execution record by id.
    pub async fn get_execution(&self, id: &str) -> Result<Option<TaskExecution>> {
        let conn = self.conn.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let result = conn
                .query_row(
                    &format!("SELECT {EXECUTION_COLUMNS} FROM task_executions WHERE id = ?1"),
                    rusqlite::params![id],
                    row_to_execution,
                )
                .optional()?;
            Ok(result)
        })
        .await?
    }

    /// List execution records, newest first.
    pub async fn list_executions(&self, filter: ExecutionFilter) -> Result<Vec<TaskExecution>> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();

            let mut clauses = Vec::new();
            let mut params: Vec<String> = Vec::new();
            if let Some(agent) = filter.agent_name {
                params.push(agent);
                clauses.push(format!("agent_name = ?{}", params.len()));
            }
            if let Some(status) = filter.status {
                params.push(status.as_str().to_string());
                clauses.push(format!("status = ?{}", params.len()));
            }
            if let Some(task_id) = filter.scheduled_task_id {
                params.push(task_id);
                clauses.push(format!("scheduled_task_id = ?{}", params.len()));
            }

            let mut sql = format!("SELECT {EXECUTION_COLUMNS} FROM task_executions");
            if !clauses.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(&clauses.join(" AND "));
            }
            sql.push_str(" ORDER BY created_at DESC, rowid DESC");
            if let Some(limit) = filter.limit {
                sql.push_str(&format!(" LIMIT {limit}"));
            }

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params_from_iter(params), row_to_execution)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await?
    }

    /// Apply a status transition if the record is in a state that permits it.
    ///
    /// Returns true if the row moved, false if it was missing or the
    /// transition would go backward (e.g. finishing an already-cancelled run).
    pub async fn transition_execution(&self, id: &str, transition: Transition) -> Result<bool> {
        let conn = self.conn.clone();
        let id = id.to_string();
        let now = ts(Utc::now());
        let guard = status_guard(transition.target());
        let result = match &transition {
            Transition::Succeed(v) => Some(serde_json::to_string(v)?),
            _ => None,
        };
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let count = match transition {
                Transition::Start => conn.execute(
                    &format!(
                        "UPDATE task_executions
                         SET status = 'running', started_at = ?2, updated_at = ?2
                         WHERE id = ?1 AND {guard}"
                    ),
                    rusqlite::params![id, now],
                )?,
                Transition::Succeed(_) => conn.execute(
                    &format!(
                        "UPDATE task_executions
                         SET status = 'success', result = ?2, completed_at = ?3, updated_at = ?3
                         WHERE id = ?1 AND {guard}"
                    ),
                    rusqlite::params![id, result, now],
                )?,
                Transition::Fail(error) => conn.execute(
                    &format!(
                        "UPDATE task_executions
                         SET status = 'failed', error = ?2, completed_at = ?3, updated_at = ?3
                         WHERE id = ?1 AND {guard}"
                    ),
                    rusqlite::params![id, error, now],
                )?,
                Transition::Cancel => conn.execute(
                    &format!(
                        "UPDATE task_executions
                         SET status = 'cancelled', completed_at = ?2, updated_at = ?2
                         WHERE id = ?1 AND {guard}"
                    ),
                    rusqlite::params![id, now],
                )?,
            };
            Ok(count > 0)
        })
        .await?
    }
}

/// `status IN (...)` clause admitting every status that may move to `target`.
fn status_guard(target: TaskStatus) -> String {
    let sources: Vec<String> = TaskStatus::sources_of(target)
        .map(|status| format!("'{}'", status.as_str()))
        .collect();
    format!("status IN ({})", sources.join(", "))
}

// ─── Row mapping ────────────────────────────────────────

/// Fixed-width timestamps so `ORDER BY` on the text column is chronological.
fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_time(raw: String, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    raw.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn opt_time(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .map(|s| parse_time(s, idx))
        .transpose()
}

fn json_column<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn enum_column<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<ScheduledTask> {
    Ok(ScheduledTask {
        id: row.get(0)?,
        agent_name: row.get(1)?,
        task_name: row.get(2)?,
        description: row.get(3)?,
        enabled: row.get::<_, i32>(4)? != 0,
        schedule: row.get(5)?,
        task_type: enum_column::<TaskType>(row, 6)?,
        function_ref: row.get(7)?,
        args: json_column(row, 8)?,
        kwargs: json_column(row, 9)?,
        created_at: parse_time(row.get(10)?, 10)?,
        updated_at: parse_time(row.get(11)?, 11)?,
    })
}

fn row_to_execution(row: &Row<'_>) -> rusqlite::Result<TaskExecution> {
    let result = match row.get::<_, Option<String>>(8)? {
        Some(raw) => Some(serde_json::from_str(&raw).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(8, rusqlite::types::Type::Text, Box::new(e))
        })?),
        None => None,
    };
    Ok(TaskExecution {
        id: row.get(0)?,
        scheduled_task_id: row.get(1)?,
        agent_name: row.get(2)?,
        task_name: row.get(3)?,
        status: enum_column::<TaskStatus>(row, 4)?,
        function_ref: row.get(5)?,
        args: json_column(row, 6)?,
        kwargs: json_column(row, 7)?,
        result,
        error: row.get(9)?,
        started_at: opt_time(row, 10)?,
        completed_at: opt_time(row, 11)?,
        created_at: parse_time(row.get(12)?, 12)?,
        updated_at: parse_time(row.get(13)?, 13)?,
    })
}
