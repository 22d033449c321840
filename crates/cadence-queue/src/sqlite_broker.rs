//! SQLite-backed broker — durable, shareable between processes.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::broker::{Broker, BrokerError, UnitState, WorkUnit};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS broker_units (
        execution_id TEXT PRIMARY KEY,
        payload TEXT NOT NULL,
        state TEXT NOT NULL DEFAULT 'pending',
        enqueued_at INTEGER NOT NULL,
        claimed_at INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_broker_units_pending ON broker_units(state, enqueued_at);
";

const DEFAULT_POLL: Duration = Duration::from_millis(200);

/// Queue table in SQLite. A claim is a single conditional `UPDATE … RETURNING`,
/// so two workers (even in different processes) can never claim the same unit.
pub struct SqliteBroker {
    conn: Arc<Mutex<Connection>>,
    poll: Duration,
}

impl SqliteBroker {
    /// Open (or create) the broker table in the database at `path`.
    pub fn open(path: &Path) -> Result<Self, BrokerError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        conn.execute_batch(SCHEMA)?;
        tracing::info!("Broker opened: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            poll: DEFAULT_POLL,
        })
    }

    /// Open an in-memory broker (for testing).
    pub fn open_in_memory() -> Result<Self, BrokerError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            poll: DEFAULT_POLL,
        })
    }

    /// How often an idle `claim` re-checks the table.
    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    async fn try_claim(&self) -> Result<Option<WorkUnit>, BrokerError> {
        let conn = self.conn.clone();
        let now = chrono::Utc::now().timestamp_millis();
        let payload: Option<String> = tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.query_row(
                "UPDATE broker_units SET state = 'claimed', claimed_at = ?1
                 WHERE execution_id = (
                     SELECT execution_id FROM broker_units
                     WHERE state = 'pending'
                     ORDER BY enqueued_at, rowid
                     LIMIT 1
                 ) AND state = 'pending'
                 RETURNING payload",
                rusqlite::params![now],
                |row| row.get(0),
            )
            .optional()
        })
        .await??;

        match payload {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

#[async_trait::async_trait]
impl Broker for SqliteBroker {
    async fn push(&self, unit: WorkUnit) -> Result<(), BrokerError> {
        let conn = self.conn.clone();
        let payload = serde_json::to_string(&unit)?;
        let now = chrono::Utc::now().timestamp_millis();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT INTO broker_units (execution_id, payload, state, enqueued_at)
                 VALUES (?1, ?2, 'pending', ?3)",
                rusqlite::params![unit.execution_id, payload, now],
            )?;
            Ok(())
        })
        .await?
    }

    async fn claim(&self, wait: Duration) -> Result<Option<WorkUnit>, BrokerError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(unit) = self.try_claim().await? {
                return Ok(Some(unit));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll.min(deadline - now)).await;
        }
    }

    async fn remove(&self, execution_id: &str) -> Result<bool, BrokerError> {
        let conn = self.conn.clone();
        let id = execution_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let count = conn.execute(
                "DELETE FROM broker_units WHERE execution_id = ?1 AND state = 'pending'",
                rusqlite::params![id],
            )?;
            Ok(count > 0)
        })
        .await?
    }

    async fn ack(&self, execution_id: &str) -> Result<(), BrokerError> {
        let conn = self.conn.clone();
        let id = execution_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "DELETE FROM broker_units WHERE execution_id = ?1",
                rusqlite::params![id],
            )?;
            Ok(())
        })
        .await?
    }

    async fn state(&self, execution_id: &str) -> Result<Option<UnitState>, BrokerError> {
        let conn = self.conn.clone();
        let id = execution_id.to_string();
        let state: Option<String> = tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.query_row(
                "SELECT state FROM broker_units WHERE execution_id = ?1",
                rusqlite::params![id],
                |row| row.get(0),
            )
            .optional()
        })
        .await??;

        Ok(state.map(|s| match s.as_str() {
            "claimed" => UnitState::Claimed,
            _ => UnitState::Pending,
        }))
    }
}
