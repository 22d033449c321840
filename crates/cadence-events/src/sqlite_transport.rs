//! SQLite-backed transport — agent processes sharing one database file see
//! each other's events.
//!
//! Published messages are appended to `event_log`. A subscription remembers the
//! highest row id present when it started and polls for newer rows on its
//! channel, so nothing published before `subscribe` is ever delivered.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use futures::stream;
use rusqlite::Connection;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::Result;
use crate::transport::{ChannelStream, EventTransport};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS event_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        channel TEXT NOT NULL,
        message TEXT NOT NULL,
        published_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_event_log_channel ON event_log(channel, id);
    CREATE TABLE IF NOT EXISTS event_subscribers (
        id TEXT PRIMARY KEY,
        channel TEXT NOT NULL,
        last_seen INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_event_subscribers_channel ON event_subscribers(channel);
";

const DEFAULT_POLL: Duration = Duration::from_millis(200);

/// Rows older than this are pruned on publish.
const RETENTION: Duration = Duration::from_secs(300);

/// How often a live subscription refreshes its `last_seen`.
const HEARTBEAT: Duration = Duration::from_secs(5);

/// A subscriber not seen for this long no longer counts as a receiver.
const SUBSCRIBER_TTL: Duration = Duration::from_secs(30);

const FETCH_BATCH: i64 = 256;

/// Event log table in SQLite, polled by every subscriber.
pub struct SqliteTransport {
    conn: Arc<Mutex<Connection>>,
    poll: Duration,
}

impl SqliteTransport {
    /// Open (or create) the event tables in the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        conn.execute_batch(SCHEMA)?;
        tracing::info!("Event log opened: {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            poll: DEFAULT_POLL,
        })
    }

    /// Open an in-memory event log (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            poll: DEFAULT_POLL,
        })
    }

    /// How often a subscription checks for new messages.
    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[async_trait::async_trait]
impl EventTransport for SqliteTransport {
    async fn publish(&self, channel: &str, message: String) -> Result<usize> {
        let conn = self.conn.clone();
        let channel = channel.to_string();
        let receivers = tokio::task::spawn_blocking(move || -> Result<i64> {
            let conn = conn.blocking_lock();
            let now = now_millis();
            conn.execute(
                "INSERT INTO event_log (channel, message, published_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![channel, message, now],
            )?;
            conn.execute(
                "DELETE FROM event_log WHERE published_at < ?1",
                rusqlite::params![now - RETENTION.as_millis() as i64],
            )?;
            conn.execute(
                "DELETE FROM event_subscribers WHERE last_seen < ?1",
                rusqlite::params![now - SUBSCRIBER_TTL.as_millis() as i64],
            )?;
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM event_subscribers WHERE channel = ?1",
                rusqlite::params![channel],
                |row| row.get(0),
            )?)
        })
        .await??;
        Ok(receivers.max(0) as usize)
    }

    async fn subscribe(&self, channel: &str) -> Result<ChannelStream> {
        let conn = self.conn.clone();
        let subscriber_id = uuid::Uuid::new_v4().to_string();
        let last_id = {
            let conn = conn.clone();
            let channel = channel.to_string();
            let subscriber_id = subscriber_id.clone();
            tokio::task::spawn_blocking(move || -> Result<i64> {
                let conn = conn.blocking_lock();
                conn.execute(
                    "INSERT INTO event_subscribers (id, channel, last_seen) VALUES (?1, ?2, ?3)",
                    rusqlite::params![subscriber_id, channel, now_millis()],
                )?;
                Ok(conn.query_row(
                    "SELECT COALESCE(MAX(id), 0) FROM event_log",
                    [],
                    |row| row.get(0),
                )?)
            })
            .await??
        };

        let cursor = Cursor {
            subscriber: Subscriber {
                conn,
                id: subscriber_id,
            },
            channel: channel.to_string(),
            last_id,
            poll: self.poll,
            buffered: VecDeque::new(),
            last_heartbeat: Instant::now(),
        };

        let stream = stream::unfold(cursor, |mut cursor| async move {
            loop {
                if let Some(message) = cursor.buffered.pop_front() {
                    return Some((message, cursor));
                }
                tokio::time::sleep(cursor.poll).await;
                if let Err(e) = cursor.fetch().await {
                    warn!(channel = %cursor.channel, "Event poll failed: {e}");
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

/// Registration row of one live subscription, removed when the stream drops.
struct Subscriber {
    conn: Arc<Mutex<Connection>>,
    id: String,
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let conn = self.conn.clone();
        let id = std::mem::take(&mut self.id);
        handle.spawn_blocking(move || {
            let conn = conn.blocking_lock();
            if let Err(e) = conn.execute(
                "DELETE FROM event_subscribers WHERE id = ?1",
                rusqlite::params![id],
            ) {
                debug!("Failed to remove event subscriber {id}: {e}");
            }
        });
    }
}

struct Cursor {
    subscriber: Subscriber,
    channel: String,
    last_id: i64,
    poll: Duration,
    buffered: VecDeque<String>,
    last_heartbeat: Instant,
}

impl Cursor {
    async fn fetch(&mut self) -> Result<()> {
        let conn = self.subscriber.conn.clone();
        let channel = self.channel.clone();
        let after = self.last_id;
        let beat = self.last_heartbeat.elapsed() >= HEARTBEAT;
        let heartbeat = beat.then(|| self.subscriber.id.clone());

        let rows = tokio::task::spawn_blocking(move || -> Result<Vec<(i64, String)>> {
            let conn = conn.blocking_lock();
            if let Some(id) = heartbeat {
                conn.execute(
                    "UPDATE event_subscribers SET last_seen = ?1 WHERE id = ?2",
                    rusqlite::params![now_millis(), id],
                )?;
            }
            let mut stmt = conn.prepare_cached(
                "SELECT id, message FROM event_log
                 WHERE channel = ?1 AND id > ?2
                 ORDER BY id
                 LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(rusqlite::params![channel, after, FETCH_BATCH], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await??;

        if beat {
            self.last_heartbeat = Instant::now();
        }
        for (id, message) in rows {
            self.last_id = id;
            self.buffered.push_back(message);
        }
        Ok(())
    }
}
