//! cadence-events: publish/subscribe channel between agent processes.
//!
//! Events are addressed either to a single agent (`events:<agent>`) or to
//! everyone (`events:broadcast`). Delivery is best-effort and at most once
//! per subscriber; nothing is replayed for late subscribers.

pub mod bus;
pub mod sqlite_transport;
pub mod transport;

pub use bus::{EventBus, EventHandler, event_handler};
pub use sqlite_transport::SqliteTransport;
pub use transport::{EventTransport, LocalTransport};

/// Channel every subscriber joins.
pub const BROADCAST_CHANNEL: &str = "events:broadcast";

/// Private channel of a single agent.
pub fn agent_channel(agent_name: &str) -> String {
    format!("events:{agent_name}")
}

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, EventError>;
