//! Broker abstraction — the queue that hands units of work to workers.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;

use cadence_types::{TaskArgs, TaskKwargs};

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Blocking task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("unit payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

/// One unit of work as carried by the broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkUnit {
    pub execution_id: String,
    pub function_ref: String,
    #[serde(default)]
    pub args: TaskArgs,
    #[serde(default)]
    pub kwargs: TaskKwargs,
}

/// Where a unit currently sits in the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    /// Waiting to be claimed.
    Pending,
    /// Claimed by a worker and not yet acknowledged.
    Claimed,
}

/// A work queue with destructive, exclusive claims.
///
/// Implementations must guarantee that a unit is handed to at most one
/// claimant. Ordering between units is unspecified.
#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    /// Place a unit on the queue.
    async fn push(&self, unit: WorkUnit) -> Result<(), BrokerError>;

    /// Claim the next pending unit, waiting up to `wait` for one to appear.
    async fn claim(&self, wait: Duration) -> Result<Option<WorkUnit>, BrokerError>;

    /// Drop a unit that has not been claimed yet. Returns false if it was
    /// already claimed or is unknown.
    async fn remove(&self, execution_id: &str) -> Result<bool, BrokerError>;

    /// Forget a claimed unit once its outcome has been recorded.
    async fn ack(&self, execution_id: &str) -> Result<(), BrokerError>;

    /// Current state of a unit, `None` if the broker does not know it.
    async fn state(&self, execution_id: &str) -> Result<Option<UnitState>, BrokerError>;
}

#[derive(Default)]
struct MemoryQueue {
    pending: VecDeque<WorkUnit>,
    claimed: HashSet<String>,
}

/// In-process broker. Units do not survive a restart.
#[derive(Default)]
pub struct MemoryBroker {
    inner: Mutex<MemoryQueue>,
    notify: Notify,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryQueue> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_claim(&self) -> Option<WorkUnit> {
        let mut queue = self.lock();
        let unit = queue.pending.pop_front()?;
        queue.claimed.insert(unit.execution_id.clone());
        Some(unit)
    }
}

#[async_trait::async_trait]
impl Broker for MemoryBroker {
    async fn push(&self, unit: WorkUnit) -> Result<(), BrokerError> {
        self.lock().pending.push_back(unit);
        self.notify.notify_one();
        Ok(())
    }

    async fn claim(&self, wait: Duration) -> Result<Option<WorkUnit>, BrokerError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(unit) = self.try_claim() {
                return Ok(Some(unit));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout_at(deadline, self.notify.notified()).await;
        }
    }

    async fn remove(&self, execution_id: &str) -> Result<bool, BrokerError> {
        let mut queue = self.lock();
        match queue
            .pending
            .iter()
            .position(|u| u.execution_id == execution_id)
        {
            Some(pos) => {
                queue.pending.remove(pos);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn ack(&self, execution_id: &str) -> Result<(), BrokerError> {
        self.lock().claimed.remove(execution_id);
        Ok(())
    }

    async fn state(&self, execution_id: &str) -> Result<Option<UnitState>, BrokerError> {
        let queue = self.lock();
        if queue.claimed.contains(execution_id) {
            Ok(Some(UnitState::Claimed))
        } else if queue.pending.iter().any(|u| u.execution_id == execution_id) {
            Ok(Some(UnitState::Pending))
        } else {
            Ok(None)
        }
    }
}
