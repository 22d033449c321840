//! cadence-queue: durable job queue with execution bookkeeping.
//!
//! `JobQueue` writes a `TaskExecution` record for every unit of work and
//! hands the unit to a `Broker`. Workers in a `WorkerPool` claim units,
//! resolve the function through a `FunctionRegistry`, run it, and record
//! the outcome. Claims are exclusive; FIFO order is not guaranteed.

pub mod broker;
pub mod queue;
pub mod registry;
pub mod sqlite_broker;
pub mod worker;

pub use broker::{Broker, BrokerError, MemoryBroker, UnitState, WorkUnit};
pub use queue::{EnqueueRequest, JobQueue};
pub use registry::{FunctionRegistry, TaskContext, TaskFn, task_fn};
pub use sqlite_broker::SqliteBroker;
pub use worker::{WorkerConfig, WorkerPool};

use cadence_storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("execution already exists: {0}")]
    DuplicateExecution(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;
