//! cadence-scheduler: turns task schedules into queue dispatches.

pub mod schedule;
pub mod scheduler;

pub use schedule::{CronSchedule, Schedule, ScheduleError, parse_cron, parse_interval};
pub use scheduler::{TaskScheduler, execution_id_for};

use cadence_queue::QueueError;
use cadence_storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error("unknown function: {0}")]
    UnknownFunction(String),
    #[error("dispatch failed: {0}")]
    Queue(#[from] QueueError),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
