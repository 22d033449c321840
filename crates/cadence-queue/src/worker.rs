//! Worker pool — claims units, runs them, records the outcome.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cadence_storage::Transition;
use cadence_types::TaskStatus;

use crate::broker::WorkUnit;
use crate::queue::JobQueue;
use crate::registry::{FunctionRegistry, TaskContext};
use crate::Result;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent workers.
    pub concurrency: usize,
    /// How long one claim waits for work before re-checking shutdown.
    pub poll_interval: Duration,
    /// Delay before a worker that hit a store or broker fault is replaced.
    pub restart_delay: Duration,
    /// How often a running unit's record is re-read for a cancellation made
    /// through another queue handle.
    pub cancel_check: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_millis(500),
            restart_delay: Duration::from_secs(1),
            cancel_check: Duration::from_secs(1),
        }
    }
}

/// A supervised set of workers sharing one queue and one registry.
pub struct WorkerPool {
    queue: Arc<JobQueue>,
    registry: Arc<FunctionRegistry>,
    config: WorkerConfig,
}

impl WorkerPool {
    pub fn new(queue: Arc<JobQueue>, registry: Arc<FunctionRegistry>, config: WorkerConfig) -> Self {
        Self {
            queue,
            registry,
            config,
        }
    }

    /// Run until `shutdown` fires, then wait for in-progress units to finish.
    ///
    /// A worker that stops on a store or broker fault is replaced after
    /// `restart_delay`; one failing worker never takes the pool down.
    pub async fn run(self, shutdown: CancellationToken) {
        let concurrency = self.config.concurrency.max(1);
        info!(concurrency, "Worker pool started");

        let mut workers = JoinSet::new();
        let mut next_id = 0usize;
        for _ in 0..concurrency {
            self.spawn_worker(&mut workers, next_id, &shutdown, Duration::ZERO);
            next_id += 1;
        }

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(joined) = workers.join_next() => {
                    match joined {
                        Ok(Ok(())) => continue,
                        Ok(Err(e)) => error!("Worker stopped: {e}"),
                        Err(e) => error!("Worker crashed: {e}"),
                    }
                    if shutdown.is_cancelled() {
                        break;
                    }
                    warn!(
                        delay_ms = self.config.restart_delay.as_millis() as u64,
                        "Replacing worker"
                    );
                    self.spawn_worker(&mut workers, next_id, &shutdown, self.config.restart_delay);
                    next_id += 1;
                }
            }
        }

        while workers.join_next().await.is_some() {}
        info!("Worker pool stopped");
    }

    fn spawn_worker(
        &self,
        workers: &mut JoinSet<Result<()>>,
        id: usize,
        shutdown: &CancellationToken,
        delay: Duration,
    ) {
        let queue = self.queue.clone();
        let registry = self.registry.clone();
        let poll = self.config.poll_interval;
        let cancel_check = self.config.cancel_check;
        let shutdown = shutdown.clone();
        workers.spawn(async move {
            if !delay.is_zero() {
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            worker_loop(id, queue, registry, poll, cancel_check, shutdown).await
        });
    }
}

async fn worker_loop(
    worker: usize,
    queue: Arc<JobQueue>,
    registry: Arc<FunctionRegistry>,
    poll: Duration,
    cancel_check: Duration,
    shutdown: CancellationToken,
) -> Result<()> {
    debug!(worker, "Worker started");
    // Shutdown is only checked between claims so a claimed unit is never dropped
    while !shutdown.is_cancelled() {
        let Some(unit) = queue.broker.claim(poll).await? else {
            continue;
        };
        process_unit(worker, &queue, &registry, unit, cancel_check).await?;
    }
    debug!(worker, "Worker stopped");
    Ok(())
}

async fn process_unit(
    worker: usize,
    queue: &JobQueue,
    registry: &FunctionRegistry,
    unit: WorkUnit,
    cancel_check: Duration,
) -> Result<()> {
    let id = unit.execution_id.clone();

    if !queue.store.transition_execution(&id, Transition::Start).await? {
        match queue.store.get_execution(&id).await? {
            // Already advanced by a status query that saw the claim
            Some(record) if record.status == TaskStatus::Running => {}
            Some(record) => {
                debug!(execution_id = %id, status = %record.status, "Skipping unit");
                queue.broker.ack(&id).await?;
                return Ok(());
            }
            None => {
                warn!(execution_id = %id, "Claimed unit has no execution record");
                queue.broker.ack(&id).await?;
                return Ok(());
            }
        }
    }

    debug!(worker, execution_id = %id, function = %unit.function_ref, "Running");
    let cancel = queue.track(&id);
    let outcome = match registry.get(&unit.function_ref) {
        Some(function) => {
            let ctx = TaskContext {
                execution_id: id.clone(),
                args: unit.args,
                kwargs: unit.kwargs,
                cancel: cancel.clone(),
            };
            let mut running = tokio::spawn(function(ctx));
            let joined = loop {
                tokio::select! {
                    joined = &mut running => break joined,
                    _ = tokio::time::sleep(cancel_check), if !cancel.is_cancelled() => {
                        if cancelled_elsewhere(queue, &id).await {
                            info!(execution_id = %id, "Execution cancelled by another process");
                            cancel.cancel();
                        }
                    }
                }
            };
            match joined {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(e.to_string()),
                Err(e) => Err(panic_message(e)),
            }
        }
        None => Err(format!("unknown function: {}", unit.function_ref)),
    };
    queue.untrack(&id);

    let transition = match outcome {
        Ok(value) => Transition::Succeed(value),
        Err(message) => {
            warn!(execution_id = %id, function = %unit.function_ref, "Execution failed: {message}");
            Transition::Fail(message)
        }
    };
    let status = transition.target();
    if queue.store.transition_execution(&id, transition).await? {
        info!(execution_id = %id, status = %status, "Execution finished");
    } else {
        debug!(execution_id = %id, "Outcome discarded, execution was cancelled");
    }

    queue.broker.ack(&id).await?;
    Ok(())
}

async fn cancelled_elsewhere(queue: &JobQueue, id: &str) -> bool {
    match queue.store.get_execution(id).await {
        Ok(Some(record)) => record.status == TaskStatus::Cancelled,
        Ok(None) => false,
        Err(e) => {
            debug!(execution_id = %id, "Could not re-check execution status: {e}");
            false
        }
    }
}

fn panic_message(err: JoinError) -> String {
    if !err.is_panic() {
        return "task aborted".to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
