use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use cadence_events::{EventBus, event_handler};
use cadence_queue::{WorkerConfig, WorkerPool};
use cadence_scheduler::TaskScheduler;
use cadence_types::EventMessage;

use crate::builtins;
use crate::services::Services;

/// How often stored tasks are re-checked for ones enabled by another process.
const TASK_RESYNC: Duration = Duration::from_secs(15);

/// Run scheduler, workers, and event listener until Ctrl-C.
pub async fn run_service(services: Services) -> anyhow::Result<()> {
    let Services {
        config,
        base_dir,
        store,
        queue,
        transport,
    } = services;

    let bus = Arc::new(EventBus::new(transport));

    let agents: BTreeSet<String> = config
        .agents
        .keys()
        .cloned()
        .chain(config.task_files.iter().map(|f| f.agent.clone()))
        .collect();
    for agent in &agents {
        let name = agent.clone();
        let handler = event_handler(move |event: EventMessage| {
            let name = name.clone();
            async move {
                info!(
                    agent = %name,
                    event_type = %event.event_type,
                    source = %event.source_agent,
                    "Event received"
                );
            }
        });
        bus.subscribe(agent, None, Some(handler)).await?;
    }

    let registry = Arc::new(builtins::registry(bus.clone()));
    let scheduler =
        Arc::new(TaskScheduler::new(store, queue.clone()).with_registry(registry.clone()));
    scheduler
        .load_tasks(config.scheduled_tasks(&base_dir)?)
        .await;
    scheduler.restore().await?;

    let shutdown = CancellationToken::new();
    let pool = WorkerPool::new(
        queue,
        registry,
        WorkerConfig {
            concurrency: config.workers.concurrency,
            poll_interval: Duration::from_millis(config.workers.poll_interval_ms),
            ..Default::default()
        },
    );
    let workers = tokio::spawn(pool.run(shutdown.clone()));
    let listener = tokio::spawn(bus.clone().run(shutdown.clone()));
    let resync = tokio::spawn(resync_tasks(scheduler.clone(), shutdown.clone()));

    info!(agents = agents.len(), "cadence is running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    shutdown.cancel();
    resync.await?;
    scheduler.shutdown().await;
    workers.await?;
    listener.await?;
    bus.close().await;
    Ok(())
}

/// Pick up tasks enabled (or re-enabled) through `cadence tasks enable`.
async fn resync_tasks(scheduler: Arc<TaskScheduler>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(TASK_RESYNC);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = scheduler.restore().await {
                    warn!("Task resync failed: {e}");
                }
            }
        }
    }
}
