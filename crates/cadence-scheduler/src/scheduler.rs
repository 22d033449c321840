//! Task scheduler — owns task definitions and their dispatch loops.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use cadence_queue::{EnqueueRequest, FunctionRegistry, JobQueue, QueueError};
use cadence_storage::CadenceStorage;
use cadence_types::ScheduledTask;

use crate::schedule::Schedule;
use crate::{Result, SchedulerError};

/// Execution id of one fire: the same task and fire time always map to the
/// same id, so a second dispatcher sharing the store cannot enqueue it twice.
pub fn execution_id_for(task_id: &str, fire_at: DateTime<Utc>) -> String {
    let name = format!("{task_id}:{}", fire_at.timestamp_millis());
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

/// Running dispatch loop of one task.
struct DispatchHandle {
    token: CancellationToken,
    /// Held while a fire is being enqueued.
    gate: Arc<Mutex<()>>,
    join: JoinHandle<()>,
}

/// Registers scheduled tasks and turns their fire times into enqueues.
///
/// Each enabled task gets its own dispatch loop; re-registering a task
/// replaces its loop, and unregistering it guarantees no further enqueue
/// once the call returns.
pub struct TaskScheduler {
    store: Arc<CadenceStorage>,
    queue: Arc<JobQueue>,
    registry: Option<Arc<FunctionRegistry>>,
    jobs: Mutex<HashMap<String, DispatchHandle>>,
}

impl TaskScheduler {
    pub fn new(store: Arc<CadenceStorage>, queue: Arc<JobQueue>) -> Self {
        Self {
            store,
            queue,
            registry: None,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Reject tasks whose `function_ref` is not in `registry` at registration.
    pub fn with_registry(mut self, registry: Arc<FunctionRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Validate, persist, and (if enabled) start dispatching a task.
    ///
    /// Returns false, with the reason logged, for an invalid schedule, an
    /// unknown function, or a store/broker fault.
    pub async fn register(&self, task: ScheduledTask) -> bool {
        let task_id = task.id.clone();
        match self.try_register(task).await {
            Ok(()) => true,
            Err(e) => {
                warn!(task_id = %task_id, "Task registration failed: {e}");
                false
            }
        }
    }

    async fn try_register(&self, mut task: ScheduledTask) -> Result<()> {
        let schedule = Schedule::parse(&task.schedule, task.task_type)?;
        if let Some(registry) = &self.registry {
            if !registry.contains(&task.function_ref) {
                return Err(SchedulerError::UnknownFunction(task.function_ref));
            }
        }

        let mut jobs = self.jobs.lock().await;
        stop_dispatch(&mut jobs, &task.id).await;

        task.updated_at = Utc::now();
        self.store.upsert_task(&task).await?;

        if !task.enabled {
            info!(task_id = %task.id, "Task registered (disabled)");
            return Ok(());
        }

        let first_fire = match &schedule {
            Schedule::Interval(_) => {
                let now = Utc::now();
                fire(&self.queue, &task, now).await?;
                schedule.next_fire(now)
            }
            Schedule::Cron(_) => schedule.next_fire(Utc::now()),
        };
        let Some(first_fire) = first_fire else {
            warn!(task_id = %task.id, "Schedule has no upcoming fire time");
            return Ok(());
        };

        info!(
            task_id = %task.id,
            schedule = %task.schedule,
            task_type = %task.task_type,
            next_fire = %first_fire,
            "Task registered"
        );

        let token = CancellationToken::new();
        let gate = Arc::new(Mutex::new(()));
        let join = tokio::spawn(dispatch_loop(
            self.store.clone(),
            self.queue.clone(),
            task.clone(),
            schedule,
            first_fire,
            token.clone(),
            gate.clone(),
        ));
        jobs.insert(task.id, DispatchHandle { token, gate, join });
        Ok(())
    }

    /// Disable a task and stop its dispatch. Unregistering an already
    /// disabled task succeeds; an unknown id returns false.
    pub async fn unregister(&self, task_id: &str) -> bool {
        let mut jobs = self.jobs.lock().await;
        stop_dispatch(&mut jobs, task_id).await;

        match self.store.set_task_enabled(task_id, false).await {
            Ok(true) => {
                info!(task_id = %task_id, "Task unregistered");
                true
            }
            Ok(false) => {
                warn!(task_id = %task_id, "Cannot unregister unknown task");
                false
            }
            Err(e) => {
                error!(task_id = %task_id, "Failed to disable task: {e}");
                false
            }
        }
    }

    pub async fn list(&self, agent_name: Option<&str>) -> Result<Vec<ScheduledTask>> {
        Ok(self.store.list_tasks(agent_name).await?)
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<ScheduledTask>> {
        Ok(self.store.get_task(task_id).await?)
    }

    /// Register every definition; returns how many were accepted.
    ///
    /// A task already stored as disabled stays disabled, so a definition
    /// switched off with `unregister` (or `cadence tasks disable`) is not
    /// revived by the next load.
    pub async fn load_tasks(&self, tasks: Vec<ScheduledTask>) -> usize {
        let total = tasks.len();
        let mut accepted = 0;
        for mut task in tasks {
            match self.store.get_task(&task.id).await {
                Ok(Some(stored)) if !stored.enabled && task.enabled => {
                    info!(task_id = %task.id, "Task disabled in storage, keeping it disabled");
                    task.enabled = false;
                }
                Ok(_) => {}
                Err(e) => warn!(task_id = %task.id, "Could not read stored task: {e}"),
            }
            if self.register(task).await {
                accepted += 1;
            }
        }
        info!("Loaded {accepted}/{total} scheduled tasks");
        accepted
    }

    /// Resume dispatch for enabled persisted tasks without a live dispatch
    /// loop: tasks from an earlier run, or ones re-enabled by another process.
    /// Each resumed task's next fire is derived from now.
    pub async fn restore(&self) -> Result<usize> {
        let mut restored = 0;
        for task in self.store.list_tasks(None).await? {
            if !task.enabled || self.is_dispatching(&task.id).await {
                continue;
            }
            if self.register(task).await {
                restored += 1;
            }
        }
        if restored > 0 {
            info!("Restored {restored} scheduled tasks from storage");
        }
        Ok(restored)
    }

    /// Whether a dispatch loop is active for `task_id`.
    ///
    /// A loop that stopped because its task was disabled elsewhere no longer counts.
    pub async fn is_dispatching(&self, task_id: &str) -> bool {
        self.jobs
            .lock()
            .await
            .get(task_id)
            .is_some_and(|handle| !handle.join.is_finished())
    }

    /// Stop every dispatch loop. Task definitions are left as they are.
    pub async fn shutdown(&self) {
        let handles: Vec<DispatchHandle> = {
            let mut jobs = self.jobs.lock().await;
            jobs.drain().map(|(_, handle)| handle).collect()
        };
        let count = handles.len();
        for handle in &handles {
            handle.token.cancel();
        }
        for handle in handles {
            if let Err(e) = handle.join.await {
                warn!("Dispatch loop ended abnormally: {e}");
            }
        }
        info!("Scheduler stopped ({count} dispatch loops)");
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        for handle in self.jobs.get_mut().values() {
            handle.token.cancel();
        }
    }
}

/// Cancel a task's dispatch loop and wait out any fire in progress.
async fn stop_dispatch(jobs: &mut HashMap<String, DispatchHandle>, task_id: &str) {
    if let Some(handle) = jobs.remove(task_id) {
        handle.token.cancel();
        let _fire_done = handle.gate.lock().await;
        debug!(task_id = %task_id, "Dispatch stopped");
    }
}

/// Enqueue one fire. `Ok(None)` means this fire was already dispatched.
pub(crate) async fn fire(
    queue: &JobQueue,
    task: &ScheduledTask,
    fire_at: DateTime<Utc>,
) -> std::result::Result<Option<String>, QueueError> {
    let id = execution_id_for(&task.id, fire_at);
    match queue
        .enqueue_with_id(id, EnqueueRequest::from_scheduled(task))
        .await
    {
        Ok(id) => {
            info!(task_id = %task.id, execution_id = %id, "Task fired");
            Ok(Some(id))
        }
        Err(QueueError::DuplicateExecution(id)) => {
            debug!(task_id = %task.id, execution_id = %id, "Fire already dispatched");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Whether the persisted definition still wants dispatch. Another process
/// may have disabled or removed it.
async fn still_enabled(store: &CadenceStorage, task_id: &str) -> bool {
    match store.get_task(task_id).await {
        Ok(Some(task)) => task.enabled,
        Ok(None) => false,
        Err(e) => {
            warn!(task_id = %task_id, "Could not re-check task before firing: {e}");
            true
        }
    }
}

async fn dispatch_loop(
    store: Arc<CadenceStorage>,
    queue: Arc<JobQueue>,
    task: ScheduledTask,
    schedule: Schedule,
    mut next: DateTime<Utc>,
    token: CancellationToken,
    gate: Arc<Mutex<()>>,
) {
    loop {
        let delay = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        {
            let _firing = gate.lock().await;
            if token.is_cancelled() {
                break;
            }
            if !still_enabled(&store, &task.id).await {
                info!(task_id = %task.id, "Task disabled elsewhere, stopping dispatch");
                break;
            }
            if let Err(e) = fire(&queue, &task, next).await {
                error!(task_id = %task.id, fire_at = %next, "Dispatch failed: {e}");
            }
        }

        let now = Utc::now();
        next = match schedule.next_fire(next) {
            Some(t) if t > now => t,
            _ => match schedule.resume_from(now) {
                Some(t) => {
                    debug!(task_id = %task.id, "Missed fire time, resuming from now");
                    t
                }
                None => break,
            },
        };
    }
    debug!(task_id = %task.id, "Dispatch loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_queue::{Broker, BrokerError, MemoryBroker, UnitState, WorkUnit, task_fn};
    use cadence_storage::ExecutionFilter;
    use cadence_types::{TaskExecution, TaskStatus, TaskType};

    fn setup() -> (TaskScheduler, Arc<JobQueue>) {
        let store = Arc::new(CadenceStorage::open_in_memory().unwrap());
        let queue = Arc::new(JobQueue::new(store.clone(), Arc::new(MemoryBroker::new())));
        (TaskScheduler::new(store, queue.clone()), queue)
    }

    fn interval_task(schedule: &str) -> ScheduledTask {
        ScheduledTask::new("billing", "renew", schedule, TaskType::Interval, "billing:renew")
    }

    fn cron_task(schedule: &str) -> ScheduledTask {
        ScheduledTask::new("aiops-bot", "health", schedule, TaskType::Cron, "aiops:health")
    }

    async fn executions_for(queue: &JobQueue, task_id: &str) -> Vec<TaskExecution> {
        queue
            .list_executions(ExecutionFilter {
                scheduled_task_id: Some(task_id.into()),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_register_cron_persists_as_given() {
        let (scheduler, queue) = setup();
        assert!(scheduler.register(cron_task("*/5 * * * *")).await);

        let task = scheduler.get("aiops-bot:health").await.unwrap().unwrap();
        assert!(task.enabled);
        assert_eq!(task.schedule, "*/5 * * * *");
        assert!(scheduler.is_dispatching("aiops-bot:health").await);
        // Cron tasks wait for their first tick
        assert!(executions_for(&queue, "aiops-bot:health").await.is_empty());

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_schedules_rejected() {
        let (scheduler, queue) = setup();
        assert!(!scheduler.register(cron_task("every five minutes")).await);
        assert!(!scheduler.register(interval_task("5 fortnights")).await);

        assert!(scheduler.get("aiops-bot:health").await.unwrap().is_none());
        assert!(scheduler.get("billing:renew").await.unwrap().is_none());
        assert!(executions_for(&queue, "billing:renew").await.is_empty());
        assert!(!scheduler.is_dispatching("billing:renew").await);
    }

    #[tokio::test]
    async fn test_invalid_reregistration_keeps_existing() {
        let (scheduler, _queue) = setup();
        assert!(scheduler.register(cron_task("0 * * * *")).await);
        assert!(!scheduler.register(cron_task("0 * * *")).await);

        let task = scheduler.get("aiops-bot:health").await.unwrap().unwrap();
        assert_eq!(task.schedule, "0 * * * *");
        assert!(scheduler.is_dispatching("aiops-bot:health").await);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_function_rejected_with_registry() {
        let store = Arc::new(CadenceStorage::open_in_memory().unwrap());
        let queue = Arc::new(JobQueue::new(store.clone(), Arc::new(MemoryBroker::new())));
        let registry = FunctionRegistry::new().with(
            "aiops:health",
            task_fn(|_| async { Ok(serde_json::Value::Null) }),
        );
        let scheduler = TaskScheduler::new(store, queue).with_registry(Arc::new(registry));

        assert!(scheduler.register(cron_task("0 * * * *")).await);
        assert!(!scheduler.register(interval_task("5 minutes")).await);
        assert!(scheduler.get("billing:renew").await.unwrap().is_none());
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_interval_fires_immediately_then_periodically() {
        let (scheduler, queue) = setup();
        assert!(scheduler.register(interval_task("1 second")).await);

        let first = executions_for(&queue, "billing:renew").await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].status, TaskStatus::Queued);
        assert_eq!(first[0].function_ref, "billing:renew");

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(executions_for(&queue, "billing:renew").await.len(), 2);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_unregister_stops_dispatch() {
        let (scheduler, queue) = setup();
        assert!(scheduler.register(interval_task("1 second")).await);
        assert!(scheduler.unregister("billing:renew").await);

        tokio::time::sleep(Duration::from_millis(1_300)).await;
        assert_eq!(executions_for(&queue, "billing:renew").await.len(), 1);

        let task = scheduler.get("billing:renew").await.unwrap().unwrap();
        assert!(!task.enabled);
        assert!(!scheduler.is_dispatching("billing:renew").await);

        // Idempotent
        assert!(scheduler.unregister("billing:renew").await);
        assert!(!scheduler.unregister("nobody:nothing").await);
    }

    #[tokio::test]
    async fn test_disabled_in_store_stops_dispatch() {
        let store = Arc::new(CadenceStorage::open_in_memory().unwrap());
        let queue = Arc::new(JobQueue::new(store.clone(), Arc::new(MemoryBroker::new())));
        let scheduler = TaskScheduler::new(store.clone(), queue.clone());
        assert!(scheduler.register(interval_task("1 second")).await);

        // As done by `cadence tasks disable` from another process
        store.set_task_enabled("billing:renew", false).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1_300)).await;
        assert_eq!(executions_for(&queue, "billing:renew").await.len(), 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_reenabled_in_store_resumes_on_restore() {
        let store = Arc::new(CadenceStorage::open_in_memory().unwrap());
        let queue = Arc::new(JobQueue::new(store.clone(), Arc::new(MemoryBroker::new())));
        let scheduler = TaskScheduler::new(store.clone(), queue.clone());
        assert!(scheduler.register(interval_task("1 second")).await);

        store.set_task_enabled("billing:renew", false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1_300)).await;
        assert!(!scheduler.is_dispatching("billing:renew").await);
        assert_eq!(scheduler.restore().await.unwrap(), 0);

        // As done by `cadence tasks enable` from another process
        store.set_task_enabled("billing:renew", true).await.unwrap();
        assert_eq!(scheduler.restore().await.unwrap(), 1);
        assert!(scheduler.is_dispatching("billing:renew").await);
        // Interval tasks resume with an immediate fire
        assert_eq!(executions_for(&queue, "billing:renew").await.len(), 2);
        assert_eq!(scheduler.restore().await.unwrap(), 0);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_load_tasks_keeps_stored_disable() {
        let (scheduler, queue) = setup();
        assert!(scheduler.register(interval_task("1 second")).await);
        assert!(scheduler.unregister("billing:renew").await);

        assert_eq!(scheduler.load_tasks(vec![interval_task("1 second")]).await, 1);
        assert!(!scheduler.get("billing:renew").await.unwrap().unwrap().enabled);
        assert!(!scheduler.is_dispatching("billing:renew").await);
        assert_eq!(executions_for(&queue, "billing:renew").await.len(), 1);

        // Definitions loaded as disabled stay that way too
        assert_eq!(
            scheduler
                .load_tasks(vec![cron_task("0 * * * *").with_enabled(false)])
                .await,
            1
        );
        assert!(!scheduler.is_dispatching("aiops-bot:health").await);
    }

    #[tokio::test]
    async fn test_reregister_replaces_dispatch() {
        let (scheduler, queue) = setup();
        assert!(scheduler.register(interval_task("1 second")).await);

        let mut replacement = interval_task("0 0 1 1 *");
        replacement.task_type = TaskType::Cron;
        assert!(scheduler.register(replacement).await);

        tokio::time::sleep(Duration::from_millis(1_300)).await;
        assert_eq!(executions_for(&queue, "billing:renew").await.len(), 1);
        let task = scheduler.get("billing:renew").await.unwrap().unwrap();
        assert_eq!(task.task_type, TaskType::Cron);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_disabled_task_is_stored_not_dispatched() {
        let (scheduler, queue) = setup();
        assert!(scheduler.register(interval_task("1 second").with_enabled(false)).await);

        assert!(!scheduler.get("billing:renew").await.unwrap().unwrap().enabled);
        assert!(!scheduler.is_dispatching("billing:renew").await);
        assert!(executions_for(&queue, "billing:renew").await.is_empty());
    }

    struct DownBroker;

    #[async_trait::async_trait]
    impl Broker for DownBroker {
        async fn push(&self, _unit: WorkUnit) -> std::result::Result<(), BrokerError> {
            Err(BrokerError::Unavailable("connection refused".into()))
        }
        async fn claim(&self, _wait: Duration) -> std::result::Result<Option<WorkUnit>, BrokerError> {
            Ok(None)
        }
        async fn remove(&self, _id: &str) -> std::result::Result<bool, BrokerError> {
            Ok(false)
        }
        async fn ack(&self, _id: &str) -> std::result::Result<(), BrokerError> {
            Ok(())
        }
        async fn state(&self, _id: &str) -> std::result::Result<Option<UnitState>, BrokerError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_broker_down_fails_interval_registration() {
        let store = Arc::new(CadenceStorage::open_in_memory().unwrap());
        let queue = Arc::new(JobQueue::new(store.clone(), Arc::new(DownBroker)));
        let scheduler = TaskScheduler::new(store, queue.clone());

        assert!(!scheduler.register(interval_task("5 minutes")).await);
        assert!(!scheduler.is_dispatching("billing:renew").await);
        assert!(executions_for(&queue, "billing:renew").await.is_empty());
    }

    #[tokio::test]
    async fn test_same_fire_dispatched_once() {
        let (_scheduler, queue) = setup();
        let task = interval_task("5 minutes");
        let at = Utc::now();

        assert!(fire(&queue, &task, at).await.unwrap().is_some());
        assert!(fire(&queue, &task, at).await.unwrap().is_none());
        assert_eq!(executions_for(&queue, "billing:renew").await.len(), 1);
    }

    #[test]
    fn test_execution_id_is_deterministic() {
        let at = Utc::now();
        assert_eq!(execution_id_for("a:b", at), execution_id_for("a:b", at));
        assert_ne!(execution_id_for("a:b", at), execution_id_for("a:c", at));
        assert_ne!(
            execution_id_for("a:b", at),
            execution_id_for("a:b", at + chrono::Duration::seconds(1))
        );
    }

    #[tokio::test]
    async fn test_load_tasks_counts_accepted() {
        let (scheduler, _queue) = setup();
        let accepted = scheduler
            .load_tasks(vec![
                cron_task("0 9 * * 1-5"),
                ScheduledTask::new("email-agent", "broken", "whenever", TaskType::Cron, "x"),
                ScheduledTask::new("email-agent", "digest", "0 18 * * *", TaskType::Cron, "email:digest"),
            ])
            .await;
        assert_eq!(accepted, 2);
        assert_eq!(scheduler.list(Some("email-agent")).await.unwrap().len(), 1);
        assert_eq!(scheduler.list(None).await.unwrap().len(), 2);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_restore_resumes_enabled_tasks() {
        let store = Arc::new(CadenceStorage::open_in_memory().unwrap());
        store.upsert_task(&cron_task("0 * * * *")).await.unwrap();
        store
            .upsert_task(&cron_task("0 * * * *").with_enabled(false).with_description("off"))
            .await
            .unwrap();
        store
            .upsert_task(&ScheduledTask::new("email-agent", "digest", "0 18 * * *", TaskType::Cron, "email:digest"))
            .await
            .unwrap();
        let queue = Arc::new(JobQueue::new(store.clone(), Arc::new(MemoryBroker::new())));
        let scheduler = TaskScheduler::new(store, queue);

        // aiops-bot:health was overwritten as disabled
        assert_eq!(scheduler.restore().await.unwrap(), 1);
        assert!(scheduler.is_dispatching("email-agent:digest").await);
        assert!(!scheduler.is_dispatching("aiops-bot:health").await);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let (scheduler, queue) = setup();
        assert!(scheduler.register(interval_task("1 second")).await);
        scheduler.shutdown().await;

        assert!(!scheduler.is_dispatching("billing:renew").await);
        tokio::time::sleep(Duration::from_millis(1_300)).await;
        assert_eq!(executions_for(&queue, "billing:renew").await.len(), 1);
        // Shutdown leaves the definition enabled for the next run
        assert!(scheduler.get("billing:renew").await.unwrap().unwrap().enabled);
    }
}
