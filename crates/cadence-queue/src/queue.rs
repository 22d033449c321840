//! Job queue — execution records plus broker hand-off.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use cadence_storage::{CadenceStorage, ExecutionFilter, Transition};
use cadence_types::{ScheduledTask, TaskArgs, TaskExecution, TaskKwargs, TaskStatus};

use crate::broker::{Broker, UnitState, WorkUnit};
use crate::{QueueError, Result};

/// A record younger than this is never treated as lost: its unit may still
/// be on the way to the broker.
const LOST_UNIT_GRACE: Duration = Duration::from_secs(60);

/// Arguments of one enqueue call.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub function_ref: String,
    pub agent_name: String,
    pub task_name: String,
    pub args: TaskArgs,
    pub kwargs: TaskKwargs,
    pub scheduled_task_id: Option<String>,
}

impl EnqueueRequest {
    pub fn new(
        function_ref: impl Into<String>,
        agent_name: impl Into<String>,
        task_name: impl Into<String>,
    ) -> Self {
        Self {
            function_ref: function_ref.into(),
            agent_name: agent_name.into(),
            task_name: task_name.into(),
            args: Vec::new(),
            kwargs: TaskKwargs::new(),
            scheduled_task_id: None,
        }
    }

    /// Request for one fire of a scheduled task.
    pub fn from_scheduled(task: &ScheduledTask) -> Self {
        Self {
            function_ref: task.function_ref.clone(),
            agent_name: task.agent_name.clone(),
            task_name: task.task_name.clone(),
            args: task.args.clone(),
            kwargs: task.kwargs.clone(),
            scheduled_task_id: Some(task.id.clone()),
        }
    }

    pub fn with_args(mut self, args: TaskArgs) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: TaskKwargs) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_scheduled_task(mut self, id: impl Into<String>) -> Self {
        self.scheduled_task_id = Some(id.into());
        self
    }
}

/// Creates execution records, hands units to the broker, and answers
/// status queries by reconciling the two.
pub struct JobQueue {
    pub(crate) store: Arc<CadenceStorage>,
    pub(crate) broker: Arc<dyn Broker>,
    /// Cancellation tokens of executions running in this process.
    inflight: Mutex<HashMap<String, CancellationToken>>,
    lost_unit_grace: Duration,
}

impl JobQueue {
    pub fn new(store: Arc<CadenceStorage>, broker: Arc<dyn Broker>) -> Self {
        Self {
            store,
            broker,
            inflight: Mutex::new(HashMap::new()),
            lost_unit_grace: LOST_UNIT_GRACE,
        }
    }

    /// Override how old a non-terminal record must be before a missing
    /// broker unit counts as lost.
    pub fn with_lost_unit_grace(mut self, grace: Duration) -> Self {
        self.lost_unit_grace = grace;
        self
    }

    pub fn store(&self) -> &Arc<CadenceStorage> {
        &self.store
    }

    /// Enqueue under a fresh random execution id.
    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.enqueue_with_id(id, request).await
    }

    /// Enqueue under a caller-chosen execution id.
    ///
    /// Fails with [`QueueError::DuplicateExecution`] if the id is taken. If the
    /// broker rejects the unit the record is removed again and the broker
    /// error is returned.
    pub async fn enqueue_with_id(
        &self,
        id: impl Into<String>,
        request: EnqueueRequest,
    ) -> Result<String> {
        let id = id.into();
        let execution = TaskExecution::queued(
            id.clone(),
            request.scheduled_task_id,
            request.agent_name,
            request.task_name,
            request.function_ref.clone(),
            request.args.clone(),
            request.kwargs.clone(),
        );

        if !self.store.insert_execution(&execution).await? {
            return Err(QueueError::DuplicateExecution(id));
        }

        let unit = WorkUnit {
            execution_id: id.clone(),
            function_ref: request.function_ref,
            args: request.args,
            kwargs: request.kwargs,
        };
        if let Err(e) = self.broker.push(unit).await {
            error!(execution_id = %id, "Broker rejected unit: {e}");
            if let Err(e) = self.store.delete_execution(&id).await {
                warn!(execution_id = %id, "Failed to remove orphaned execution: {e}");
            }
            return Err(e.into());
        }

        debug!(
            execution_id = %id,
            function = %execution.function_ref,
            agent = %execution.agent_name,
            "Execution queued"
        );
        Ok(id)
    }

    /// Live status of an execution, reconciled against the broker.
    pub async fn get_status(&self, id: &str) -> Result<Option<TaskStatus>> {
        let Some(record) = self.store.get_execution(id).await? else {
            return Ok(None);
        };
        if record.status.is_terminal() {
            return Ok(Some(record.status));
        }

        match self.broker.state(id).await? {
            Some(UnitState::Claimed) if record.status == TaskStatus::Queued => {
                self.store.transition_execution(id, Transition::Start).await?;
            }
            Some(_) => return Ok(Some(record.status)),
            None => {
                let age = (Utc::now() - record.created_at).to_std().unwrap_or_default();
                if age < self.lost_unit_grace {
                    return Ok(Some(record.status));
                }
                if self.store.transition_execution(id, Transition::Cancel).await? {
                    error!(
                        execution_id = %id,
                        status = %record.status,
                        "Broker no longer holds this execution; marked cancelled"
                    );
                }
            }
        }

        Ok(self.store.get_execution(id).await?.map(|e| e.status))
    }

    /// Cancel an execution.
    ///
    /// Queued executions are pulled from the broker. Running executions are
    /// signalled through their [`CancellationToken`](crate::TaskContext::cancel)
    /// when they run in this process; the record is cancelled either way.
    /// Returns false if the execution is unknown or already terminal.
    pub async fn cancel(&self, id: &str) -> Result<bool> {
        let Some(record) = self.store.get_execution(id).await? else {
            return Ok(false);
        };
        if record.status.is_terminal() {
            return Ok(false);
        }

        if record.status == TaskStatus::Queued && !self.broker.remove(id).await? {
            debug!(execution_id = %id, "Unit already claimed, cancelling record");
        }

        let moved = self.store.transition_execution(id, Transition::Cancel).await?;
        if moved {
            if let Some(token) = self.inflight_token(id) {
                token.cancel();
            }
            info!(execution_id = %id, "Execution cancelled");
        }
        Ok(moved)
    }

    /// Stored result of a successful execution.
    pub async fn get_result(&self, id: &str) -> Result<Option<Value>> {
        Ok(self
            .store
            .get_execution(id)
            .await?
            .filter(|e| e.status == TaskStatus::Success)
            .and_then(|e| e.result))
    }

    pub async fn get_execution(&self, id: &str) -> Result<Option<TaskExecution>> {
        Ok(self.store.get_execution(id).await?)
    }

    pub async fn list_executions(&self, filter: ExecutionFilter) -> Result<Vec<TaskExecution>> {
        Ok(self.store.list_executions(filter).await?)
    }

    // ─── In-flight tracking ─────────────────────────────────

    pub(crate) fn track(&self, id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.lock_inflight().insert(id.to_string(), token.clone());
        token
    }

    pub(crate) fn untrack(&self, id: &str) {
        self.lock_inflight().remove(id);
    }

    fn inflight_token(&self, id: &str) -> Option<CancellationToken> {
        self.lock_inflight().get(id).cloned()
    }

    fn lock_inflight(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.inflight.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerError, MemoryBroker};
    use serde_json::json;

    struct RejectingBroker;

    #[async_trait::async_trait]
    impl Broker for RejectingBroker {
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

    fn setup() -> (JobQueue, Arc<MemoryBroker>) {
        let store = Arc::new(CadenceStorage::open_in_memory().unwrap());
        let broker = Arc::new(MemoryBroker::new());
        (JobQueue::new(store, broker.clone()), broker)
    }

    fn request() -> EnqueueRequest {
        EnqueueRequest::new("email:batch", "email-agent", "batch")
            .with_args(vec![json!("inbox")])
            .with_scheduled_task("email-agent:batch")
    }

    #[tokio::test]
    async fn test_enqueue_creates_queued_record_and_unit() {
        let (queue, broker) = setup();
        let id = queue.enqueue(request()).await.unwrap();

        let record = queue.get_execution(&id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Queued);
        assert_eq!(record.scheduled_task_id.as_deref(), Some("email-agent:batch"));
        assert_eq!(record.args, vec![json!("inbox")]);
        assert_eq!(broker.state(&id).await.unwrap(), Some(UnitState::Pending));
        assert_eq!(queue.get_status(&id).await.unwrap(), Some(TaskStatus::Queued));
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let (queue, _broker) = setup();
        queue.enqueue_with_id("fixed", request()).await.unwrap();
        let err = queue.enqueue_with_id("fixed", request()).await.unwrap_err();
        assert!(matches!(err, QueueError::DuplicateExecution(id) if id == "fixed"));
    }

    #[tokio::test]
    async fn test_broker_failure_leaves_no_record() {
        let store = Arc::new(CadenceStorage::open_in_memory().unwrap());
        let queue = JobQueue::new(store.clone(), Arc::new(RejectingBroker));

        let err = queue.enqueue_with_id("doomed", request()).await.unwrap_err();
        assert!(matches!(err, QueueError::Broker(BrokerError::Unavailable(_))));
        assert!(store.get_execution("doomed").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_queued() {
        let (queue, broker) = setup();
        let id = queue.enqueue(request()).await.unwrap();

        assert!(queue.cancel(&id).await.unwrap());
        assert_eq!(queue.get_status(&id).await.unwrap(), Some(TaskStatus::Cancelled));
        assert_eq!(broker.state(&id).await.unwrap(), None);

        // Terminal states are final
        assert!(!queue.cancel(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_cancel_success_is_noop() {
        let (queue, _broker) = setup();
        let id = queue.enqueue(request()).await.unwrap();
        let store = queue.store();
        store.transition_execution(&id, Transition::Start).await.unwrap();
        store
            .transition_execution(&id, Transition::Succeed(json!({"processed": 3})))
            .await
            .unwrap();

        assert!(!queue.cancel(&id).await.unwrap());
        assert_eq!(queue.get_status(&id).await.unwrap(), Some(TaskStatus::Success));
        assert_eq!(queue.get_result(&id).await.unwrap(), Some(json!({"processed": 3})));
    }

    #[tokio::test]
    async fn test_cancel_unknown() {
        let (queue, _broker) = setup();
        assert!(!queue.cancel("missing").await.unwrap());
        assert_eq!(queue.get_status("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cancel_running_fires_token() {
        let (queue, broker) = setup();
        let id = queue.enqueue(request()).await.unwrap();
        broker.claim(Duration::ZERO).await.unwrap();
        queue.store().transition_execution(&id, Transition::Start).await.unwrap();
        let token = queue.track(&id);

        assert!(queue.cancel(&id).await.unwrap());
        assert!(token.is_cancelled());
        assert_eq!(queue.get_status(&id).await.unwrap(), Some(TaskStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_status_reconciles_claimed_unit() {
        let (queue, broker) = setup();
        let id = queue.enqueue(request()).await.unwrap();
        broker.claim(Duration::ZERO).await.unwrap();

        assert_eq!(queue.get_status(&id).await.unwrap(), Some(TaskStatus::Running));
        let record = queue.get_execution(&id).await.unwrap().unwrap();
        assert!(record.started_at.is_some());
    }

    #[tokio::test]
    async fn test_lost_unit_cancelled_after_grace() {
        let store = Arc::new(CadenceStorage::open_in_memory().unwrap());
        let broker = Arc::new(MemoryBroker::new());
        let queue = JobQueue::new(store, broker.clone()).with_lost_unit_grace(Duration::ZERO);

        let id = queue.enqueue(request()).await.unwrap();
        // Simulate a broker restart that lost the unit
        broker.remove(&id).await.unwrap();

        assert_eq!(queue.get_status(&id).await.unwrap(), Some(TaskStatus::Cancelled));
    }

    #[tokio::test]
    async fn test_missing_unit_within_grace_is_left_alone() {
        let (queue, broker) = setup();
        let id = queue.enqueue(request()).await.unwrap();
        broker.remove(&id).await.unwrap();

        assert_eq!(queue.get_status(&id).await.unwrap(), Some(TaskStatus::Queued));
    }

    #[tokio::test]
    async fn test_result_absent_until_success() {
        let (queue, _broker) = setup();
        let id = queue.enqueue(request()).await.unwrap();
        assert_eq!(queue.get_result(&id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_executions_filters_by_agent() {
        let (queue, _broker) = setup();
        queue.enqueue(request()).await.unwrap();
        queue
            .enqueue(EnqueueRequest::new("aiops:health", "aiops-bot", "health"))
            .await
            .unwrap();

        let listed = queue
            .list_executions(ExecutionFilter {
                agent_name: Some("aiops-bot".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].task_name, "health");
    }
}
