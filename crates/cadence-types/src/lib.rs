use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Positional arguments passed to a task function.
pub type TaskArgs = Vec<Value>;

/// Keyword arguments passed to a task function.
pub type TaskKwargs = serde_json::Map<String, Value>;

// ──────────────────── Scheduled Tasks ────────────────────

/// How a task's `schedule` string is interpreted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// 5-field cron expression evaluated in UTC.
    Cron,
    /// `<integer> <unit>` literal such as "5 minutes".
    Interval,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Cron => "cron",
            TaskType::Interval => "interval",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cron" => Ok(TaskType::Cron),
            "interval" => Ok(TaskType::Interval),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// Declarative definition of recurring work bound to a function locator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledTask {
    /// Stable identifier, `<agent_name>:<task_name>`.
    pub id: String,
    /// Owning agent (e.g. "email-agent").
    pub agent_name: String,
    /// Task name, unique within the agent.
    pub task_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Cron expression or interval literal, depending on `task_type`.
    pub schedule: String,
    pub task_type: TaskType,
    /// Locator resolved to a function by the hosting process.
    pub function_ref: String,
    #[serde(default)]
    pub args: TaskArgs,
    #[serde(default)]
    pub kwargs: TaskKwargs,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledTask {
    /// Build an enabled task with an id derived from agent and task name.
    pub fn new(
        agent_name: impl Into<String>,
        task_name: impl Into<String>,
        schedule: impl Into<String>,
        task_type: TaskType,
        function_ref: impl Into<String>,
    ) -> Self {
        let agent_name = agent_name.into();
        let task_name = task_name.into();
        let now = Utc::now();
        Self {
            id: Self::derive_id(&agent_name, &task_name),
            agent_name,
            task_name,
            description: None,
            enabled: true,
            schedule: schedule.into(),
            task_type,
            function_ref: function_ref.into(),
            args: Vec::new(),
            kwargs: TaskKwargs::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn derive_id(agent_name: &str, task_name: &str) -> String {
        format!("{agent_name}:{task_name}")
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_args(mut self, args: TaskArgs) -> Self {
        self.args = args;
        self
    }

    pub fn with_kwargs(mut self, kwargs: TaskKwargs) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

fn default_true() -> bool {
    true
}

// ──────────────────── Executions ────────────────────

/// Execution status. Transitions only move forward:
/// `queued → running → {success | failed | cancelled}`, or `queued → cancelled`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Queued,
        TaskStatus::Running,
        TaskStatus::Success,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// `success`, `failed` and `cancelled` admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Success)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    /// Every status a record may hold when it moves to `next`.
    pub fn sources_of(next: TaskStatus) -> impl Iterator<Item = TaskStatus> {
        Self::ALL
            .into_iter()
            .filter(move |status| status.can_transition_to(next))
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(TaskStatus::Queued),
            "running" => Ok(TaskStatus::Running),
            "success" => Ok(TaskStatus::Success),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(UnknownVariant(other.to_string())),
        }
    }
}

/// One dispatched attempt of a function, scheduled or ad hoc.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskExecution {
    /// Job identifier, unique per attempt.
    pub id: String,
    /// Originating scheduled task; `None` for ad-hoc enqueues.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_task_id: Option<String>,
    pub agent_name: String,
    pub task_name: String,
    pub function_ref: String,
    #[serde(default)]
    pub args: TaskArgs,
    #[serde(default)]
    pub kwargs: TaskKwargs,
    pub status: TaskStatus,
    /// Set only when `status == Success`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Set only when `status == Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    /// Set iff the status is terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskExecution {
    /// A fresh record in the `queued` state.
    pub fn queued(
        id: impl Into<String>,
        scheduled_task_id: Option<String>,
        agent_name: impl Into<String>,
        task_name: impl Into<String>,
        function_ref: impl Into<String>,
        args: TaskArgs,
        kwargs: TaskKwargs,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            scheduled_task_id,
            agent_name: agent_name.into(),
            task_name: task_name.into(),
            function_ref: function_ref.into(),
            args,
            kwargs,
            status: TaskStatus::Queued,
            result: None,
            error: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ──────────────────── Events ────────────────────

/// A transient notification exchanged between agents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventMessage {
    /// Namespaced type, e.g. "email.batch_processed".
    pub event_type: String,
    pub source_agent: String,
    /// `None` means broadcast.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_agent: Option<String>,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl EventMessage {
    pub fn new(
        event_type: impl Into<String>,
        source_agent: impl Into<String>,
        payload: Value,
        target_agent: Option<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            source_agent: source_agent.into(),
            target_agent,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.target_agent.is_none()
    }
}

/// Returned when parsing an unknown enum string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant(pub String);

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown variant: {}", self.0)
    }
}

impl std::error::Error for UnknownVariant {}
