use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use cadence_types::{ScheduledTask, TaskArgs, TaskKwargs, TaskType};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON5 parse error: {0}")]
    Json5(#[from] json5::Error),
    #[error("Config directory not found")]
    NoDirFound,
}

/// Which broker backs the job queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BrokerKind {
    /// Durable queue table in SQLite; safe across processes.
    #[default]
    Sqlite,
    /// In-process queue; lost on exit.
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BrokerConfig {
    #[serde(default)]
    pub kind: BrokerKind,
    /// Separate database file for the broker table (defaults to the main database).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    /// Number of concurrent workers.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// How long an idle worker waits on the broker before re-checking shutdown.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_concurrency() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    500
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Which transport carries agent events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum EventsKind {
    /// Event log table in SQLite; reaches every process sharing the file.
    #[default]
    Sqlite,
    /// In-process broadcast channels; only this process sees its events.
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    #[serde(default)]
    pub kind: EventsKind,
    /// Separate database file for the event log (defaults to the main database).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Buffered messages per channel before slow in-process listeners start lagging.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// How often a SQLite subscription checks for new events.
    #[serde(default = "default_events_poll_ms")]
    pub poll_interval_ms: u64,
}

fn default_capacity() -> usize {
    256
}

fn default_events_poll_ms() -> u64 {
    200
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            kind: EventsKind::default(),
            path: None,
            capacity: default_capacity(),
            poll_interval_ms: default_events_poll_ms(),
        }
    }
}

/// A declarative task entry as written in a configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub schedule: String,
    #[serde(rename = "type", default = "default_task_type")]
    pub task_type: TaskType,
    /// Function locator, e.g. "builtin:echo".
    pub function: String,
    #[serde(default)]
    pub args: TaskArgs,
    #[serde(default)]
    pub kwargs: TaskKwargs,
}

fn default_true() -> bool {
    true
}

fn default_task_type() -> TaskType {
    TaskType::Cron
}

impl TaskDefinition {
    /// Map this entry onto a `ScheduledTask` owned by `agent_name`.
    pub fn into_scheduled_task(self, agent_name: &str) -> ScheduledTask {
        let mut task = ScheduledTask::new(
            agent_name,
            self.name,
            self.schedule,
            self.task_type,
            self.function,
        )
        .with_args(self.args)
        .with_kwargs(self.kwargs)
        .with_enabled(self.enabled);
        task.description = self.description;
        task
    }
}

/// Inline task list for one agent.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentTasksConfig {
    #[serde(default)]
    pub tasks: Vec<TaskDefinition>,
}

/// Reference to a separate task-definition document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskFileRef {
    pub agent: String,
    pub path: PathBuf,
}

/// Top-level cadence configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CadenceConfig {
    /// SQLite database holding tasks and executions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub events: EventsConfig,
    /// Task documents loaded at startup, one agent each.
    #[serde(default)]
    pub task_files: Vec<TaskFileRef>,
    /// Inline task definitions keyed by agent name.
    #[serde(default)]
    pub agents: HashMap<String, AgentTasksConfig>,
}

impl CadenceConfig {
    /// Resolve the database path, defaulting to `~/.cadence/cadence.db`.
    pub fn database_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.database_path {
            Some(p) => Ok(p.clone()),
            None => Ok(config_dir()?.join("cadence.db")),
        }
    }

    /// Collect every task definition: inline ones first, then task files.
    ///
    /// Relative task file paths are resolved against `base_dir`.
    pub fn scheduled_tasks(&self, base_dir: &Path) -> Result<Vec<ScheduledTask>, ConfigError> {
        let mut tasks = Vec::new();

        let mut agents: Vec<_> = self.agents.iter().collect();
        agents.sort_by(|a, b| a.0.cmp(b.0));
        for (agent, cfg) in agents {
            tasks.extend(
                cfg.tasks
                    .iter()
                    .cloned()
                    .map(|def| def.into_scheduled_task(agent)),
            );
        }

        for file in &self.task_files {
            let path = if file.path.is_absolute() {
                file.path.clone()
            } else {
                base_dir.join(&file.path)
            };
            tasks.extend(load_task_file(&path, &file.agent)?);
        }

        Ok(tasks)
    }
}

/// Task-definition document: `{ tasks: [...] }`.
#[derive(Debug, Clone, Deserialize, Default)]
struct TaskDocument {
    #[serde(default)]
    tasks: Vec<TaskDefinition>,
}

/// Load scheduled tasks for `agent_name` from a JSON5 task document.
///
/// A missing file is not an error: it is logged and yields no tasks.
pub fn load_task_file(path: &Path, agent_name: &str) -> Result<Vec<ScheduledTask>, ConfigError> {
    if !path.exists() {
        tracing::warn!("Task file not found: {}", path.display());
        return Ok(Vec::new());
    }

    let content = std::fs::read_to_string(path)?;
    let doc: TaskDocument = json5::from_str(&content)?;
    if doc.tasks.is_empty() {
        tracing::warn!("No tasks found in {}", path.display());
    }

    let tasks: Vec<_> = doc
        .tasks
        .into_iter()
        .map(|def| def.into_scheduled_task(agent_name))
        .collect();
    tracing::info!("Loaded {} tasks from {}", tasks.len(), path.display());
    Ok(tasks)
}

/// Resolve the cadence config directory (~/.cadence/).
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|h| h.join(".cadence"))
        .ok_or(ConfigError::NoDirFound)
}

/// Resolve the config file path (~/.cadence/config.json5).
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("config.json5"))
}

/// Load configuration from a specific path, falling back to defaults if not found.
pub fn load_config_from(path: &Path) -> Result<CadenceConfig, ConfigError> {
    if !path.exists() {
        tracing::debug!("Config file not found at {}, using defaults", path.display());
        return Ok(CadenceConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: CadenceConfig = json5::from_str(&content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CadenceConfig::default();
        assert_eq!(config.broker.kind, BrokerKind::Sqlite);
        assert_eq!(config.workers.concurrency, 4);
        assert_eq!(config.workers.poll_interval_ms, 500);
        assert_eq!(config.events.kind, EventsKind::Sqlite);
        assert_eq!(config.events.capacity, 256);
        assert_eq!(config.events.poll_interval_ms, 200);
        assert!(config.agents.is_empty());
    }

    #[test]
    fn test_json5_parse() {
        let json5_str = r#"{
            database_path: "/tmp/cadence.db",
            broker: { kind: "memory" },
            workers: { concurrency: 8 },
            events: { kind: "memory", capacity: 64 },
            agents: {
                "aiops-bot": {
                    tasks: [
                        { name: "health", schedule: "*/5 * * * *", function: "builtin:echo" },
                    ],
                },
            },
        }"#;
        let config: CadenceConfig = json5::from_str(json5_str).unwrap();
        assert_eq!(config.broker.kind, BrokerKind::Memory);
        assert_eq!(config.workers.concurrency, 8);
        assert_eq!(config.workers.poll_interval_ms, 500);
        assert_eq!(config.events.kind, EventsKind::Memory);
        assert_eq!(config.events.capacity, 64);
        assert_eq!(
            config.database_path().unwrap(),
            PathBuf::from("/tmp/cadence.db")
        );

        let tasks = config.scheduled_tasks(Path::new("/")).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, "aiops-bot:health");
        assert_eq!(tasks[0].task_type, TaskType::Cron);
        assert!(tasks[0].enabled);
    }

    #[test]
    fn test_task_definition_mapping() {
        let def: TaskDefinition = json5::from_str(
            r#"{
                name: "renew",
                description: "Renew subscriptions",
                enabled: false,
                schedule: "5 minutes",
                type: "interval",
                function: "billing:renew",
                args: [1, "two"],
                kwargs: { dry_run: true },
            }"#,
        )
        .unwrap();
        let task = def.into_scheduled_task("billing");
        assert_eq!(task.id, "billing:renew");
        assert_eq!(task.task_type, TaskType::Interval);
        assert!(!task.enabled);
        assert_eq!(task.args.len(), 2);
        assert_eq!(task.kwargs["dry_run"], serde_json::json!(true));
        assert_eq!(task.description.as_deref(), Some("Renew subscriptions"));
    }

    #[test]
    fn test_load_task_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("email.json5");
        std::fs::write(
            &path,
            r#"{
                // nightly batch
                tasks: [
                    { name: "batch", schedule: "0 2 * * *", function: "email:batch" },
                    { name: "poll", schedule: "10 minutes", type: "interval", function: "email:poll" },
                ],
            }"#,
        )
        .unwrap();

        let tasks = load_task_file(&path, "email-agent").unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].id, "email-agent:batch");
        assert_eq!(tasks[1].task_type, TaskType::Interval);

        let config = CadenceConfig {
            task_files: vec![TaskFileRef {
                agent: "email-agent".into(),
                path: PathBuf::from("email.json5"),
            }],
            ..Default::default()
        };
        assert_eq!(config.scheduled_tasks(dir.path()).unwrap().len(), 2);
    }

    #[test]
    fn test_load_task_file_missing() {
        let tasks = load_task_file(Path::new("/nonexistent/tasks.json5"), "x").unwrap();
        assert!(tasks.is_empty());
    }

    #[test]
    fn test_load_task_file_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json5");
        std::fs::write(&path, "{ tasks: [ { name: } ] }").unwrap();
        assert!(matches!(
            load_task_file(&path, "x"),
            Err(ConfigError::Json5(_))
        ));
    }

    #[test]
    fn test_load_config_from_missing_uses_defaults() {
        let config = load_config_from(Path::new("/nonexistent/config.json5")).unwrap();
        assert!(config.task_files.is_empty());
    }
}
