//! One-shot administrative commands against the store and queue.

use anyhow::{Context, bail};
use serde_json::Value;

use cadence_events::EventBus;
use cadence_queue::EnqueueRequest;
use cadence_storage::ExecutionFilter;
use cadence_types::{TaskArgs, TaskExecution, TaskKwargs, TaskStatus};

use crate::services::Services;

pub async fn list_tasks(services: &Services, agent: Option<&str>) -> anyhow::Result<()> {
    let tasks = services.store.list_tasks(agent).await?;
    if tasks.is_empty() {
        println!("No scheduled tasks.");
        return Ok(());
    }
    for task in tasks {
        println!(
            "{:<32} {:<8} {:<9} {:<20} {}",
            task.id,
            if task.enabled { "enabled" } else { "disabled" },
            task.task_type,
            task.schedule,
            task.function_ref,
        );
    }
    Ok(())
}

pub async fn show_task(services: &Services, id: &str) -> anyhow::Result<()> {
    match services.store.get_task(id).await? {
        Some(task) => {
            println!("{}", serde_json::to_string_pretty(&task)?);
            Ok(())
        }
        None => bail!("No such task: {id}"),
    }
}

pub async fn disable_task(services: &Services, id: &str) -> anyhow::Result<()> {
    if !services.store.set_task_enabled(id, false).await? {
        bail!("No such task: {id}");
    }
    println!("Disabled {id}");
    Ok(())
}

/// A running service resumes dispatch at its next task resync.
pub async fn enable_task(services: &Services, id: &str) -> anyhow::Result<()> {
    if !services.store.set_task_enabled(id, true).await? {
        bail!("No such task: {id}");
    }
    println!("Enabled {id}");
    Ok(())
}

/// Remove the definition; its executions stay listed.
pub async fn delete_task(services: &Services, id: &str) -> anyhow::Result<()> {
    if !services.store.delete_task(id).await? {
        bail!("No such task: {id}");
    }
    println!("Deleted {id}");
    Ok(())
}

pub async fn list_executions(
    services: &Services,
    agent: Option<String>,
    status: Option<String>,
    limit: usize,
) -> anyhow::Result<()> {
    let status = status
        .map(|s| s.parse::<TaskStatus>())
        .transpose()
        .context("Invalid --status")?;
    let executions = services
        .queue
        .list_executions(ExecutionFilter {
            agent_name: agent,
            status,
            scheduled_task_id: None,
            limit: Some(limit),
        })
        .await?;
    if executions.is_empty() {
        println!("No executions.");
        return Ok(());
    }
    for exec in executions {
        println!("{}", summary_line(&exec));
    }
    Ok(())
}

pub async fn show_execution(services: &Services, id: &str) -> anyhow::Result<()> {
    // Reconcile against the broker before showing the record
    services.queue.get_status(id).await?;
    match services.queue.get_execution(id).await? {
        Some(exec) => {
            println!("{}", serde_json::to_string_pretty(&exec)?);
            Ok(())
        }
        None => bail!("No such execution: {id}"),
    }
}

pub async fn enqueue(
    services: &Services,
    function: String,
    agent: String,
    task: String,
    args: Option<String>,
    kwargs: Option<String>,
) -> anyhow::Result<()> {
    let args = parse_args(args.as_deref())?;
    let kwargs = parse_kwargs(kwargs.as_deref())?;
    let id = services
        .queue
        .enqueue(
            EnqueueRequest::new(function, agent, task)
                .with_args(args)
                .with_kwargs(kwargs),
        )
        .await?;
    println!("{id}");
    Ok(())
}

pub async fn cancel(services: &Services, id: &str) -> anyhow::Result<()> {
    if services.queue.cancel(id).await? {
        println!("Cancelled {id}");
    } else {
        println!("{id} was not cancelled (unknown or already finished)");
    }
    Ok(())
}

pub async fn publish(
    services: &Services,
    event_type: String,
    source: String,
    target: Option<String>,
    payload: Option<String>,
) -> anyhow::Result<()> {
    let payload = match payload {
        Some(raw) => serde_json::from_str(&raw).context("--payload must be JSON")?,
        None => Value::Object(Default::default()),
    };
    let bus = EventBus::new(services.transport.clone());
    bus.publish(&event_type, &source, payload, target.as_deref())
        .await;
    match target {
        Some(agent) => println!("Published {event_type} to {agent}"),
        None => println!("Published {event_type} to all agents"),
    }
    Ok(())
}

pub async fn health(services: &Services) -> anyhow::Result<()> {
    let tasks = services.store.list_tasks(None).await?;
    let enabled = tasks.iter().filter(|t| t.enabled).count();

    println!("cadence is healthy");
    println!("  database: {}", services.config.database_path()?.display());
    println!("  broker: {:?}", services.config.broker.kind);
    println!("  events: {:?}", services.config.events.kind);
    println!("  workers: {}", services.config.workers.concurrency);
    println!("  scheduled tasks: {} ({enabled} enabled)", tasks.len());
    for status in [TaskStatus::Queued, TaskStatus::Running, TaskStatus::Failed] {
        let count = services
            .queue
            .list_executions(ExecutionFilter {
                status: Some(status),
                ..Default::default()
            })
            .await?
            .len();
        println!("  {status} executions: {count}");
    }
    Ok(())
}

fn summary_line(exec: &TaskExecution) -> String {
    let detail = match exec.status {
        TaskStatus::Failed => exec.error.clone().unwrap_or_default(),
        TaskStatus::Success => exec
            .result
            .as_ref()
            .map(Value::to_string)
            .unwrap_or_default(),
        _ => String::new(),
    };
    format!(
        "{} {:<9} {:<24} {} {}",
        exec.id,
        exec.status,
        format!("{}:{}", exec.agent_name, exec.task_name),
        exec.created_at.format("%Y-%m-%d %H:%M:%S"),
        detail,
    )
}

fn parse_args(raw: Option<&str>) -> anyhow::Result<TaskArgs> {
    match raw {
        None => Ok(TaskArgs::new()),
        Some(raw) => match serde_json::from_str(raw).context("--args must be JSON")? {
            Value::Array(items) => Ok(items),
            _ => bail!("--args must be a JSON array"),
        },
    }
}

fn parse_kwargs(raw: Option<&str>) -> anyhow::Result<TaskKwargs> {
    match raw {
        None => Ok(TaskKwargs::new()),
        Some(raw) => match serde_json::from_str(raw).context("--kwargs must be JSON")? {
            Value::Object(map) => Ok(map),
            _ => bail!("--kwargs must be a JSON object"),
        },
    }
}
