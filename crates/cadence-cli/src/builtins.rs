//! Functions shipped with the binary, available to every configured task.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use serde_json::{Value, json};

use cadence_events::EventBus;
use cadence_queue::{FunctionRegistry, TaskContext, task_fn};

/// Registry holding the `builtin:*` functions.
pub fn registry(bus: Arc<EventBus>) -> FunctionRegistry {
    FunctionRegistry::new()
        .with("builtin:echo", task_fn(echo))
        .with("builtin:sleep", task_fn(sleep))
        .with("builtin:fail", task_fn(fail))
        .with(
            "builtin:publish",
            task_fn(move |ctx| publish(bus.clone(), ctx)),
        )
}

/// Return the call's arguments unchanged.
async fn echo(ctx: TaskContext) -> anyhow::Result<Value> {
    Ok(json!({ "args": ctx.args, "kwargs": ctx.kwargs }))
}

/// Sleep for `kwargs.seconds` (default 1), stopping early on cancellation.
async fn sleep(ctx: TaskContext) -> anyhow::Result<Value> {
    let seconds = match ctx.kwarg("seconds") {
        Some(v) => v.as_f64().context("kwargs.seconds must be a number")?,
        None => 1.0,
    };
    if !(0.0..=86_400.0).contains(&seconds) {
        bail!("kwargs.seconds out of range: {seconds}");
    }

    tokio::select! {
        _ = ctx.cancel.cancelled() => bail!("cancelled after start"),
        _ = tokio::time::sleep(Duration::from_secs_f64(seconds)) => {}
    }
    Ok(json!({ "slept": seconds }))
}

/// Always fail, with `kwargs.message` if given.
async fn fail(ctx: TaskContext) -> anyhow::Result<Value> {
    let message = ctx
        .kwarg("message")
        .and_then(Value::as_str)
        .unwrap_or("builtin:fail called");
    bail!("{message}")
}

/// Publish `kwargs.event_type` with `kwargs.payload` from `kwargs.source_agent`,
/// to `kwargs.target_agent` or everyone.
async fn publish(bus: Arc<EventBus>, ctx: TaskContext) -> anyhow::Result<Value> {
    let event_type = ctx
        .kwarg("event_type")
        .and_then(Value::as_str)
        .context("kwargs.event_type is required")?;
    let source = ctx
        .kwarg("source_agent")
        .and_then(Value::as_str)
        .unwrap_or("cadence");
    let target = ctx.kwarg("target_agent").and_then(Value::as_str);
    let payload = ctx.kwarg("payload").cloned().unwrap_or(Value::Null);

    bus.publish(event_type, source, payload, target).await;
    Ok(json!({ "published": event_type, "target_agent": target }))
}
