//! Function registry — maps locator strings to task functions.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use cadence_types::{TaskArgs, TaskKwargs};

/// Future returned by a task function.
pub type TaskFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

/// A registered task function.
pub type TaskFn = Arc<dyn Fn(TaskContext) -> TaskFuture + Send + Sync>;

/// Everything a task function receives for one execution.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub execution_id: String,
    pub args: TaskArgs,
    pub kwargs: TaskKwargs,
    /// Fired when the execution is cancelled while running. Honouring it is
    /// up to the function.
    pub cancel: CancellationToken,
}

impl TaskContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Keyword argument by name.
    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }
}

/// Wrap an async closure as a [`TaskFn`].
pub fn task_fn<F, Fut>(f: F) -> TaskFn
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(move |ctx| -> TaskFuture { Box::pin(f(ctx)) })
}

/// Locator → function table, assembled once at process start.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, TaskFn>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function under `locator`, replacing any previous entry.
    pub fn register(&mut self, locator: impl Into<String>, function: TaskFn) {
        let locator = locator.into();
        if self.functions.insert(locator.clone(), function).is_some() {
            tracing::warn!(locator = %locator, "Task function replaced");
        }
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, locator: impl Into<String>, function: TaskFn) -> Self {
        self.register(locator, function);
        self
    }

    pub fn get(&self, locator: &str) -> Option<TaskFn> {
        self.functions.get(locator).cloned()
    }

    pub fn contains(&self, locator: &str) -> bool {
        self.functions.contains_key(locator)
    }

    /// Registered locators, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.functions.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .finish()
    }
}
