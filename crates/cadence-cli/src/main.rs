mod admin;
mod builtins;
mod run;
mod services;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::services::Services;

#[derive(Parser)]
#[command(name = "cadence", about = "Task scheduler, job queue, and agent event channel")]
struct Cli {
    /// Config file (defaults to ~/.cadence/config.json5)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler, worker pool, and event listener until Ctrl-C
    Run,
    /// Inspect or disable scheduled tasks
    Tasks {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Inspect task executions
    Executions {
        #[command(subcommand)]
        command: ExecutionCommands,
    },
    /// Queue a one-off execution and print its id
    Enqueue {
        /// Function locator, e.g. "builtin:echo"
        function: String,

        /// Agent the execution belongs to
        #[arg(long)]
        agent: String,

        /// Task name recorded on the execution
        #[arg(long)]
        task: String,

        /// Positional arguments as a JSON array
        #[arg(long)]
        args: Option<String>,

        /// Keyword arguments as a JSON object
        #[arg(long)]
        kwargs: Option<String>,
    },
    /// Cancel a queued or running execution
    Cancel {
        /// Execution id
        id: String,
    },
    /// Publish an event to one agent or to everyone
    Publish {
        /// Event type, e.g. "report.ready"
        event_type: String,

        /// Agent recorded as the sender
        #[arg(long, default_value = "cli")]
        source: String,

        /// Deliver only to this agent (broadcast when omitted)
        #[arg(long)]
        target: Option<String>,

        /// Payload as JSON (defaults to {})
        #[arg(long)]
        payload: Option<String>,
    },
    /// Check system health
    Health,
}

#[derive(Subcommand)]
enum TaskCommands {
    /// List scheduled tasks
    List {
        /// Only tasks of this agent
        #[arg(short, long)]
        agent: Option<String>,
    },
    /// Show one scheduled task as JSON
    Show {
        /// Task id ("<agent>:<task>")
        id: String,
    },
    /// Enable a scheduled task; dispatch restarts from now
    Enable {
        /// Task id ("<agent>:<task>")
        id: String,
    },
    /// Disable a scheduled task
    Disable {
        /// Task id ("<agent>:<task>")
        id: String,
    },
    /// Delete a scheduled task, keeping its execution history
    Delete {
        /// Task id ("<agent>:<task>")
        id: String,
    },
}

#[derive(Subcommand)]
enum ExecutionCommands {
    /// List executions, newest first
    List {
        /// Only executions of this agent
        #[arg(short, long)]
        agent: Option<String>,

        /// Only executions in this status (queued, running, success, failed, cancelled)
        #[arg(short, long)]
        status: Option<String>,

        /// Maximum number of rows
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Show one execution as JSON
    Show {
        /// Execution id
        id: String,
    },
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let services = Services::open(cli.config.as_deref())?;
    let rt = tokio::runtime::Runtime::new()?;

    match cli.command {
        Commands::Run => rt.block_on(run::run_service(services))?,
        Commands::Tasks { command } => match command {
            TaskCommands::List { agent } => {
                rt.block_on(admin::list_tasks(&services, agent.as_deref()))?
            }
            TaskCommands::Show { id } => rt.block_on(admin::show_task(&services, &id))?,
            TaskCommands::Enable { id } => rt.block_on(admin::enable_task(&services, &id))?,
            TaskCommands::Disable { id } => rt.block_on(admin::disable_task(&services, &id))?,
            TaskCommands::Delete { id } => rt.block_on(admin::delete_task(&services, &id))?,
        },
        Commands::Executions { command } => match command {
            ExecutionCommands::List {
                agent,
                status,
                limit,
            } => rt.block_on(admin::list_executions(&services, agent, status, limit))?,
            ExecutionCommands::Show { id } => {
                rt.block_on(admin::show_execution(&services, &id))?
            }
        },
        Commands::Enqueue {
            function,
            agent,
            task,
            args,
            kwargs,
        } => rt.block_on(admin::enqueue(&services, function, agent, task, args, kwargs))?,
        Commands::Cancel { id } => rt.block_on(admin::cancel(&services, &id))?,
        Commands::Publish {
            event_type,
            source,
            target,
            payload,
        } => rt.block_on(admin::publish(&services, event_type, source, target, payload))?,
        Commands::Health => rt.block_on(admin::health(&services))?,
    }

    Ok(())
}
