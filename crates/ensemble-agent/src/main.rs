use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use ensemble_core::kvs::{ConsulKvs, ConsulKvsConfig};
use ensemble_core::{
    CasQueue, Config, ConfigLoader, DynKvStore, Event, EventResult, NodeTaskResult,
    OperationDeps, PatternSet, RunnerSettings, Scheduler, TaskResult, TelemetryOptions,
    init_telemetry, keys,
};
use serde::Serialize;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "ensemble-agent",
    version,
    about = "Cluster-wide event-driven task scheduling agent"
)]
struct Cli {
    /// Path to the agent configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register this node and run the polling loop.
    Run,
    /// Inject a cluster-wide event into the event queue.
    Fire(FireArgs),
    /// Show the journal for one event.
    Status(StatusArgs),
}

#[derive(Args, Debug)]
struct FireArgs {
    /// Event name, matched against pattern triggers.
    name: String,
    /// Explicit event id; a random one is generated when absent.
    #[arg(long)]
    id: Option<String>,
}

#[derive(Args, Debug)]
struct StatusArgs {
    /// Event id as printed by `fire`.
    event_id: String,
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,
}

#[derive(Copy, Clone, Debug, ValueEnum, Default)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

trait RenderText {
    fn render_text(&self) -> String;
}

fn emit<T: Serialize + RenderText>(format: OutputFormat, response: &T) -> Result<()> {
    match format {
        OutputFormat::Text => println!("{}", response.render_text()),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(response)?),
    }
    Ok(())
}

#[derive(Serialize)]
struct FireResponse {
    event_id: String,
    name: String,
}

impl RenderText for FireResponse {
    fn render_text(&self) -> String {
        format!("fired event {} (id: {})", self.name, self.event_id)
    }
}

#[derive(Serialize)]
struct StatusResponse {
    event: Option<EventResult>,
    tasks: Vec<TaskStatus>,
}

#[derive(Serialize)]
struct TaskStatus {
    #[serde(flatten)]
    result: TaskResult,
    nodes: Vec<NodeTaskResult>,
}

impl RenderText for StatusResponse {
    fn render_text(&self) -> String {
        let Some(event) = &self.event else {
            return "event not found".to_string();
        };

        let mut lines = vec![format!(
            "event {} ({}) status={} started={}",
            event.id,
            event.name,
            event.status,
            event.started_at.to_rfc3339()
        )];
        if let Some(finished) = event.finished_at {
            lines.push(format!("finished={}", finished.to_rfc3339()));
        }
        for task in &self.tasks {
            lines.push(format!(
                "  task #{} {} status={}",
                task.result.no, task.result.name, task.result.status
            ));
            for node in &task.nodes {
                lines.push(format!("    node {} status={}", node.node, node.status));
            }
        }
        lines.join("\n")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = ConfigLoader::load(cli.config.clone())?;
    init_telemetry(TelemetryOptions::default().with_level(config.logging.level.clone()))?;

    let kvs: DynKvStore = Arc::new(ConsulKvs::new(ConsulKvsConfig::new(&config.kvs.url))?);

    match cli.command {
        Command::Run => run_agent(config, kvs).await,
        Command::Fire(args) => fire_event(args, kvs).await,
        Command::Status(args) => show_status(args, kvs).await,
    }
}

async fn run_agent(config: Config, kvs: DynKvStore) -> Result<()> {
    let node = match &config.node.name {
        Some(name) => name.clone(),
        None => hostname::get()
            .context("failed to resolve hostname")?
            .to_string_lossy()
            .into_owned(),
    };

    let deps = OperationDeps {
        kvs: kvs.clone(),
        settings: Arc::new(RunnerSettings::from_config(&config)),
    };
    let patterns_dir = config.runtime.base_dir.join("patterns");
    let patterns = PatternSet::load(&patterns_dir, &deps)
        .with_context(|| format!("failed to load patterns from {}", patterns_dir.display()))?;
    if patterns.is_empty() {
        info!(dir = %patterns_dir.display(), "no patterns found; agent will only coordinate");
    }

    let scheduler = Scheduler::new(kvs, patterns, node, config.roles())
        .with_poll_interval(Duration::from_millis(config.runtime.poll_interval_ms));
    scheduler.run().await?;
    Ok(())
}

async fn fire_event(args: FireArgs, kvs: DynKvStore) -> Result<()> {
    let mut event = Event::new(&args.name);
    if let Some(id) = args.id {
        event.id = id;
    }

    let queue: CasQueue<Event> = CasQueue::new(kvs, keys::EVENT_QUEUE);
    queue.enqueue(&event).await?;

    emit(
        OutputFormat::Text,
        &FireResponse {
            event_id: event.id,
            name: event.name,
        },
    )
}

async fn show_status(args: StatusArgs, kvs: DynKvStore) -> Result<()> {
    let event = EventResult::load(&*kvs, &args.event_id).await?;
    let mut tasks = Vec::new();
    for result in TaskResult::load_all(&*kvs, &args.event_id).await? {
        let nodes = NodeTaskResult::load_all(&*kvs, &args.event_id, result.no).await?;
        tasks.push(TaskStatus { result, nodes });
    }

    emit(args.format, &StatusResponse { event, tasks })
}
