//! CLI command definitions for evalforge.
//!
//! Three operator commands: `start` runs the orchestrator loops until a
//! shutdown is requested, `stop` asks a running orchestrator to drain, and
//! `status` reports queue depths, batch progress, and worker liveness.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use crate::broker::{Broker, RedisBroker};
use crate::config::OrchestratorConfig;
use crate::metrics;
use crate::orchestrator::{
    clear_shutdown_request, request_shutdown, shutdown_requested, Orchestrator, OrchestratorError,
    StatusReport,
};
use crate::store::{PostgresStore, Store};

/// Scheduling and aggregation engine for multi-dimension evaluation of AI
/// agent responses.
#[derive(Parser)]
#[command(name = "evalforge")]
#[command(about = "Fan out agent responses to dimension scorers and aggregate the results")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Start the orchestrator and run until shutdown.
    ///
    /// Connects to the broker and the store, applies pending migrations,
    /// then runs the dispatch loop, collector loop, and timeout sweeper
    /// until an interrupt arrives or `evalforge stop` is invoked.
    Start(StartArgs),

    /// Request a graceful shutdown of a running orchestrator.
    Stop(StopArgs),

    /// Print queue depths, batch progress, and live workers.
    Status(StatusArgs),
}

/// Arguments for `evalforge start`.
#[derive(Parser, Debug)]
pub struct StartArgs {
    /// Redis connection URL for the queue broker.
    #[arg(long, env = "REDIS_URL", default_value = "redis://localhost:6379")]
    pub redis_url: String,

    /// PostgreSQL connection URL for the store.
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Override the dispatch concurrency cap.
    #[arg(long)]
    pub max_concurrent_tasks: Option<usize>,

    /// Override the per-task deadline in seconds.
    #[arg(long)]
    pub task_timeout_secs: Option<u64>,

    /// Override the sweeper cadence in seconds.
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// Override the task-level retry ceiling.
    #[arg(long)]
    pub max_retries: Option<u32>,
}

/// Arguments for `evalforge stop`.
#[derive(Parser, Debug)]
pub struct StopArgs {
    /// Redis connection URL for the queue broker.
    #[arg(long, env = "REDIS_URL", default_value = "redis://localhost:6379")]
    pub redis_url: String,
}

/// Arguments for `evalforge status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Redis connection URL for the queue broker.
    #[arg(long, env = "REDIS_URL", default_value = "redis://localhost:6379")]
    pub redis_url: String,

    /// Output the report as JSON.
    #[arg(short, long)]
    pub json: bool,
}

impl StartArgs {
    fn into_config(self) -> OrchestratorConfig {
        let mut config = OrchestratorConfig::default()
            .with_redis_url(self.redis_url)
            .with_database_url(self.database_url);

        if let Some(max) = self.max_concurrent_tasks {
            config = config.with_max_concurrent_tasks(max);
        }
        if let Some(secs) = self.task_timeout_secs {
            config = config.with_task_timeout(Duration::from_secs(secs));
        }
        if let Some(secs) = self.sweep_interval_secs {
            config = config.with_sweep_interval(Duration::from_secs(secs));
        }
        if let Some(max) = self.max_retries {
            config = config.with_max_retries(max);
        }

        config
    }
}

/// Parses the command line.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Runs the parsed CLI command.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Start(args) => run_start(args).await,
        Commands::Stop(args) => run_stop(args).await,
        Commands::Status(args) => run_status(args).await,
    }
}

async fn run_start(args: StartArgs) -> anyhow::Result<()> {
    let config = args.into_config();
    config.validate()?;

    metrics::init_metrics()?;

    info!(
        redis_url = %config.redis_url,
        max_concurrent_tasks = config.max_concurrent_tasks,
        "Connecting to broker and store"
    );

    let broker = Arc::new(RedisBroker::connect(&config.redis_url).await?);
    let store = PostgresStore::connect(&config.database_url).await?;
    store.run_migrations().await?;
    let store: Arc<dyn Store> = Arc::new(store);

    // A stale stop request from a previous run must not kill us on startup.
    clear_shutdown_request(broker.as_ref()).await?;

    let mut orchestrator =
        Orchestrator::new(config, Arc::clone(&broker) as Arc<dyn Broker>, store)?;
    orchestrator.start().await?;

    wait_for_shutdown(broker.as_ref()).await;

    match orchestrator.stop().await {
        Ok(()) => {}
        Err(OrchestratorError::ShutdownTimeout(deadline)) => {
            warn!(
                deadline_secs = deadline.as_secs(),
                "Loops exceeded the shutdown deadline and were aborted"
            );
        }
        Err(e) => return Err(e.into()),
    }

    clear_shutdown_request(broker.as_ref()).await?;
    info!("Orchestrator exited");

    Ok(())
}

/// Blocks until an interrupt arrives or the broker control key requests a
/// shutdown.
async fn wait_for_shutdown(broker: &dyn Broker) {
    let mut poll = tokio::time::interval(Duration::from_secs(2));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received interrupt");
                return;
            }
            _ = poll.tick() => {
                match shutdown_requested(broker).await {
                    Ok(true) => {
                        info!("Shutdown requested via control key");
                        return;
                    }
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "Control key check failed"),
                }
            }
        }
    }
}

async fn run_stop(args: StopArgs) -> anyhow::Result<()> {
    let broker = RedisBroker::connect(&args.redis_url).await?;
    request_shutdown(&broker).await?;
    println!("Shutdown requested; the orchestrator will drain and exit.");
    Ok(())
}

async fn run_status(args: StatusArgs) -> anyhow::Result<()> {
    let broker = RedisBroker::connect(&args.redis_url).await?;
    let report = StatusReport::gather(&broker).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Queues");
    println!("  {:<32} {}", "main_evaluation_tasks", report.main_queue);
    for (queue, depth) in &report.dimension_queues {
        println!("  {:<32} {}", queue, depth);
    }
    println!("  {:<32} {}", "dimension_results", report.results_queue);

    match report.in_flight {
        Some(count) => println!("\nIn-flight tasks: {}", count),
        None => println!("\nIn-flight tasks: unknown (no orchestrator heartbeat)"),
    }

    if report.batches.is_empty() {
        println!("\nBatches: none");
    } else {
        println!("\nBatches");
        for batch in &report.batches {
            println!(
                "  {:<24} {:<12} total={} pending={} processing={} completed={} failed={} cancelled={}",
                batch["batch_id"].as_str().unwrap_or("?"),
                batch["status"].as_str().unwrap_or("?"),
                batch["total"],
                batch["pending"],
                batch["processing"],
                batch["completed"],
                batch["failed"],
                batch["cancelled"],
            );
        }
    }

    if report.live_workers.is_empty() {
        println!("\nWorkers: none alive");
    } else {
        println!("\nWorkers alive: {}", report.live_workers.join(", "));
    }

    Ok(())
}
