//! keelsond: the Keelson scheduling daemon.
//!
//! Assembles the scheduling core in one process:
//! - State store (redb)
//! - Plan applier (the single arbiter of allocation changes)
//! - Scheduler workers
//! - Evaluation dispatcher
//!
//! # Usage
//!
//! ```text
//! keelsond register --file cluster.toml --data-dir /var/lib/keelson
//! keelsond run --config keelsond.toml --workers 8
//! ```

mod cluster;
mod config;
mod dispatcher;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use keelson_plan::{ArbiterPlanner, DEFAULT_QUEUE_DEPTH, PlanApplier};
use keelson_scheduler::{EvalQueue, Planner, SchedulerRegistry, Worker};
use keelson_state::StateStore;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::info;

use crate::cluster::ClusterFile;
use crate::config::{KeelsonConfig, LogConfig};
use crate::dispatcher::Dispatcher;

#[derive(Parser)]
#[command(name = "keelsond", about = "Keelson scheduling daemon")]
struct Cli {
    /// Path to keelsond.toml.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory for persistent state (overrides the config file).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatcher, scheduler workers and plan applier.
    Run {
        /// Number of scheduler workers (overrides the config file).
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Upsert nodes and jobs from a cluster file and queue their evaluations.
    Register {
        /// Cluster description (TOML).
        #[arg(long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = KeelsonConfig::load(cli.config.as_deref())?;
    if let Some(data_dir) = cli.data_dir {
        config.server.data_dir = data_dir;
    }
    if let Command::Run {
        workers: Some(workers),
    } = cli.command
    {
        config.server.workers = workers;
    }
    config.validate()?;

    init_tracing(&config.log)?;

    match cli.command {
        Command::Run { .. } => run(config).await,
        Command::Register { file } => register(&config, &file),
    }
}

fn init_tracing(log: &LogConfig) -> anyhow::Result<()> {
    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => log.filter.parse()?,
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if log.json {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

fn open_store(config: &KeelsonConfig) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(&config.server.data_dir)?;
    let db_path = config.db_path();
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, index = store.latest_index()?, "state store opened");
    Ok(store)
}

fn register(config: &KeelsonConfig, file: &std::path::Path) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let cluster = ClusterFile::from_file(file)?;
    let registered = cluster.register(&store)?;
    for eval_id in &registered.evaluations {
        println!("{eval_id}");
    }
    Ok(())
}

async fn run(config: KeelsonConfig) -> anyhow::Result<()> {
    info!(workers = config.server.workers, "Keelson daemon starting");

    // ── Initialize subsystems ──────────────────────────────────

    let store = open_store(&config)?;

    let sink = Arc::new(store.clone());
    let (arbiter, applier_handle) = PlanApplier::spawn(Arc::clone(&sink), DEFAULT_QUEUE_DEPTH);
    let planner: Arc<dyn Planner> = Arc::new(ArbiterPlanner::new(arbiter, sink));
    info!("plan applier started");

    let registry = Arc::new(SchedulerRegistry::with_builtins());
    let names: Vec<&str> = registry.names().collect();
    info!(schedulers = ?names, "scheduler registry initialized");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let (eval_tx, eval_rx) = mpsc::channel(config.server.workers * 2);
    let queue: EvalQueue = Arc::new(Mutex::new(eval_rx));

    let mut worker_handles = Vec::with_capacity(config.server.workers);
    for id in 0..config.server.workers {
        let worker = Worker::new(
            id,
            store.clone(),
            Arc::clone(&registry),
            Arc::clone(&planner),
            config.worker_config(),
        );
        worker_handles.push(tokio::spawn(worker.run(Arc::clone(&queue))));
    }
    drop(planner);

    let dispatcher = Dispatcher::new(store, eval_tx, config.poll_interval());
    dispatcher.recover_claims()?;
    let dispatcher_handle = tokio::spawn(dispatcher.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    // Dispatcher exit closes the queue, workers then drain and stop, and the
    // applier stops once the last planner handle is gone.
    let _ = dispatcher_handle.await;
    for handle in worker_handles {
        let _ = handle.await;
    }
    let _ = applier_handle.await;

    info!("Keelson daemon stopped");
    Ok(())
}
