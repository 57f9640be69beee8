use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use healrun::config::{LogFormat, WorkerConfig};
use healrun::events::EventLog;
use healrun::memory::{ReliabilityPolicy, SessionMemory};
use healrun::queue::{JobMessage, RunQueue};
use healrun::storage::{self, runs::RunStore, runs::Test, runs::TestDefinition};
use healrun::worker::recovery::RecoverySweeper;

#[derive(Parser)]
#[command(
    name = "healrun",
    about = "Self-healing browser test-run worker",
    version,
    long_about = None
)]
struct Cli {
    /// Path to a TOML config file (falls back to $HEALRUN_CONFIG)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume queued runs until SIGINT/SIGTERM
    Work,

    /// Register a test from a JSON definition file
    AddTest {
        /// JSON file with name, url, steps and optional owner/auto_handle_popups
        #[arg(long)]
        file: PathBuf,
    },

    /// Create a queued run for a test and push it onto the queue
    Enqueue {
        #[arg(long)]
        test_id: Uuid,
    },

    /// Run one recovery pass over stuck runs
    Sweep,

    /// Print a run's record as JSON
    Status {
        #[arg(long)]
        run_id: Uuid,
    },

    /// Print a run's event log as JSON lines
    Events {
        #[arg(long)]
        run_id: Uuid,

        /// Only events after this sequence number
        #[arg(long, default_value = "0")]
        after: i64,
    },

    /// Inspect session memory
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },
}

#[derive(Subcommand)]
enum MemoryAction {
    /// List cached strategies, most recently used first
    List {
        #[arg(long, default_value = "50")]
        limit: usize,
    },
}

/// Shape of the file accepted by `add-test`.
#[derive(Deserialize)]
struct TestFile {
    name: String,
    url: String,
    #[serde(default = "default_owner")]
    owner: String,
    #[serde(default = "default_popups")]
    auto_handle_popups: bool,
    #[serde(default)]
    steps: Vec<serde_json::Value>,
}

fn default_owner() -> String {
    "cli".to_string()
}

fn default_popups() -> bool {
    true
}

/// Logs go to stderr so command output on stdout stays machine-readable.
fn init_tracing(config: &WorkerConfig, force_json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.filter));

    if force_json || config.logging.format == LogFormat::Json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Cancel `token` on SIGINT or SIGTERM.
fn spawn_signal_handler(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = term.recv() => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "SIGTERM handler unavailable, listening for Ctrl-C only"
                    );
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        tracing::info!("Shutdown requested, finishing in-flight run");
        token.cancel();
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = WorkerConfig::resolve(cli.config.as_deref()).context("invalid configuration")?;
    init_tracing(&config, cli.log_json);
    match WorkerConfig::source(cli.config.as_deref()) {
        Some(path) => tracing::info!(path = %path.display(), "loaded worker configuration"),
        None => tracing::debug!("no config file given, using compiled-in defaults"),
    }

    match cli.command {
        Commands::Work => {
            let shutdown = CancellationToken::new();
            spawn_signal_handler(shutdown.clone());
            healrun::run_worker(config, shutdown).await?;
        }
        Commands::AddTest { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let parsed: TestFile = serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse {}", file.display()))?;
            let test = Test {
                id: Uuid::new_v4(),
                owner: parsed.owner,
                name: parsed.name,
                url: parsed.url,
                definition: TestDefinition {
                    steps: parsed.steps,
                },
                auto_handle_popups: parsed.auto_handle_popups,
            };
            if let Err(invalid) = test.definition.validated_steps() {
                tracing::warn!(
                    error = %invalid.message,
                    "test registered with an invalid step; its runs will fail"
                );
            }

            let store = RunStore::new(storage::open_pool(config.database_path())?);
            store.create_test(&test).await?;
            println!("{}", test.id);
        }
        Commands::Enqueue { test_id } => {
            let store = RunStore::new(storage::open_pool(config.database_path())?);
            if store.load_test(test_id).await?.is_none() {
                anyhow::bail!("test {test_id} does not exist");
            }
            let run_id = store.create_run(test_id).await?;

            let queue = RunQueue::new(
                storage::open_queue_pool(config.queue_path())?,
                config.queue_settings(),
            );
            let entry_id = queue.enqueue(&JobMessage::Run { run_id, test_id }).await?;
            tracing::info!(%run_id, %test_id, entry_id, "run enqueued");
            println!("{run_id}");
        }
        Commands::Sweep => {
            let store = RunStore::new(storage::open_pool(config.database_path())?);
            let events = EventLog::new(storage::open_queue_pool(config.queue_path())?);
            let sweeper = RecoverySweeper::new(
                store,
                events,
                config.stuck_run_timeout(),
                config.recovery_interval(),
            );
            let recovered = sweeper.sweep_once().await?;
            println!("{recovered} stuck run(s) failed");
        }
        Commands::Status { run_id } => {
            let store = RunStore::new(storage::open_pool(config.database_path())?);
            let run = store
                .load_run(run_id)
                .await?
                .with_context(|| format!("run {run_id} not found"))?;
            println!("{}", serde_json::to_string_pretty(&run)?);
        }
        Commands::Events { run_id, after } => {
            let events = EventLog::new(storage::open_queue_pool(config.queue_path())?);
            for event in events.read(run_id, after, 10_000).await? {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
        Commands::Memory { action } => match action {
            MemoryAction::List { limit } => {
                let memory = SessionMemory::new(
                    storage::open_pool(config.database_path())?,
                    ReliabilityPolicy::default(),
                );
                for entry in memory.list(limit).await? {
                    println!("{}", serde_json::to_string(&entry)?);
                }
            }
        },
    }

    Ok(())
}
