//! healrun: self-healing browser test-run worker.
//!
//! This crate consumes queued test runs, executes their natural-language steps
//! in a browser through a cached / structural / perceptual strategy cascade,
//! records results and progress events, and recovers runs orphaned by crashed
//! workers.

pub mod browser;
pub mod config;
pub mod events;
pub mod evidence;
pub mod memory;
pub mod queue;
pub mod storage;
pub mod strategy;
pub mod worker;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use browser::webdriver::WebDriverFactory;
use browser::DriverFactory;
use config::WorkerConfig;
use events::EventLog;
use evidence::EvidenceStore;
use memory::SessionMemory;
use queue::RunQueue;
use storage::runs::RunStore;
use strategy::Resolver;
use worker::executor::ExecutorSettings;
use worker::processor::JobProcessor;
use worker::recovery::RecoverySweeper;
use worker::retry::RetryPolicy;
use worker::{LoopSettings, WorkerStats};

/// Run the worker against a remote WebDriver endpoint until `shutdown`.
pub async fn run_worker(config: WorkerConfig, shutdown: CancellationToken) -> Result<WorkerStats> {
    let drivers = WebDriverFactory::new(
        &config.browser.webdriver_url,
        config.browser.headless,
        Duration::from_secs(config.browser.step_timeout_secs),
    )
    .context("failed to set up the WebDriver client")?;
    run_worker_with(config, Arc::new(drivers), shutdown).await
}

/// Run the worker with the given browser factory until `shutdown`.
pub async fn run_worker_with(
    config: WorkerConfig,
    drivers: Arc<dyn DriverFactory>,
    shutdown: CancellationToken,
) -> Result<WorkerStats> {
    let consumer = config.consumer_name();
    tracing::info!(
        %consumer,
        queue = config.queue_path(),
        database = config.database_path(),
        stream = %config.queue.stream,
        group = %config.queue.group,
        "Starting healrun worker"
    );

    // 1. Storage
    let queue_pool = storage::open_queue_pool(config.queue_path())
        .with_context(|| format!("failed to open queue store {}", config.queue_path()))?;
    let db_pool = storage::open_pool(config.database_path())
        .with_context(|| format!("failed to open run store {}", config.database_path()))?;

    // 2. Queue consumer group; without it nothing can be consumed
    let queue = RunQueue::new(queue_pool.clone(), config.queue_settings());
    queue
        .ensure_group()
        .await
        .context("failed to establish the consumer group")?;

    let store = RunStore::new(db_pool.clone());
    let events = EventLog::new(queue_pool);
    let resolver = Resolver::new(
        SessionMemory::new(db_pool, config.reliability_policy()),
        config.resolver_settings(),
    );
    let evidence = config
        .browser
        .capture_screenshots
        .then(|| EvidenceStore::new(&config.browser.evidence_dir));
    let retry = RetryPolicy {
        attempts: config.worker.retry_attempts,
        base_delay: Duration::from_millis(config.worker.retry_base_delay_ms),
    };

    let processor = JobProcessor::new(
        store.clone(),
        events.clone(),
        queue.clone(),
        resolver,
        drivers,
        evidence,
        retry,
        ExecutorSettings {
            step_timeout: Duration::from_secs(config.browser.step_timeout_secs),
            run_timeout: Duration::from_secs(config.browser.run_timeout_secs),
            capture_screenshots: config.browser.capture_screenshots,
        },
        Duration::from_secs(config.worker.heartbeat_secs),
    );

    // 3. Recovery sweeper (background task)
    let sweeper = RecoverySweeper::new(
        store,
        events,
        config.stuck_run_timeout(),
        config.recovery_interval(),
    );
    let sweeper_stop = CancellationToken::new();
    let sweeper_task = tokio::spawn(sweeper.run(sweeper_stop.clone()));

    // 4. Consume loop; returns once shutdown fires and the in-flight run is done
    let loop_settings = LoopSettings {
        idle_log_every: Duration::from_secs(config.worker.idle_log_secs),
        health_log_every: Duration::from_secs(config.worker.health_log_secs),
        error_backoff: retry.base_delay,
    };
    let stats =
        worker::run_worker_loop(&consumer, &queue, &processor, &loop_settings, &shutdown).await;

    sweeper_stop.cancel();
    if let Err(e) = sweeper_task.await {
        tracing::error!(error = %e, "recovery sweeper task failed");
    }

    tracing::info!(
        %consumer,
        processed = stats.jobs_processed,
        failed = stats.runs_failed,
        "healrun worker stopped"
    );
    Ok(stats)
}
