//! The consume loop: claim, process, acknowledge, repeat until shutdown.

pub mod executor;
pub mod processor;
pub mod recovery;
pub mod retry;

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::queue::RunQueue;

use processor::{JobOutcome, JobProcessor};

/// Counters reported in the periodic health log.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkerStats {
    pub jobs_processed: u64,
    pub runs_passed: u64,
    pub runs_failed: u64,
    pub jobs_skipped: u64,
    /// Jobs handed back to the queue after an infrastructure error.
    pub jobs_abandoned: u64,
    total_job_time: Duration,
}

impl WorkerStats {
    pub fn record(&mut self, outcome: &JobOutcome, elapsed: Duration) {
        self.jobs_processed += 1;
        self.total_job_time += elapsed;
        match outcome {
            JobOutcome::Passed => self.runs_passed += 1,
            JobOutcome::Failed(_) => self.runs_failed += 1,
            JobOutcome::Skipped(_) | JobOutcome::Superseded => self.jobs_skipped += 1,
        }
    }

    pub fn record_abandoned(&mut self) {
        self.jobs_abandoned += 1;
    }

    pub fn average_job_ms(&self) -> u64 {
        if self.jobs_processed == 0 {
            return 0;
        }
        (self.total_job_time.as_millis() / self.jobs_processed as u128) as u64
    }
}

#[derive(Debug, Clone)]
pub struct LoopSettings {
    pub idle_log_every: Duration,
    pub health_log_every: Duration,
    /// Pause after a claim or processing error before claiming again.
    pub error_backoff: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            idle_log_every: Duration::from_secs(30),
            health_log_every: Duration::from_secs(300),
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// Run until `shutdown` fires. A job already claimed always runs to
/// completion; shutdown is only observed between jobs.
pub async fn run_worker_loop(
    consumer: &str,
    queue: &RunQueue,
    processor: &JobProcessor,
    settings: &LoopSettings,
    shutdown: &CancellationToken,
) -> WorkerStats {
    let started = Instant::now();
    let mut stats = WorkerStats::default();
    let mut last_activity = started;
    let mut last_health = started;

    info!(%consumer, "worker loop started");

    while !shutdown.is_cancelled() {
        match queue.claim(consumer, shutdown).await {
            Ok(Some(handle)) => {
                let job_started = Instant::now();
                info!(run_id = %handle.run_id(), entry_id = handle.entry_id, "job claimed");
                match processor.process(&handle).await {
                    Ok(outcome) => stats.record(&outcome, job_started.elapsed()),
                    Err(e) => {
                        stats.record_abandoned();
                        error!(run_id = %handle.run_id(), error = %e, "job abandoned");
                        pause(settings.error_backoff, shutdown).await;
                    }
                }
                last_activity = Instant::now();
            }
            Ok(None) => {
                if last_activity.elapsed() >= settings.idle_log_every {
                    info!(%consumer, "waiting for jobs");
                    last_activity = Instant::now();
                }
            }
            Err(e) => {
                error!(%consumer, error = %e, "claim failed");
                pause(settings.error_backoff, shutdown).await;
            }
        }

        if last_health.elapsed() >= settings.health_log_every {
            log_health(consumer, &stats, started.elapsed());
            last_health = Instant::now();
        }
    }

    info!(%consumer, processed = stats.jobs_processed, "worker loop stopped");
    stats
}

fn log_health(consumer: &str, stats: &WorkerStats, uptime: Duration) {
    info!(
        %consumer,
        uptime_secs = uptime.as_secs(),
        jobs_processed = stats.jobs_processed,
        runs_passed = stats.runs_passed,
        runs_failed = stats.runs_failed,
        jobs_skipped = stats.jobs_skipped,
        jobs_abandoned = stats.jobs_abandoned,
        avg_job_ms = stats.average_job_ms(),
        "worker health"
    );
}

async fn pause(delay: Duration, shutdown: &CancellationToken) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(delay) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::runs::FailureKind;
    use processor::SkipReason;

    #[test]
    fn test_stats_accumulate() {
        let mut stats = WorkerStats::default();
        stats.record(&JobOutcome::Passed, Duration::from_millis(100));
        stats.record(&JobOutcome::Failed(FailureKind::Step), Duration::from_millis(300));
        stats.record(
            &JobOutcome::Skipped(SkipReason::AlreadyTerminal),
            Duration::from_millis(2),
        );
        stats.record_abandoned();

        assert_eq!(stats.jobs_processed, 3);
        assert_eq!(stats.runs_passed, 1);
        assert_eq!(stats.runs_failed, 1);
        assert_eq!(stats.jobs_skipped, 1);
        assert_eq!(stats.jobs_abandoned, 1);
        assert_eq!(stats.average_job_ms(), 134);
    }

    #[test]
    fn test_average_with_no_jobs() {
        assert_eq!(WorkerStats::default().average_job_ms(), 0);
    }
}
