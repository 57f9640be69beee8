//! Drives one claimed job from `queued` to a terminal run status.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::browser::DriverFactory;
use crate::events::{EventLog, RunEvent};
use crate::evidence::EvidenceStore;
use crate::queue::{JobHandle, QueueError, RunQueue};
use crate::storage::runs::{FailureKind, RunOutcome, RunStatus, RunStore, Test};
use crate::storage::StoreError;
use crate::strategy::Resolver;

use super::executor::{ExecutorSettings, RunExecutor, RunVerdict};
use super::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("run store unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("queue unavailable: {0}")]
    Queue(#[from] QueueError),
}

/// Why a delivery was acknowledged without executing anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    RunMissing,
    AlreadyTerminal,
    /// Another consumer owns it, or owned it and died; recovery handles it.
    AlreadyRunning,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Passed,
    Failed(FailureKind),
    Skipped(SkipReason),
    /// The run was finalized by someone else while we executed it.
    Superseded,
}

pub struct JobProcessor {
    store: RunStore,
    events: EventLog,
    queue: RunQueue,
    resolver: Resolver,
    drivers: Arc<dyn DriverFactory>,
    evidence: Option<EvidenceStore>,
    retry: RetryPolicy,
    settings: ExecutorSettings,
    heartbeat_interval: Duration,
}

impl JobProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: RunStore,
        events: EventLog,
        queue: RunQueue,
        resolver: Resolver,
        drivers: Arc<dyn DriverFactory>,
        evidence: Option<EvidenceStore>,
        retry: RetryPolicy,
        settings: ExecutorSettings,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            store,
            events,
            queue,
            resolver,
            drivers,
            evidence,
            retry,
            settings,
            heartbeat_interval,
        }
    }

    /// Process and acknowledge one job. On error the job has been handed back
    /// to the queue for another attempt.
    pub async fn process(&self, handle: &JobHandle) -> Result<JobOutcome, ProcessError> {
        let outcome = match self.run_job(handle).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    run_id = %handle.run_id(),
                    error = %e,
                    "job failed before completion, abandoning"
                );
                if let Err(abandon_err) = self.queue.abandon(handle).await {
                    error!(
                        run_id = %handle.run_id(),
                        error = %abandon_err,
                        "could not abandon job"
                    );
                }
                return Err(e);
            }
        };

        let acked = self
            .retry
            .run("ack job", || self.queue.ack(handle))
            .await?;
        if !acked {
            warn!(
                run_id = %handle.run_id(),
                entry_id = handle.entry_id,
                "job was reclaimed by another consumer before ack"
            );
        }
        Ok(outcome)
    }

    async fn run_job(&self, handle: &JobHandle) -> Result<JobOutcome, ProcessError> {
        let run_id = handle.run_id();
        let run = self
            .retry
            .run("load run", || self.store.load_run(run_id))
            .await?;

        let Some(run) = run else {
            warn!(%run_id, "run not found, discarding job");
            return Ok(JobOutcome::Skipped(SkipReason::RunMissing));
        };
        if run.status.is_terminal() {
            info!(%run_id, status = %run.status, "run already finished, acknowledging redelivery");
            return Ok(JobOutcome::Skipped(SkipReason::AlreadyTerminal));
        }
        if run.status == RunStatus::Running {
            warn!(
                %run_id,
                delivery_count = handle.delivery_count,
                "run already running, leaving it to the recovery sweeper"
            );
            return Ok(JobOutcome::Skipped(SkipReason::AlreadyRunning));
        }

        if run.test_id != handle.message.test_id() {
            warn!(
                %run_id,
                queued = %handle.message.test_id(),
                stored = %run.test_id,
                "job test id differs from run record, using the run record"
            );
        }
        let test = self
            .retry
            .run("load test", || self.store.load_test(run.test_id))
            .await?;

        let started_at = Utc::now();
        let clock = Instant::now();
        let claimed = self
            .retry
            .run("mark run running", || self.store.mark_running(run_id, started_at))
            .await?;
        if !claimed {
            info!(%run_id, "run left queued before we could start it");
            return Ok(JobOutcome::Skipped(SkipReason::AlreadyRunning));
        }
        info!(%run_id, test_id = %run.test_id, delivery = handle.delivery_count, "run started");

        let verdict = {
            let _heartbeat = self.spawn_heartbeat(run_id);
            match self.execute(run_id, test.as_ref()).await {
                Ok(verdict) => verdict,
                Err(e) => {
                    error!(%run_id, error = %e, "storage failed during execution");
                    RunVerdict::Failed {
                        error: format!("Infrastructure error: {e}"),
                        kind: FailureKind::Infrastructure,
                        step: None,
                    }
                }
            }
        };

        let duration_ms = clock.elapsed().as_millis() as i64;
        self.complete(run_id, verdict, duration_ms).await
    }

    /// Validate the definition, open a browser, and run the steps.
    async fn execute(&self, run_id: Uuid, test: Option<&Test>) -> Result<RunVerdict, StoreError> {
        let Some(test) = test else {
            return Ok(definition_failure("Test not found", None));
        };
        let steps = match test.definition.validated_steps() {
            Ok(steps) if steps.is_empty() => {
                return Ok(definition_failure("No steps in test definition", None));
            }
            Ok(steps) => steps,
            Err(invalid) => return Ok(definition_failure(invalid.message, Some(invalid.index))),
        };

        let mut driver = match self.retry.run("open browser", || self.drivers.open()).await {
            Ok(driver) => driver,
            Err(e) => {
                return Ok(RunVerdict::Failed {
                    error: format!("Browser unavailable: {e}"),
                    kind: FailureKind::Infrastructure,
                    step: None,
                })
            }
        };

        let executor = RunExecutor {
            store: &self.store,
            events: &self.events,
            resolver: &self.resolver,
            evidence: self.evidence.as_ref(),
            retry: self.retry,
            settings: &self.settings,
        };
        let verdict = executor.execute(driver.as_mut(), run_id, test, &steps).await;

        if let Err(e) = driver.close().await {
            warn!(%run_id, error = %e, "browser did not close cleanly");
        }
        verdict
    }

    async fn complete(
        &self,
        run_id: Uuid,
        verdict: RunVerdict,
        duration_ms: i64,
    ) -> Result<JobOutcome, ProcessError> {
        let (outcome, event, result) = match verdict {
            RunVerdict::Superseded => return Ok(JobOutcome::Superseded),
            RunVerdict::Passed { steps, self_healed } => (
                RunOutcome::passed(duration_ms),
                RunEvent::RunCompleted {
                    duration_ms,
                    steps_completed: steps,
                    self_healed,
                },
                JobOutcome::Passed,
            ),
            RunVerdict::Failed { error, kind, step } => (
                RunOutcome::failed(error.clone(), kind, step, duration_ms),
                RunEvent::RunFailed {
                    error,
                    kind,
                    error_step: step,
                },
                JobOutcome::Failed(kind),
            ),
        };

        let finished = self
            .retry
            .run("finish run", || self.store.finish(run_id, outcome.clone()))
            .await?;
        if !finished {
            warn!(%run_id, "run was finalized elsewhere, keeping that result");
            return Ok(JobOutcome::Superseded);
        }

        match &result {
            JobOutcome::Failed(kind) => {
                info!(%run_id, duration_ms, kind = kind.as_str(), "run failed")
            }
            _ => info!(%run_id, duration_ms, "run passed"),
        }

        // The run record is already terminal; a lost event is logged, not retried via redelivery.
        if let Err(e) = self
            .retry
            .run("emit event", || self.events.emit(run_id, &event))
            .await
        {
            error!(%run_id, error = %e, kind = event.kind(), "could not record final event");
        }
        Ok(result)
    }

    /// Keep `heartbeat_at` fresh until the returned guard is dropped.
    fn spawn_heartbeat(&self, run_id: Uuid) -> DropGuard {
        let token = CancellationToken::new();
        let stop = token.clone();
        let store = self.store.clone();
        let every = self.heartbeat_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = interval.tick() => {
                        match store.heartbeat(run_id).await {
                            Ok(true) => debug!(%run_id, "run heartbeat"),
                            Ok(false) => break,
                            Err(e) => warn!(%run_id, error = %e, "heartbeat write failed"),
                        }
                    }
                }
            }
        });

        token.drop_guard()
    }
}

fn definition_failure(error: impl Into<String>, step: Option<usize>) -> RunVerdict {
    RunVerdict::Failed {
        error: error.into(),
        kind: FailureKind::Definition,
        step,
    }
}
