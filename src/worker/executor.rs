//! Step-by-step execution of one run against an open page.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::browser::{DriverError, ElementAction, PageDriver};
use crate::events::{EventLog, RunEvent};
use crate::evidence::EvidenceStore;
use crate::storage::runs::{
    FailureKind, RunStore, StepAction, StepResult, StepStatus, StepUsage, Test, TestStep,
};
use crate::storage::StoreError;
use crate::strategy::{Intent, ResolveError, Resolver, StrategyTier};

use super::retry::RetryPolicy;

pub const TOTAL_TIMEOUT_MESSAGE: &str = "Total test timeout exceeded";

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub step_timeout: Duration,
    pub run_timeout: Duration,
    pub capture_screenshots: bool,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(60),
            run_timeout: Duration::from_secs(300),
            capture_screenshots: true,
        }
    }
}

/// How the steps of a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunVerdict {
    Passed {
        steps: usize,
        self_healed: bool,
    },
    Failed {
        error: String,
        kind: FailureKind,
        step: Option<usize>,
    },
    /// The run stopped being `running` underneath us; nothing more to write.
    Superseded,
}

/// Outcome of a single step before it is persisted.
#[derive(Debug, Clone, Default)]
struct StepOutcome {
    strategy: Option<StrategyTier>,
    self_healed: bool,
    attempts: u32,
    usage: StepUsage,
    failure: Option<(String, FailureKind)>,
}

impl StepOutcome {
    fn direct() -> Self {
        Self {
            strategy: Some(StrategyTier::Direct),
            attempts: 1,
            ..Self::default()
        }
    }

    fn failed(error: impl Into<String>, kind: FailureKind) -> Self {
        Self {
            failure: Some((error.into(), kind)),
            ..Self::default()
        }
    }

    fn browser_lost(e: DriverError) -> Self {
        Self::failed(format!("Browser failure: {e}"), FailureKind::Infrastructure)
    }

    fn is_infrastructure(&self) -> bool {
        matches!(self.failure, Some((_, FailureKind::Infrastructure)))
    }
}

pub struct RunExecutor<'a> {
    pub store: &'a RunStore,
    pub events: &'a EventLog,
    pub resolver: &'a Resolver,
    pub evidence: Option<&'a EvidenceStore>,
    pub retry: RetryPolicy,
    pub settings: &'a ExecutorSettings,
}

impl RunExecutor<'_> {
    /// Execute `steps` in order, persisting one result per step, and stop at
    /// the first failure.
    pub async fn execute(
        &self,
        driver: &mut dyn PageDriver,
        run_id: Uuid,
        test: &Test,
        steps: &[TestStep],
    ) -> Result<RunVerdict, StoreError> {
        let deadline = Instant::now() + self.settings.run_timeout;
        let mut healed = false;

        for (index, step) in steps.iter().enumerate() {
            let started = Instant::now();
            self.emit(
                run_id,
                RunEvent::StepStarted {
                    step: index,
                    instruction: step.instruction.clone(),
                },
            )
            .await?;

            let remaining = deadline.saturating_duration_since(started);
            let outcome = if remaining.is_zero() {
                StepOutcome::failed(TOTAL_TIMEOUT_MESSAGE, FailureKind::StepTimeout)
            } else {
                let budget = remaining.min(self.settings.step_timeout);
                match tokio::time::timeout(budget, self.perform(driver, test, step)).await {
                    Ok(outcome) => outcome,
                    Err(_) if budget < self.settings.step_timeout => {
                        StepOutcome::failed(TOTAL_TIMEOUT_MESSAGE, FailureKind::StepTimeout)
                    }
                    Err(_) => StepOutcome::failed(
                        format!("Step timed out after {:?}", self.settings.step_timeout),
                        FailureKind::StepTimeout,
                    ),
                }
            };

            let evidence = if outcome.is_infrastructure() {
                None
            } else {
                self.capture(driver, run_id, index).await
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            let result = StepResult {
                step: index,
                instruction: step.instruction.clone(),
                action: step.action,
                status: if outcome.failure.is_some() {
                    StepStatus::Failed
                } else {
                    StepStatus::Passed
                },
                strategy: outcome.strategy,
                self_healed: outcome.self_healed,
                attempts: outcome.attempts,
                duration_ms,
                evidence: evidence.clone(),
                error: outcome.failure.as_ref().map(|(e, _)| e.clone()),
            };
            let appended = self
                .retry
                .run("append step result", || {
                    self.store.append_step(run_id, result.clone(), outcome.usage)
                })
                .await?;
            if !appended {
                warn!(%run_id, step = index, "run no longer running, stopping execution");
                return Ok(RunVerdict::Superseded);
            }

            match outcome.failure {
                Some((error, kind)) => {
                    info!(%run_id, step = index, %error, kind = kind.as_str(), "step failed");
                    self.emit(
                        run_id,
                        RunEvent::StepFailed {
                            step: index,
                            error: error.clone(),
                            duration_ms,
                        },
                    )
                    .await?;
                    return Ok(RunVerdict::Failed {
                        error,
                        kind,
                        step: Some(index),
                    });
                }
                None => {
                    healed |= outcome.self_healed;
                    debug!(
                        %run_id,
                        step = index,
                        strategy = ?outcome.strategy,
                        duration_ms,
                        "step passed"
                    );
                    self.emit(
                        run_id,
                        RunEvent::StepCompleted {
                            step: index,
                            strategy: outcome.strategy.unwrap_or(StrategyTier::Direct),
                            self_healed: outcome.self_healed,
                            duration_ms,
                            evidence,
                        },
                    )
                    .await?;
                }
            }
        }

        Ok(RunVerdict::Passed {
            steps: steps.len(),
            self_healed: healed,
        })
    }

    async fn emit(&self, run_id: Uuid, event: RunEvent) -> Result<i64, StoreError> {
        self.retry
            .run("emit event", || self.events.emit(run_id, &event))
            .await
    }

    /// Screenshot evidence is best-effort; a missing image never fails a step.
    async fn capture(
        &self,
        driver: &mut dyn PageDriver,
        run_id: Uuid,
        step: usize,
    ) -> Option<String> {
        if !self.settings.capture_screenshots {
            return None;
        }
        let store = self.evidence?;
        let png = match driver.screenshot().await {
            Ok(png) => png,
            Err(e) => {
                warn!(%run_id, step, error = %e, "screenshot failed");
                return None;
            }
        };
        match store.save_step(run_id, step, &png).await {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(%run_id, step, error = %e, "could not write evidence");
                None
            }
        }
    }

    async fn perform(
        &self,
        driver: &mut dyn PageDriver,
        test: &Test,
        step: &TestStep,
    ) -> StepOutcome {
        if test.auto_handle_popups {
            match driver.dismiss_popups().await {
                Ok(_) => {}
                Err(e) if e.is_infrastructure() => return StepOutcome::browser_lost(e),
                Err(e) => debug!(error = %e, "popup dismissal skipped"),
            }
        }

        match step.action {
            StepAction::Navigate => navigate(driver, test, step).await,
            StepAction::Verify => verify(driver, step).await,
            StepAction::Click => self.interact(driver, step, ElementAction::Click).await,
            StepAction::Fill => {
                let value = step.value.clone().unwrap_or_default();
                self.interact(driver, step, ElementAction::Fill(value)).await
            }
        }
    }

    async fn interact(
        &self,
        driver: &mut dyn PageDriver,
        step: &TestStep,
        action: ElementAction,
    ) -> StepOutcome {
        let intent = Intent::parse(&step.instruction, step.selector.as_deref());
        let resolution = match self.resolver.resolve(driver, &intent, &action).await {
            Ok(resolution) => resolution,
            Err(ResolveError::Driver(e)) if e.is_infrastructure() => {
                return StepOutcome::browser_lost(e)
            }
            Err(ResolveError::Driver(e)) => {
                return StepOutcome::failed(
                    format!("Could not {} '{}': {e}", action.kind(), step.instruction),
                    FailureKind::Step,
                )
            }
            Err(ResolveError::Store(e)) => {
                return StepOutcome::failed(
                    format!("Session memory unavailable: {e}"),
                    FailureKind::Infrastructure,
                )
            }
        };

        let usage = StepUsage {
            strategy_invocations: resolution.strategy_invocations,
            cost_usd: resolution.cost_usd,
        };
        let failure = if resolution.resolved() {
            None
        } else {
            let mut error = format!("Could not {} '{}'", action.kind(), step.instruction);
            if let Some(last) = resolution.errors.last() {
                error.push_str(&format!(": {last}"));
            }
            Some((error, FailureKind::Step))
        };

        StepOutcome {
            strategy: resolution.tier,
            self_healed: resolution.self_healed,
            attempts: resolution.attempts,
            usage,
            failure,
        }
    }
}

async fn navigate(driver: &mut dyn PageDriver, test: &Test, step: &TestStep) -> StepOutcome {
    let target = step
        .target
        .as_deref()
        .filter(|t| !t.trim().is_empty())
        .unwrap_or(test.url.as_str());
    if target.trim().is_empty() {
        return StepOutcome::failed("navigate requires 'target' or test url", FailureKind::Step);
    }

    match driver.navigate(target).await {
        Ok(()) => StepOutcome::direct(),
        Err(e) if e.is_infrastructure() => StepOutcome::browser_lost(e),
        Err(e) => StepOutcome {
            attempts: 1,
            ..StepOutcome::failed(format!("Navigation to {target} failed: {e}"), FailureKind::Step)
        },
    }
}

async fn verify(driver: &mut dyn PageDriver, step: &TestStep) -> StepOutcome {
    let expected = step.expected.as_deref().unwrap_or_default();
    let content = match driver.page_content().await {
        Ok(content) => content,
        Err(e) if e.is_infrastructure() => return StepOutcome::browser_lost(e),
        Err(e) => {
            return StepOutcome::failed(format!("Could not read page: {e}"), FailureKind::Step)
        }
    };

    if content.contains(expected) {
        StepOutcome::direct()
    } else {
        let shown: String = expected.chars().take(50).collect();
        StepOutcome {
            attempts: 1,
            ..StepOutcome::failed(
                format!("Expected text '{shown}' not found in page"),
                FailureKind::Step,
            )
        }
    }
}
