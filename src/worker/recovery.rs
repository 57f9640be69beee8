//! Recovery sweeper: fails runs whose worker stopped sending heartbeats.

use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::{EventLog, RunEvent};
use crate::storage::runs::{FailureKind, RunStore};
use crate::storage::StoreResult;

pub const EXECUTION_TIMEOUT_MESSAGE: &str = "execution timeout";

#[derive(Clone)]
pub struct RecoverySweeper {
    store: RunStore,
    events: EventLog,
    timeout: Duration,
    interval: Duration,
}

impl RecoverySweeper {
    pub fn new(store: RunStore, events: EventLog, timeout: Duration, interval: Duration) -> Self {
        Self {
            store,
            events,
            timeout,
            interval,
        }
    }

    /// One pass. Returns how many runs were failed.
    pub async fn sweep_once(&self) -> StoreResult<usize> {
        let timeout = chrono::Duration::from_std(self.timeout)
            .unwrap_or_else(|_| chrono::Duration::minutes(10));
        let cutoff = Utc::now() - timeout;
        let stale = self.store.stale_running(cutoff).await?;
        if stale.is_empty() {
            debug!("no stuck runs");
            return Ok(0);
        }

        let mut recovered = 0;
        for run_id in stale {
            // The run may have finished or heartbeated since the scan.
            if !self
                .store
                .fail_stale(run_id, cutoff, EXECUTION_TIMEOUT_MESSAGE)
                .await?
            {
                debug!(%run_id, "stale run changed before it could be failed");
                continue;
            }
            recovered += 1;
            warn!(%run_id, timeout_secs = self.timeout.as_secs(), "stuck run marked failed");

            let event = RunEvent::RunFailed {
                error: EXECUTION_TIMEOUT_MESSAGE.to_string(),
                kind: FailureKind::Timeout,
                error_step: None,
            };
            if let Err(e) = self.events.emit(run_id, &event).await {
                error!(%run_id, error = %e, "could not record recovery event");
            }
        }
        Ok(recovered)
    }

    /// Sweep every `interval` until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            timeout_secs = self.timeout.as_secs(),
            interval_secs = self.interval.as_secs(),
            "recovery sweeper started"
        );
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match self.sweep_once().await {
                        Ok(0) => {}
                        Ok(n) => info!(recovered = n, "recovery sweep complete"),
                        Err(e) => error!(error = %e, "recovery sweep failed"),
                    }
                }
            }
        }
        info!("recovery sweeper stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{open_pool, open_queue_pool};
    use crate::storage::runs::{RunStatus, Test, TestDefinition};
    use uuid::Uuid;

    async fn setup() -> (tempfile::TempDir, RunStore, EventLog, Uuid) {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(dir.path().join("runs.db").to_str().unwrap()).unwrap();
        let store = RunStore::new(pool.clone());
        let test = Test {
            id: Uuid::new_v4(),
            owner: "qa".into(),
            name: "checkout".into(),
            url: "https://shop.example.com".into(),
            definition: TestDefinition::default(),
            auto_handle_popups: false,
        };
        store.create_test(&test).await.unwrap();
        let events = open_queue_pool(dir.path().join("queue.db").to_str().unwrap()).unwrap();
        (dir, store, EventLog::new(events), test.id)
    }

    #[tokio::test]
    async fn test_stuck_run_is_failed_once() {
        let (_dir, store, events, test_id) = setup().await;
        let run_id = store.create_run(test_id).await.unwrap();
        let started = Utc::now() - chrono::Duration::minutes(15);
        assert!(store.mark_running(run_id, started).await.unwrap());

        let sweeper = RecoverySweeper::new(
            store.clone(),
            events.clone(),
            Duration::from_secs(600),
            Duration::from_secs(60),
        );
        assert_eq!(sweeper.sweep_once().await.unwrap(), 1);
        assert_eq!(sweeper.sweep_once().await.unwrap(), 0);

        let run = store.load_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("execution timeout"));
        assert_eq!(run.error_kind, Some(FailureKind::Timeout));
        assert!(run.completed_at.is_some());

        let log = events.read(run_id, 0, 10).await.unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(
            log[0].event,
            RunEvent::RunFailed {
                error: "execution timeout".into(),
                kind: FailureKind::Timeout,
                error_step: None,
            }
        );
    }

    #[tokio::test]
    async fn test_live_run_is_left_alone() {
        let (_dir, store, events, test_id) = setup().await;
        let run_id = store.create_run(test_id).await.unwrap();
        let started = Utc::now() - chrono::Duration::minutes(15);
        store.mark_running(run_id, started).await.unwrap();
        // A recent heartbeat means the worker is still alive.
        assert!(store.heartbeat(run_id).await.unwrap());

        let sweeper = RecoverySweeper::new(
            store.clone(),
            events,
            Duration::from_secs(600),
            Duration::from_secs(60),
        );
        assert_eq!(sweeper.sweep_once().await.unwrap(), 0);
        let run = store.load_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Running);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (_dir, store, events, _) = setup().await;
        let sweeper = RecoverySweeper::new(
            store,
            events,
            Duration::from_secs(600),
            Duration::from_millis(10),
        );
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(sweeper.run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
