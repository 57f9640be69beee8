//! Per-run progress event log.
//!
//! Events are appended with a per-run sequence number so external readers
//! (the live-update relay) can resume from the last sequence they saw.

use rusqlite::{params, TransactionBehavior};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::runs::FailureKind;
use crate::storage::{blocking, now_timestamp, parse_timestamp, Pool, StoreResult};
use crate::strategy::StrategyTier;

/// Closed set of events a run can emit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    StepStarted {
        step: usize,
        instruction: String,
    },
    StepCompleted {
        step: usize,
        strategy: StrategyTier,
        self_healed: bool,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        evidence: Option<String>,
    },
    StepFailed {
        step: usize,
        error: String,
        duration_ms: u64,
    },
    RunCompleted {
        duration_ms: i64,
        steps_completed: usize,
        self_healed: bool,
    },
    RunFailed {
        error: String,
        kind: FailureKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error_step: Option<usize>,
    },
}

impl RunEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            RunEvent::StepStarted { .. } => "step_started",
            RunEvent::StepCompleted { .. } => "step_completed",
            RunEvent::StepFailed { .. } => "step_failed",
            RunEvent::RunCompleted { .. } => "run_completed",
            RunEvent::RunFailed { .. } => "run_failed",
        }
    }
}

/// An event as stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredEvent {
    pub run_id: Uuid,
    pub seq: i64,
    pub event: RunEvent,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Append-only event sink shared by the job processor and recovery sweeper.
#[derive(Clone)]
pub struct EventLog {
    pool: Pool,
}

impl EventLog {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Append an event; returns its sequence number within the run.
    pub async fn emit(&self, run_id: Uuid, event: &RunEvent) -> StoreResult<i64> {
        let kind = event.kind();
        let payload = serde_json::to_string(event)?;

        let seq = blocking(&self.pool, move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let seq: i64 = tx.query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM run_events WHERE run_id = ?1",
                params![run_id.to_string()],
                |row| row.get(0),
            )?;
            tx.execute(
                "INSERT INTO run_events (run_id, seq, kind, payload_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![run_id.to_string(), seq, kind, payload, now_timestamp()],
            )?;
            tx.commit()?;
            Ok(seq)
        })
        .await?;

        tracing::debug!(%run_id, seq, kind, "event emitted");
        Ok(seq)
    }

    /// Events after `after_seq`, oldest first.
    pub async fn read(
        &self,
        run_id: Uuid,
        after_seq: i64,
        limit: usize,
    ) -> StoreResult<Vec<StoredEvent>> {
        blocking(&self.pool, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT seq, payload_json, created_at FROM run_events
                 WHERE run_id = ?1 AND seq > ?2 ORDER BY seq LIMIT ?3",
            )?;
            let rows = stmt
                .query_map(params![run_id.to_string(), after_seq, limit as i64], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut events = Vec::with_capacity(rows.len());
            for (seq, payload, created_at) in rows {
                events.push(StoredEvent {
                    run_id,
                    seq,
                    event: serde_json::from_str(&payload)?,
                    created_at: parse_timestamp(&created_at).unwrap_or_else(chrono::Utc::now),
                });
            }
            Ok(events)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_queue_pool;

    fn log() -> (tempfile::TempDir, EventLog) {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_queue_pool(dir.path().join("events.db").to_str().unwrap()).unwrap();
        (dir, EventLog::new(pool))
    }

    #[test]
    fn test_event_wire_shape() {
        let event = RunEvent::RunFailed {
            error: "execution timeout".into(),
            kind: FailureKind::Timeout,
            error_step: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "run_failed",
                "error": "execution timeout",
                "kind": "timeout"
            })
        );
        assert_eq!(event.kind(), "run_failed");
    }

    #[tokio::test]
    async fn test_events_are_ordered_per_run() {
        let (_dir, log) = log();
        let run_a = Uuid::new_v4();
        let run_b = Uuid::new_v4();

        for step in 0..3 {
            let event = RunEvent::StepStarted {
                step,
                instruction: format!("step {step}"),
            };
            log.emit(run_a, &event).await.unwrap();
        }
        assert_eq!(
            log.emit(
                run_b,
                &RunEvent::RunCompleted {
                    duration_ms: 5,
                    steps_completed: 0,
                    self_healed: false
                }
            )
            .await
            .unwrap(),
            1
        );

        let events = log.read(run_a, 0, 100).await.unwrap();
        assert_eq!(events.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(
            events[2].event,
            RunEvent::StepStarted {
                step: 2,
                instruction: "step 2".into()
            }
        );

        let tail = log.read(run_a, 2, 100).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].seq, 3);
    }
}
