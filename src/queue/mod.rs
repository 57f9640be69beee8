//! Durable run queue with consumer-group semantics, stored in SQLite.
//!
//! Each stream keeps an append-only list of entries. A consumer group tracks
//! the last entry it handed out and a pending list of delivered-but-unacked
//! entries, each attributed to one consumer and stamped with a delivery token.
//! Pending entries idle longer than the reclaim timeout are handed to the next
//! consumer that asks, which is how a crashed worker's job finds a new owner.

use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use uuid::Uuid;

use crate::storage::{blocking, now_timestamp, timestamp, Pool, StoreError};

pub const RUNS_STREAM: &str = "runs:queue";
pub const DEFAULT_GROUP: &str = "run-workers";

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue storage error: {0}")]
    Store(#[from] StoreError),

    #[error("consumer group '{group}' on '{stream}' is not available")]
    GroupMissing { stream: String, group: String },
}

impl QueueError {
    pub fn is_transient(&self) -> bool {
        match self {
            QueueError::Store(e) => e.is_transient(),
            QueueError::GroupMissing { .. } => false,
        }
    }
}

impl From<rusqlite::Error> for QueueError {
    fn from(e: rusqlite::Error) -> Self {
        QueueError::Store(e.into())
    }
}

pub type QueueResult<T> = std::result::Result<T, QueueError>;

/// Payload of a queue entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobMessage {
    Run { run_id: Uuid, test_id: Uuid },
}

impl JobMessage {
    pub fn run_id(&self) -> Uuid {
        match self {
            JobMessage::Run { run_id, .. } => *run_id,
        }
    }

    pub fn test_id(&self) -> Uuid {
        match self {
            JobMessage::Run { test_id, .. } => *test_id,
        }
    }
}

/// A claimed job. Valid until acked, abandoned, or reclaimed elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub entry_id: i64,
    pub message: JobMessage,
    /// How many times this entry has been handed out, this one included.
    pub delivery_count: i64,
    token: String,
}

impl JobHandle {
    pub fn run_id(&self) -> Uuid {
        self.message.run_id()
    }
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub stream: String,
    pub group: String,
    /// Longest a single `claim` call waits for work.
    pub claim_block: Duration,
    pub poll_interval: Duration,
    /// Pending entries idle longer than this may be taken over.
    pub reclaim_idle: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            stream: RUNS_STREAM.to_string(),
            group: DEFAULT_GROUP.to_string(),
            claim_block: Duration::from_millis(5_000),
            poll_interval: Duration::from_millis(250),
            reclaim_idle: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Entries no consumer in the group has seen yet.
    pub undelivered: i64,
    /// Delivered but not acknowledged.
    pub pending: i64,
    pub dead_letters: i64,
}

#[derive(Clone)]
pub struct RunQueue {
    pool: Pool,
    settings: QueueSettings,
}

impl RunQueue {
    pub fn new(pool: Pool, settings: QueueSettings) -> Self {
        Self { pool, settings }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Create the consumer group if absent, starting from the beginning of
    /// the stream, and confirm it is readable.
    pub async fn ensure_group(&self) -> QueueResult<()> {
        let stream = self.settings.stream.clone();
        let group = self.settings.group.clone();
        let exists = blocking(&self.pool, move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO queue_groups (stream, group_name, last_delivered_id, created_at)
                 VALUES (?1, ?2, 0, ?3)",
                params![stream, group, now_timestamp()],
            )?;
            let found: Option<i64> = conn
                .query_row(
                    "SELECT last_delivered_id FROM queue_groups WHERE stream = ?1 AND group_name = ?2",
                    params![stream, group],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await?;

        if exists {
            Ok(())
        } else {
            Err(self.group_missing())
        }
    }

    fn group_missing(&self) -> QueueError {
        QueueError::GroupMissing {
            stream: self.settings.stream.clone(),
            group: self.settings.group.clone(),
        }
    }

    pub async fn enqueue(&self, message: &JobMessage) -> QueueResult<i64> {
        let payload = serde_json::to_string(message).map_err(StoreError::from)?;
        self.enqueue_raw(payload).await
    }

    /// Append an arbitrary payload. Payloads are validated on claim.
    pub async fn enqueue_raw(&self, payload: String) -> QueueResult<i64> {
        let stream = self.settings.stream.clone();
        Ok(blocking(&self.pool, move |conn| {
            conn.execute(
                "INSERT INTO queue_entries (stream, payload_json, created_at) VALUES (?1, ?2, ?3)",
                params![stream, payload, now_timestamp()],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await?)
    }

    /// Wait up to `claim_block` for a job. Returns `None` on timeout or
    /// when `shutdown` fires.
    pub async fn claim(
        &self,
        consumer: &str,
        shutdown: &CancellationToken,
    ) -> QueueResult<Option<JobHandle>> {
        let deadline = tokio::time::Instant::now() + self.settings.claim_block;
        loop {
            if shutdown.is_cancelled() {
                return Ok(None);
            }
            if let Some(handle) = self.try_claim(consumer).await? {
                return Ok(Some(handle));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let wait = self.settings.poll_interval.min(deadline - now);
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(None),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// One non-blocking claim attempt: idle or abandoned pending entries
    /// first, then the next undelivered entry.
    pub async fn try_claim(&self, consumer: &str) -> QueueResult<Option<JobHandle>> {
        let settings = self.settings.clone();
        let consumer = consumer.to_string();
        let idle = chrono::Duration::from_std(settings.reclaim_idle)
            .unwrap_or_else(|_| chrono::Duration::seconds(600));

        let outcome = blocking(&self.pool, move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let idle_cutoff = timestamp(Utc::now() - idle);
            let outcome = loop {
                let delivery = match reclaim_pending(&tx, &settings, &consumer, &idle_cutoff)? {
                    Some(delivery) => delivery,
                    None => match next_undelivered(&tx, &settings, &consumer)? {
                        Some(delivery) => delivery,
                        None => break ClaimOutcome::Empty,
                    },
                };

                let Delivery::Entry {
                    entry_id,
                    payload,
                    token,
                    delivery_count,
                } = delivery
                else {
                    break ClaimOutcome::GroupMissing;
                };

                match serde_json::from_str::<JobMessage>(&payload) {
                    Ok(message) => {
                        break ClaimOutcome::Claimed(JobHandle {
                            entry_id,
                            message,
                            delivery_count,
                            token,
                        })
                    }
                    Err(e) => {
                        error!(
                            entry_id,
                            error = %e,
                            "malformed queue payload moved to dead letters"
                        );
                        dead_letter(&tx, &settings, entry_id, &payload, &e.to_string())?;
                    }
                }
            };
            tx.commit()?;
            Ok(outcome)
        })
        .await?;

        match outcome {
            ClaimOutcome::Claimed(handle) => Ok(Some(handle)),
            ClaimOutcome::Empty => Ok(None),
            ClaimOutcome::GroupMissing => Err(self.group_missing()),
        }
    }

    /// Remove the job from the group's pending list. Returns false when the
    /// handle is stale (reclaimed by another consumer in the meantime).
    pub async fn ack(&self, handle: &JobHandle) -> QueueResult<bool> {
        let settings = self.settings.clone();
        let entry_id = handle.entry_id;
        let token = handle.token.clone();

        Ok(blocking(&self.pool, move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let removed = tx.execute(
                "DELETE FROM queue_pending
                 WHERE stream = ?1 AND group_name = ?2 AND entry_id = ?3 AND delivery_token = ?4",
                params![settings.stream, settings.group, entry_id, token],
            )?;
            prune_entry(&tx, &settings.stream, entry_id)?;
            tx.commit()?;
            Ok(removed == 1)
        })
        .await?)
    }

    /// Return the job to the group for immediate re-claim without counting
    /// an extra delivery.
    pub async fn abandon(&self, handle: &JobHandle) -> QueueResult<bool> {
        let settings = self.settings.clone();
        let entry_id = handle.entry_id;
        let token = handle.token.clone();

        Ok(blocking(&self.pool, move |conn| {
            let changed = conn.execute(
                "UPDATE queue_pending SET consumer = NULL, delivered_at = NULL
                 WHERE stream = ?1 AND group_name = ?2 AND entry_id = ?3 AND delivery_token = ?4",
                params![settings.stream, settings.group, entry_id, token],
            )?;
            Ok(changed == 1)
        })
        .await?)
    }

    pub async fn stats(&self) -> QueueResult<QueueStats> {
        let settings = self.settings.clone();
        Ok(blocking(&self.pool, move |conn| {
            let last: i64 = conn
                .query_row(
                    "SELECT last_delivered_id FROM queue_groups WHERE stream = ?1 AND group_name = ?2",
                    params![settings.stream, settings.group],
                    |row| row.get(0),
                )
                .optional()?
                .unwrap_or(0);
            let undelivered: i64 = conn.query_row(
                "SELECT COUNT(*) FROM queue_entries WHERE stream = ?1 AND id > ?2",
                params![settings.stream, last],
                |row| row.get(0),
            )?;
            let pending: i64 = conn.query_row(
                "SELECT COUNT(*) FROM queue_pending WHERE stream = ?1 AND group_name = ?2",
                params![settings.stream, settings.group],
                |row| row.get(0),
            )?;
            let dead_letters: i64 = conn.query_row(
                "SELECT COUNT(*) FROM queue_dead_letters WHERE stream = ?1 AND group_name = ?2",
                params![settings.stream, settings.group],
                |row| row.get(0),
            )?;
            Ok(QueueStats {
                undelivered,
                pending,
                dead_letters,
            })
        })
        .await?)
    }
}

enum Delivery {
    /// The group row is gone; the queue cannot be consumed.
    Missing,
    Entry {
        entry_id: i64,
        payload: String,
        token: String,
        delivery_count: i64,
    },
}

enum ClaimOutcome {
    Claimed(JobHandle),
    Empty,
    GroupMissing,
}

fn new_token() -> String {
    Uuid::new_v4().simple().to_string()
}

fn reclaim_pending(
    tx: &Transaction<'_>,
    settings: &QueueSettings,
    consumer: &str,
    idle_cutoff: &str,
) -> Result<Option<Delivery>, StoreError> {
    let stale = tx
        .query_row(
            "SELECT p.entry_id, p.consumer, e.payload_json FROM queue_pending p
             LEFT JOIN queue_entries e ON e.id = p.entry_id
             WHERE p.stream = ?1 AND p.group_name = ?2
               AND (p.consumer IS NULL OR p.delivered_at < ?3)
             ORDER BY p.entry_id LIMIT 1",
            params![settings.stream, settings.group, idle_cutoff],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            },
        )
        .optional()?;

    let Some((entry_id, previous, payload)) = stale else {
        return Ok(None);
    };

    let Some(payload) = payload else {
        // Entry vanished underneath its pending record; nothing to deliver.
        tx.execute(
            "DELETE FROM queue_pending WHERE stream = ?1 AND group_name = ?2 AND entry_id = ?3",
            params![settings.stream, settings.group, entry_id],
        )?;
        return reclaim_pending(tx, settings, consumer, idle_cutoff);
    };

    if let Some(previous) = &previous {
        warn!(entry_id, %previous, %consumer, "reclaiming idle pending job");
    }

    let token = new_token();
    tx.execute(
        "UPDATE queue_pending SET
            consumer = ?1, delivery_token = ?2, delivered_at = ?3,
            delivery_count = delivery_count + CASE WHEN consumer IS NULL THEN 0 ELSE 1 END
         WHERE stream = ?4 AND group_name = ?5 AND entry_id = ?6",
        params![consumer, token, now_timestamp(), settings.stream, settings.group, entry_id],
    )?;
    let delivery_count: i64 = tx.query_row(
        "SELECT delivery_count FROM queue_pending WHERE stream = ?1 AND group_name = ?2 AND entry_id = ?3",
        params![settings.stream, settings.group, entry_id],
        |row| row.get(0),
    )?;

    Ok(Some(Delivery::Entry {
        entry_id,
        payload,
        token,
        delivery_count,
    }))
}

fn next_undelivered(
    tx: &Transaction<'_>,
    settings: &QueueSettings,
    consumer: &str,
) -> Result<Option<Delivery>, StoreError> {
    let last: Option<i64> = tx
        .query_row(
            "SELECT last_delivered_id FROM queue_groups WHERE stream = ?1 AND group_name = ?2",
            params![settings.stream, settings.group],
            |row| row.get(0),
        )
        .optional()?;
    let Some(last) = last else {
        return Ok(Some(Delivery::Missing));
    };

    let next = tx
        .query_row(
            "SELECT id, payload_json FROM queue_entries WHERE stream = ?1 AND id > ?2 ORDER BY id LIMIT 1",
            params![settings.stream, last],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?;
    let Some((entry_id, payload)) = next else {
        return Ok(None);
    };

    let token = new_token();
    tx.execute(
        "INSERT INTO queue_pending
            (stream, group_name, entry_id, consumer, delivery_token, delivered_at, delivery_count)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)",
        params![settings.stream, settings.group, entry_id, consumer, token, now_timestamp()],
    )?;
    tx.execute(
        "UPDATE queue_groups SET last_delivered_id = ?1 WHERE stream = ?2 AND group_name = ?3",
        params![entry_id, settings.stream, settings.group],
    )?;

    Ok(Some(Delivery::Entry {
        entry_id,
        payload,
        token,
        delivery_count: 1,
    }))
}

fn dead_letter(
    tx: &Transaction<'_>,
    settings: &QueueSettings,
    entry_id: i64,
    payload: &str,
    reason: &str,
) -> Result<(), StoreError> {
    tx.execute(
        "INSERT INTO queue_dead_letters (stream, group_name, entry_id, payload_json, reason, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![settings.stream, settings.group, entry_id, payload, reason, now_timestamp()],
    )?;
    tx.execute(
        "DELETE FROM queue_pending WHERE stream = ?1 AND group_name = ?2 AND entry_id = ?3",
        params![settings.stream, settings.group, entry_id],
    )?;
    prune_entry(tx, &settings.stream, entry_id)
}

/// Drop an entry once no group can still deliver it.
fn prune_entry(tx: &Transaction<'_>, stream: &str, entry_id: i64) -> Result<(), StoreError> {
    tx.execute(
        "DELETE FROM queue_entries WHERE id = ?1
           AND NOT EXISTS (SELECT 1 FROM queue_pending WHERE stream = ?2 AND entry_id = ?1)
           AND NOT EXISTS (SELECT 1 FROM queue_groups WHERE stream = ?2 AND last_delivered_id < ?1)",
        params![entry_id, stream],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_queue_pool;

    async fn queue_with(settings: QueueSettings) -> (tempfile::TempDir, RunQueue) {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_queue_pool(dir.path().join("queue.db").to_str().unwrap()).unwrap();
        let queue = RunQueue::new(pool, settings);
        queue.ensure_group().await.unwrap();
        (dir, queue)
    }

    async fn queue() -> (tempfile::TempDir, RunQueue) {
        queue_with(QueueSettings {
            claim_block: Duration::from_millis(50),
            poll_interval: Duration::from_millis(10),
            ..QueueSettings::default()
        })
        .await
    }

    fn job() -> JobMessage {
        JobMessage::Run {
            run_id: Uuid::new_v4(),
            test_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn test_message_wire_shape() {
        let run_id = Uuid::nil();
        let msg = JobMessage::Run { run_id, test_id: run_id };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["kind"], "run");
        assert_eq!(json["run_id"], run_id.to_string());
    }

    #[tokio::test]
    async fn test_claim_ack_in_order() {
        let (_dir, queue) = queue().await;
        let first = job();
        let second = job();
        queue.enqueue(&first).await.unwrap();
        queue.enqueue(&second).await.unwrap();

        let cancel = CancellationToken::new();
        let a = queue.claim("worker-a", &cancel).await.unwrap().unwrap();
        let b = queue.claim("worker-a", &cancel).await.unwrap().unwrap();
        assert_eq!(a.message, first);
        assert_eq!(b.message, second);
        assert_eq!(a.delivery_count, 1);

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.undelivered, 0);
        assert_eq!(stats.pending, 2);

        assert!(queue.ack(&a).await.unwrap());
        assert!(!queue.ack(&a).await.unwrap(), "second ack is a no-op");
        assert!(queue.ack(&b).await.unwrap());
        assert_eq!(queue.stats().await.unwrap().pending, 0);
    }

    #[tokio::test]
    async fn test_each_entry_goes_to_one_consumer() {
        let (_dir, queue) = queue().await;
        queue.enqueue(&job()).await.unwrap();

        assert!(queue.try_claim("worker-a").await.unwrap().is_some());
        assert!(queue.try_claim("worker-b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_idle_pending_is_reclaimed() {
        let (_dir, queue) = queue_with(QueueSettings {
            reclaim_idle: Duration::ZERO,
            ..QueueSettings::default()
        })
        .await;
        let message = job();
        queue.enqueue(&message).await.unwrap();

        let crashed = queue.try_claim("worker-a").await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let taken = queue.try_claim("worker-b").await.unwrap().unwrap();
        assert_eq!(taken.message, message);
        assert_eq!(taken.delivery_count, 2);

        // The original consumer's handle is stale now.
        assert!(!queue.ack(&crashed).await.unwrap());
        assert!(queue.ack(&taken).await.unwrap());
    }

    #[tokio::test]
    async fn test_abandoned_job_is_redelivered_without_counting() {
        let (_dir, queue) = queue().await;
        queue.enqueue(&job()).await.unwrap();

        let handle = queue.try_claim("worker-a").await.unwrap().unwrap();
        assert!(queue.abandon(&handle).await.unwrap());

        let again = queue.try_claim("worker-b").await.unwrap().unwrap();
        assert_eq!(again.entry_id, handle.entry_id);
        assert_eq!(again.delivery_count, 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dead_lettered() {
        let (_dir, queue) = queue().await;
        queue.enqueue_raw("{\"kind\":\"nope\"}".into()).await.unwrap();
        let good = job();
        queue.enqueue(&good).await.unwrap();

        let handle = queue.try_claim("worker-a").await.unwrap().unwrap();
        assert_eq!(handle.message, good);

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.dead_letters, 1);
        assert_eq!(stats.pending, 1);
    }

    #[tokio::test]
    async fn test_dead_lettered_entry_leaves_the_stream() {
        let (_dir, queue) = queue().await;
        queue.enqueue_raw("not json".into()).await.unwrap();
        assert!(queue.try_claim("worker-a").await.unwrap().is_none());

        let conn = queue.pool.get().unwrap();
        let entries: i64 = conn
            .query_row("SELECT COUNT(*) FROM queue_entries", [], |row| row.get(0))
            .unwrap();
        assert_eq!(entries, 0);
        let kept: String = conn
            .query_row("SELECT payload_json FROM queue_dead_letters", [], |row| row.get(0))
            .unwrap();
        assert_eq!(kept, "not json");

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.dead_letters, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.undelivered, 0);
    }

    #[tokio::test]
    async fn test_claim_times_out_and_honours_shutdown() {
        let (_dir, queue) = queue().await;
        let cancel = CancellationToken::new();
        assert!(queue.claim("worker-a", &cancel).await.unwrap().is_none());

        let (_dir, queue) = queue_with(QueueSettings {
            claim_block: Duration::from_secs(30),
            ..QueueSettings::default()
        })
        .await;
        cancel.cancel();
        let started = std::time::Instant::now();
        assert!(queue.claim("worker-a", &cancel).await.unwrap().is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_ensure_group_is_idempotent() {
        let (_dir, queue) = queue().await;
        queue.ensure_group().await.unwrap();
        queue.ensure_group().await.unwrap();
    }

    #[tokio::test]
    async fn test_claim_without_group_fails() {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_queue_pool(dir.path().join("queue.db").to_str().unwrap()).unwrap();
        let queue = RunQueue::new(pool, QueueSettings::default());
        let err = queue.try_claim("worker-a").await.unwrap_err();
        assert!(matches!(err, QueueError::GroupMissing { .. }));
        assert!(!err.is_transient());
    }
}
