//! Session memory: learned instruction -> locator mappings with reliability.
//!
//! Entries are keyed by [`instruction_hash`]. All writes are single-statement
//! upserts so that concurrent workers merge counters instead of overwriting
//! each other.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::browser::Locator;
use crate::storage::{blocking, now_timestamp, parse_timestamp, Pool, StoreResult};

/// Page context that, together with the instruction, identifies an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageContext {
    pub url: String,
    /// Extra discriminator, e.g. the interaction kind (`click` vs `fill`).
    pub fingerprint: String,
}

impl PageContext {
    pub fn new(url: &str, fingerprint: &str) -> Self {
        Self {
            url: normalize_url(url),
            fingerprint: fingerprint.to_string(),
        }
    }
}

/// Lowercase, collapse whitespace and drop trailing punctuation.
pub fn normalize_instruction(instruction: &str) -> String {
    instruction
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
        .trim_end_matches(['.', '!', ';', ','])
        .to_string()
}

/// Strip query string, fragment and trailing slash.
pub fn normalize_url(url: &str) -> String {
    let base = url.split(['?', '#']).next().unwrap_or_default();
    base.trim().trim_end_matches('/').to_lowercase()
}

/// Stable content hash of a normalized instruction plus page context.
pub fn instruction_hash(instruction: &str, ctx: &PageContext) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize_instruction(instruction).as_bytes());
    hasher.update([0u8]);
    hasher.update(ctx.url.as_bytes());
    hasher.update([0u8]);
    hasher.update(ctx.fingerprint.as_bytes());
    hex::encode(hasher.finalize())
}

/// Exponential moving average toward 1.0 on success and toward 0.0 on
/// failure. Never reaches 0.0, so a degraded entry can recover.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReliabilityPolicy {
    /// Weight given to the newest outcome, in (0, 1].
    pub alpha: f64,
}

impl Default for ReliabilityPolicy {
    fn default() -> Self {
        Self { alpha: 0.3 }
    }
}

impl ReliabilityPolicy {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(0.01, 1.0),
        }
    }

    pub fn raised(&self, score: f64) -> f64 {
        (score + self.alpha * (1.0 - score)).clamp(0.0, 1.0)
    }

    pub fn lowered(&self, score: f64) -> f64 {
        (score * (1.0 - self.alpha)).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionMemoryEntry {
    pub id: i64,
    pub instruction_hash: String,
    pub page_url: String,
    pub instruction: String,
    pub action_data: Locator,
    pub reliability_score: f64,
    pub success_count: i64,
    pub failure_count: i64,
    pub last_used: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

const ENTRY_COLUMNS: &str = "id, instruction_hash, page_url, instruction, action_data,
    reliability_score, success_count, failure_count, last_used, created_at";

fn entry_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionMemoryEntry> {
    let action_raw: String = row.get(4)?;
    let action_data = serde_json::from_str(&action_raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let time = |idx: usize| -> rusqlite::Result<DateTime<Utc>> {
        Ok(parse_timestamp(&row.get::<_, String>(idx)?).unwrap_or_else(Utc::now))
    };

    Ok(SessionMemoryEntry {
        id: row.get(0)?,
        instruction_hash: row.get(1)?,
        page_url: row.get(2)?,
        instruction: row.get(3)?,
        action_data,
        reliability_score: row.get(5)?,
        success_count: row.get(6)?,
        failure_count: row.get(7)?,
        last_used: time(8)?,
        created_at: time(9)?,
    })
}

/// Persistent session memory store.
#[derive(Clone)]
pub struct SessionMemory {
    pool: Pool,
    policy: ReliabilityPolicy,
}

impl SessionMemory {
    pub fn new(pool: Pool, policy: ReliabilityPolicy) -> Self {
        Self { pool, policy }
    }

    pub async fn lookup(&self, hash: &str) -> StoreResult<Option<SessionMemoryEntry>> {
        let hash = hash.to_string();
        blocking(&self.pool, move |conn| {
            let sql =
                format!("SELECT {ENTRY_COLUMNS} FROM session_memory WHERE instruction_hash = ?1");
            Ok(conn.query_row(&sql, params![hash], entry_from_row).optional()?)
        })
        .await
    }

    /// Create the entry at full reliability, or merge a success into it.
    pub async fn record_success(
        &self,
        hash: &str,
        page_url: &str,
        instruction: &str,
        action: &Locator,
    ) -> StoreResult<()> {
        let hash = hash.to_string();
        let page_url = page_url.to_string();
        let instruction = instruction.to_string();
        let action_json = serde_json::to_string(action)?;
        let alpha = self.policy.alpha;

        blocking(&self.pool, move |conn| {
            conn.execute(
                "INSERT INTO session_memory
                    (instruction_hash, page_url, instruction, action_data,
                     reliability_score, success_count, failure_count, last_used, created_at)
                 VALUES (?1, ?2, ?3, ?4, 1.0, 1, 0, ?5, ?5)
                 ON CONFLICT(instruction_hash) DO UPDATE SET
                    action_data = excluded.action_data,
                    page_url = excluded.page_url,
                    success_count = success_count + 1,
                    reliability_score = MIN(1.0, MAX(0.0,
                        reliability_score + ?6 * (1.0 - reliability_score))),
                    last_used = excluded.last_used",
                params![hash, page_url, instruction, action_json, now_timestamp(), alpha],
            )?;
            Ok(())
        })
        .await
    }

    /// Lower reliability of an existing entry. Returns false if absent.
    pub async fn record_failure(&self, hash: &str) -> StoreResult<bool> {
        let hash = hash.to_string();
        let alpha = self.policy.alpha;

        blocking(&self.pool, move |conn| {
            let changed = conn.execute(
                "UPDATE session_memory SET
                    failure_count = failure_count + 1,
                    reliability_score = MIN(1.0, MAX(0.0, reliability_score * (1.0 - ?1))),
                    last_used = ?2
                 WHERE instruction_hash = ?3",
                params![alpha, now_timestamp(), hash],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    /// Most recently used entries first.
    pub async fn list(&self, limit: usize) -> StoreResult<Vec<SessionMemoryEntry>> {
        blocking(&self.pool, move |conn| {
            let sql = format!(
                "SELECT {ENTRY_COLUMNS} FROM session_memory ORDER BY last_used DESC LIMIT ?1"
            );
            let mut stmt = conn.prepare(&sql)?;
            let entries = stmt
                .query_map(params![limit as i64], entry_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(entries)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_pool;
    use rand::Rng;

    fn memory() -> (tempfile::TempDir, SessionMemory) {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(dir.path().join("memory.db").to_str().unwrap()).unwrap();
        (dir, SessionMemory::new(pool, ReliabilityPolicy::default()))
    }

    #[test]
    fn test_hash_ignores_formatting_noise() {
        let ctx = PageContext::new("https://shop.example.com/login?next=/cart", "click");
        let a = instruction_hash("Click the  Sign in button.", &ctx);
        let trailing_slash = PageContext::new("https://shop.example.com/login/", "click");
        let b = instruction_hash("click the sign in button", &trailing_slash);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let fill = PageContext::new("https://shop.example.com/login", "fill");
        let other_action = instruction_hash("click the sign in button", &fill);
        assert_ne!(a, other_action);
    }

    #[test]
    fn test_policy_is_bounded_and_monotonic() {
        let policy = ReliabilityPolicy::default();
        let mut rng = rand::thread_rng();
        let mut score = 1.0;
        for _ in 0..1_000 {
            let next = if rng.gen_bool(0.5) {
                let up = policy.raised(score);
                assert!(up >= score);
                up
            } else {
                let down = policy.lowered(score);
                assert!(down <= score);
                down
            };
            assert!((0.0..=1.0).contains(&next));
            score = next;
        }
    }

    #[tokio::test]
    async fn test_success_creates_then_merges() {
        let (_dir, memory) = memory();
        let ctx = PageContext::new("https://example.com/login", "click");
        let hash = instruction_hash("Click Sign in", &ctx);
        assert!(memory.lookup(&hash).await.unwrap().is_none());

        memory
            .record_success(&hash, &ctx.url, "Click Sign in", &Locator::css("#signin"))
            .await
            .unwrap();
        let entry = memory.lookup(&hash).await.unwrap().unwrap();
        assert_eq!(entry.reliability_score, 1.0);
        assert_eq!(entry.success_count, 1);
        assert_eq!(entry.failure_count, 0);

        assert!(memory.record_failure(&hash).await.unwrap());
        let degraded = memory.lookup(&hash).await.unwrap().unwrap();
        assert!(degraded.reliability_score < 1.0);
        assert_eq!(degraded.failure_count, 1);

        memory
            .record_success(&hash, &ctx.url, "Click Sign in", &Locator::css("button.login"))
            .await
            .unwrap();
        let healed = memory.lookup(&hash).await.unwrap().unwrap();
        assert_eq!(healed.success_count, 2);
        assert_eq!(healed.failure_count, 1);
        assert!(healed.reliability_score > degraded.reliability_score);
        assert_eq!(healed.action_data, Locator::css("button.login"));
        assert_eq!(healed.id, entry.id);
    }

    #[tokio::test]
    async fn test_failure_on_missing_entry_is_noop() {
        let (_dir, memory) = memory();
        assert!(!memory.record_failure("deadbeef").await.unwrap());
        assert!(memory.list(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stored_score_stays_in_bounds() {
        let (_dir, memory) = memory();
        let hash = instruction_hash("Fill email", &PageContext::new("https://x", "fill"));
        memory
            .record_success(&hash, "https://x", "Fill email", &Locator::css("#email"))
            .await
            .unwrap();

        for i in 0..40 {
            if i % 3 == 0 {
                memory
                    .record_success(&hash, "https://x", "Fill email", &Locator::css("#email"))
                    .await
                    .unwrap();
            } else {
                memory.record_failure(&hash).await.unwrap();
            }
            let entry = memory.lookup(&hash).await.unwrap().unwrap();
            assert!((0.0..=1.0).contains(&entry.reliability_score));
        }
    }

    #[tokio::test]
    async fn test_concurrent_first_writers_converge() {
        let (_dir, memory) = memory();
        let hash = instruction_hash("Click Buy", &PageContext::new("https://shop", "click"));

        let mut handles = Vec::new();
        for i in 0..8 {
            let memory = memory.clone();
            let hash = hash.clone();
            handles.push(tokio::spawn(async move {
                let locator = Locator::css(format!("#buy-{i}"));
                memory
                    .record_success(&hash, "https://shop", "Click Buy", &locator)
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let entries = memory.list(10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].success_count, 8);
        assert_eq!(entries[0].failure_count, 0);
    }
}
