//! Run State Store: test definitions and the lifecycle of their runs.
//!
//! Every status transition is a compare-and-set on the status observed by the
//! writer. The job processor and the recovery sweeper share these tables and
//! never hold in-memory locks across each other.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{blocking, now_timestamp, parse_timestamp, timestamp, Pool, StoreError, StoreResult};
use crate::strategy::StrategyTier;

/// Lifecycle of a [`TestRun`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Passed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Passed => "passed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(RunStatus::Queued),
            "running" => Some(RunStatus::Running),
            "passed" => Some(RunStatus::Passed),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Passed | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a run ended in `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// An instruction could not be performed after every strategy tier.
    Step,
    /// The test definition itself is unusable (missing test, invalid step).
    Definition,
    /// Database, queue or browser infrastructure kept failing.
    Infrastructure,
    /// A step, or the run as a whole, overran its execution budget.
    StepTimeout,
    /// The run was orphaned and force-failed by the recovery sweeper.
    Timeout,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Step => "step",
            FailureKind::Definition => "definition",
            FailureKind::Infrastructure => "infrastructure",
            FailureKind::StepTimeout => "step_timeout",
            FailureKind::Timeout => "timeout",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "step" => Some(FailureKind::Step),
            "definition" => Some(FailureKind::Definition),
            "infrastructure" => Some(FailureKind::Infrastructure),
            "step_timeout" => Some(FailureKind::StepTimeout),
            "timeout" => Some(FailureKind::Timeout),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Test definitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    Navigate,
    Click,
    Fill,
    Verify,
}

impl StepAction {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "navigate" => Some(StepAction::Navigate),
            "click" => Some(StepAction::Click),
            "fill" => Some(StepAction::Fill),
            "verify" => Some(StepAction::Verify),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StepAction::Navigate => "navigate",
            StepAction::Click => "click",
            StepAction::Fill => "fill",
            StepAction::Verify => "verify",
        }
    }
}

/// One validated step of a test definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestStep {
    pub action: StepAction,
    pub instruction: String,
    /// Author-supplied CSS selector, tried first by structural search.
    #[serde(default, alias = "advanced_selector", skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected: Option<String>,
}

impl TestStep {
    pub fn navigate(instruction: &str, target: &str) -> Self {
        Self::bare(StepAction::Navigate, instruction).with_target(target)
    }

    pub fn click(instruction: &str) -> Self {
        Self::bare(StepAction::Click, instruction)
    }

    pub fn fill(instruction: &str, value: &str) -> Self {
        let mut step = Self::bare(StepAction::Fill, instruction);
        step.value = Some(value.to_string());
        step
    }

    pub fn verify(instruction: &str, expected: &str) -> Self {
        let mut step = Self::bare(StepAction::Verify, instruction);
        step.expected = Some(expected.to_string());
        step
    }

    pub fn with_selector(mut self, selector: &str) -> Self {
        self.selector = Some(selector.to_string());
        self
    }

    pub fn with_target(mut self, target: &str) -> Self {
        self.target = Some(target.to_string());
        self
    }

    fn bare(action: StepAction, instruction: &str) -> Self {
        Self {
            action,
            instruction: instruction.to_string(),
            selector: None,
            target: None,
            value: None,
            expected: None,
        }
    }
}

/// A step that failed validation, with its 0-based index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidStep {
    pub index: usize,
    pub message: String,
}

/// Raw definition as stored; steps are validated one by one before a run starts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestDefinition {
    #[serde(default)]
    pub steps: Vec<serde_json::Value>,
}

impl TestDefinition {
    pub fn from_steps(steps: &[TestStep]) -> Self {
        Self {
            steps: steps
                .iter()
                .filter_map(|s| serde_json::to_value(s).ok())
                .collect(),
        }
    }

    /// Validate every step, reporting the first invalid one.
    pub fn validated_steps(&self) -> Result<Vec<TestStep>, InvalidStep> {
        self.steps
            .iter()
            .enumerate()
            .map(|(index, raw)| {
                validate_step(raw).map_err(|message| InvalidStep {
                    index,
                    message: format!("Step {}: {}", index + 1, message),
                })
            })
            .collect()
    }
}

fn str_field<'a>(raw: &'a serde_json::Value, name: &str) -> Option<&'a str> {
    raw.get(name)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn validate_step(raw: &serde_json::Value) -> Result<TestStep, String> {
    let field = |name: &str| str_field(raw, name);

    let action_raw = field("action").ok_or_else(|| "missing 'action'".to_string())?;
    let action =
        StepAction::parse(action_raw).ok_or_else(|| format!("unknown action '{action_raw}'"))?;

    let selector = field("selector").or_else(|| field("advanced_selector"));
    let instruction = field("instruction").unwrap_or(action.as_str());

    match action {
        StepAction::Navigate => {}
        StepAction::Click | StepAction::Fill => {
            if selector.is_none() && field("instruction").is_none() {
                return Err(format!(
                    "{} requires 'instruction' or 'advanced_selector'",
                    action.as_str()
                ));
            }
            if action == StepAction::Fill && raw.get("value").is_none() {
                return Err("fill requires 'value'".to_string());
            }
        }
        StepAction::Verify => {
            if field("expected").is_none() {
                return Err("verify requires 'expected'".to_string());
            }
        }
    }

    let value = raw.get("value").map(|v| match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    });

    Ok(TestStep {
        action,
        instruction: instruction.to_string(),
        selector: selector.map(str::to_string),
        target: field("target").map(str::to_string),
        value,
        expected: field("expected").map(str::to_string),
    })
}

/// A test definition. Owned by the CRUD layer; read-only to the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Test {
    pub id: Uuid,
    pub owner: String,
    pub name: String,
    pub url: String,
    pub definition: TestDefinition,
    pub auto_handle_popups: bool,
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Passed,
    Failed,
}

/// Outcome of one instruction. Appended to a run, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step: usize,
    pub instruction: String,
    pub action: StepAction,
    pub status: StepStatus,
    pub strategy: Option<StrategyTier>,
    pub self_healed: bool,
    pub attempts: u32,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Usage counters that accompany a step result.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StepUsage {
    pub strategy_invocations: u32,
    pub cost_usd: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestRun {
    pub id: Uuid,
    pub test_id: Uuid,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub screenshots: Vec<String>,
    pub step_results: Vec<StepResult>,
    pub self_healed: bool,
    pub strategy_invocation_count: i64,
    pub cost_usd: f64,
    pub error: Option<String>,
    pub error_kind: Option<FailureKind>,
    pub error_step: Option<usize>,
    pub created_at: DateTime<Utc>,
}

/// Terminal outcome written by [`RunStore::finish`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub error: Option<String>,
    pub error_kind: Option<FailureKind>,
    pub error_step: Option<usize>,
    pub duration_ms: i64,
}

impl RunOutcome {
    pub fn passed(duration_ms: i64) -> Self {
        Self {
            status: RunStatus::Passed,
            error: None,
            error_kind: None,
            error_step: None,
            duration_ms,
        }
    }

    pub fn failed(
        error: impl Into<String>,
        kind: FailureKind,
        error_step: Option<usize>,
        duration_ms: i64,
    ) -> Self {
        Self {
            status: RunStatus::Failed,
            error: Some(error.into()),
            error_kind: Some(kind),
            error_step,
            duration_ms,
        }
    }
}

const RUN_COLUMNS: &str = "id, test_id, status, started_at, heartbeat_at, completed_at,
    duration_ms, screenshots, step_results, self_healed, strategy_invocation_count,
    cost_usd, error, error_kind, error_step, created_at";

fn parse_uuid(raw: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn json_column<T: serde::de::DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<TestRun> {
    let time = |idx: usize| -> rusqlite::Result<Option<DateTime<Utc>>> {
        Ok(row
            .get::<_, Option<String>>(idx)?
            .as_deref()
            .and_then(parse_timestamp))
    };
    let status_raw: String = row.get(2)?;

    Ok(TestRun {
        id: parse_uuid(&row.get::<_, String>(0)?)?,
        test_id: parse_uuid(&row.get::<_, String>(1)?)?,
        status: RunStatus::parse(&status_raw).unwrap_or(RunStatus::Failed),
        started_at: time(3)?,
        heartbeat_at: time(4)?,
        completed_at: time(5)?,
        duration_ms: row.get(6)?,
        screenshots: json_column(7, &row.get::<_, String>(7)?)?,
        step_results: json_column(8, &row.get::<_, String>(8)?)?,
        self_healed: row.get::<_, i64>(9)? != 0,
        strategy_invocation_count: row.get(10)?,
        cost_usd: row.get(11)?,
        error: row.get(12)?,
        error_kind: row
            .get::<_, Option<String>>(13)?
            .as_deref()
            .and_then(FailureKind::parse),
        error_step: row.get::<_, Option<i64>>(14)?.map(|s| s as usize),
        created_at: time(15)?.unwrap_or_else(Utc::now),
    })
}

/// Persistent record of tests and run lifecycles.
#[derive(Clone)]
pub struct RunStore {
    pool: Pool,
}

impl RunStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub async fn create_test(&self, test: &Test) -> StoreResult<()> {
        let test = test.clone();
        blocking(&self.pool, move |conn| {
            let now = now_timestamp();
            conn.execute(
                "INSERT INTO tests (id, owner, name, url, definition, auto_handle_popups, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![
                    test.id.to_string(),
                    test.owner,
                    test.name,
                    test.url,
                    serde_json::to_string(&test.definition)?,
                    test.auto_handle_popups as i64,
                    now
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn load_test(&self, id: Uuid) -> StoreResult<Option<Test>> {
        blocking(&self.pool, move |conn| {
            let row = conn
                .query_row(
                    "SELECT owner, name, url, definition, auto_handle_popups FROM tests WHERE id = ?1",
                    params![id.to_string()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                            row.get::<_, i64>(4)? != 0,
                        ))
                    },
                )
                .optional()?;

            let Some((owner, name, url, definition, auto_handle_popups)) = row else {
                return Ok(None);
            };

            // A definition that is not a steps object behaves like an empty one.
            let definition: TestDefinition = serde_json::from_str(&definition).unwrap_or_default();
            Ok(Some(Test {
                id,
                owner,
                name,
                url,
                definition,
                auto_handle_popups,
            }))
        })
        .await
    }

    /// Create a run in `queued`.
    pub async fn create_run(&self, test_id: Uuid) -> StoreResult<Uuid> {
        let id = Uuid::new_v4();
        blocking(&self.pool, move |conn| {
            conn.execute(
                "INSERT INTO test_runs (id, test_id, status, created_at) VALUES (?1, ?2, 'queued', ?3)",
                params![id.to_string(), test_id.to_string(), now_timestamp()],
            )?;
            Ok(id)
        })
        .await
    }

    pub async fn load_run(&self, id: Uuid) -> StoreResult<Option<TestRun>> {
        blocking(&self.pool, move |conn| {
            let sql = format!("SELECT {RUN_COLUMNS} FROM test_runs WHERE id = ?1");
            Ok(conn
                .query_row(&sql, params![id.to_string()], run_from_row)
                .optional()?)
        })
        .await
    }

    /// `queued -> running`. Returns false if the run was not queued.
    pub async fn mark_running(&self, id: Uuid, started_at: DateTime<Utc>) -> StoreResult<bool> {
        blocking(&self.pool, move |conn| {
            let started = timestamp(started_at);
            let changed = conn.execute(
                "UPDATE test_runs SET status = 'running', started_at = ?1, heartbeat_at = ?1
                 WHERE id = ?2 AND status = 'queued'",
                params![started, id.to_string()],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    /// Advance the liveness timestamp of a running run.
    pub async fn heartbeat(&self, id: Uuid) -> StoreResult<bool> {
        blocking(&self.pool, move |conn| {
            let changed = conn.execute(
                "UPDATE test_runs SET heartbeat_at = ?1 WHERE id = ?2 AND status = 'running'",
                params![now_timestamp(), id.to_string()],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    /// Append the next step result. Returns false if the run is no longer running.
    pub async fn append_step(
        &self,
        id: Uuid,
        result: StepResult,
        usage: StepUsage,
    ) -> StoreResult<bool> {
        blocking(&self.pool, move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let current = tx
                .query_row(
                    "SELECT status, step_results, screenshots FROM test_runs WHERE id = ?1",
                    params![id.to_string()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .optional()?;

            let Some((status, steps_json, shots_json)) = current else {
                return Err(StoreError::NotFound(format!("run {id} not found")));
            };
            if RunStatus::parse(&status) != Some(RunStatus::Running) {
                return Ok(false);
            }

            let mut steps: Vec<StepResult> = serde_json::from_str(&steps_json)?;
            if result.step != steps.len() {
                return Err(StoreError::Conflict(format!(
                    "run {id}: step {} appended after {} results",
                    result.step,
                    steps.len()
                )));
            }
            let mut shots: Vec<String> = serde_json::from_str(&shots_json)?;
            if let Some(evidence) = &result.evidence {
                shots.push(evidence.clone());
            }
            let healed = result.self_healed;
            steps.push(result);

            tx.execute(
                "UPDATE test_runs SET step_results = ?1, screenshots = ?2,
                    self_healed = MAX(self_healed, ?3),
                    strategy_invocation_count = strategy_invocation_count + ?4,
                    cost_usd = cost_usd + ?5,
                    heartbeat_at = ?6
                 WHERE id = ?7 AND status = 'running'",
                params![
                    serde_json::to_string(&steps)?,
                    serde_json::to_string(&shots)?,
                    healed as i64,
                    usage.strategy_invocations as i64,
                    usage.cost_usd,
                    now_timestamp(),
                    id.to_string()
                ],
            )?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    /// `running -> passed|failed`. Returns false if the run was no longer running.
    pub async fn finish(&self, id: Uuid, outcome: RunOutcome) -> StoreResult<bool> {
        blocking(&self.pool, move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            if outcome.status == RunStatus::Passed {
                let steps_json: Option<String> = tx
                    .query_row(
                        "SELECT step_results FROM test_runs WHERE id = ?1",
                        params![id.to_string()],
                        |row| row.get(0),
                    )
                    .optional()?;
                let steps: Vec<StepResult> =
                    serde_json::from_str(steps_json.as_deref().unwrap_or("[]"))?;
                if steps.iter().any(|s| s.status == StepStatus::Failed) {
                    return Err(StoreError::Conflict(format!(
                        "run {id} cannot pass with a failed step"
                    )));
                }
            }

            let changed = tx.execute(
                "UPDATE test_runs SET status = ?1, error = ?2, error_kind = ?3, error_step = ?4,
                    completed_at = ?5, duration_ms = ?6
                 WHERE id = ?7 AND status = 'running'",
                params![
                    outcome.status.as_str(),
                    outcome.error,
                    outcome.error_kind.map(|k| k.as_str()),
                    outcome.error_step.map(|s| s as i64),
                    now_timestamp(),
                    outcome.duration_ms,
                    id.to_string()
                ],
            )?;
            tx.commit()?;
            Ok(changed == 1)
        })
        .await
    }

    /// Running runs whose last sign of life is older than `cutoff`.
    pub async fn stale_running(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Uuid>> {
        blocking(&self.pool, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM test_runs
                 WHERE status = 'running' AND COALESCE(heartbeat_at, started_at) < ?1
                 ORDER BY started_at",
            )?;
            let ids = stmt
                .query_map(params![timestamp(cutoff)], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids
                .iter()
                .filter_map(|raw| Uuid::parse_str(raw).ok())
                .collect())
        })
        .await
    }

    /// Force-fail a stale run, only if it is still running and still stale.
    pub async fn fail_stale(
        &self,
        id: Uuid,
        cutoff: DateTime<Utc>,
        error: &str,
    ) -> StoreResult<bool> {
        let error = error.to_string();
        blocking(&self.pool, move |conn| {
            let now = now_timestamp();
            let changed = conn.execute(
                "UPDATE test_runs SET status = 'failed', error = ?1, error_kind = ?2,
                    completed_at = ?3,
                    duration_ms = CAST((julianday(?3) - julianday(started_at)) * 86400000 AS INTEGER)
                 WHERE id = ?4 AND status = 'running'
                   AND COALESCE(heartbeat_at, started_at) < ?5",
                params![
                    error,
                    FailureKind::Timeout.as_str(),
                    now,
                    id.to_string(),
                    timestamp(cutoff)
                ],
            )?;
            Ok(changed == 1)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_pool;

    fn store() -> (tempfile::TempDir, RunStore) {
        let dir = tempfile::tempdir().unwrap();
        let pool = open_pool(dir.path().join("runs.db").to_str().unwrap()).unwrap();
        (dir, RunStore::new(pool))
    }

    fn sample_test() -> Test {
        Test {
            id: Uuid::new_v4(),
            owner: "qa@example.com".into(),
            name: "Login".into(),
            url: "https://example.com".into(),
            definition: TestDefinition::from_steps(&[
                TestStep::navigate("Open the site", "https://example.com"),
                TestStep::click("Click the Sign in button"),
            ]),
            auto_handle_popups: true,
        }
    }

    fn passed_step(step: usize) -> StepResult {
        StepResult {
            step,
            instruction: format!("step {step}"),
            action: StepAction::Click,
            status: StepStatus::Passed,
            strategy: Some(StrategyTier::Cached),
            self_healed: false,
            attempts: 1,
            duration_ms: 12,
            evidence: Some(format!("evidence/step-{step}.png")),
            error: None,
        }
    }

    #[test]
    fn test_validate_step_messages() {
        let def = TestDefinition {
            steps: vec![serde_json::json!({})],
        };
        assert_eq!(
            def.validated_steps().unwrap_err().message,
            "Step 1: missing 'action'"
        );

        let def = TestDefinition {
            steps: vec![
                serde_json::json!({"action": "navigate"}),
                serde_json::json!({"action": "foo"}),
            ],
        };
        let err = def.validated_steps().unwrap_err();
        assert_eq!(err.index, 1);
        assert_eq!(err.message, "Step 2: unknown action 'foo'");

        let def = TestDefinition {
            steps: vec![serde_json::json!({"action": "fill", "advanced_selector": "#x"})],
        };
        assert!(def.validated_steps().unwrap_err().message.contains("value"));

        let def = TestDefinition {
            steps: vec![serde_json::json!({"action": "verify"})],
        };
        assert!(def.validated_steps().unwrap_err().message.contains("expected"));

        let def = TestDefinition {
            steps: vec![serde_json::json!({"action": "click"})],
        };
        assert!(def.validated_steps().is_err());
    }

    #[test]
    fn test_validate_step_accepts_legacy_selector_field() {
        let def = TestDefinition {
            steps: vec![serde_json::json!({
                "action": "fill",
                "instruction": "Fill the email field",
                "advanced_selector": "#email",
                "value": "a@b.com"
            })],
        };
        let steps = def.validated_steps().unwrap();
        assert_eq!(steps[0].selector.as_deref(), Some("#email"));
        assert_eq!(steps[0].value.as_deref(), Some("a@b.com"));
    }

    #[tokio::test]
    async fn test_run_lifecycle() {
        let (_dir, store) = store();
        let test = sample_test();
        store.create_test(&test).await.unwrap();
        assert_eq!(store.load_test(test.id).await.unwrap().unwrap(), test);

        let run_id = store.create_run(test.id).await.unwrap();
        let run = store.load_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Queued);

        assert!(store.mark_running(run_id, Utc::now()).await.unwrap());
        assert!(!store.mark_running(run_id, Utc::now()).await.unwrap());

        let usage = StepUsage {
            strategy_invocations: 2,
            cost_usd: 0.01,
        };
        assert!(store.append_step(run_id, passed_step(0), usage).await.unwrap());
        assert!(store.append_step(run_id, passed_step(1), usage).await.unwrap());
        assert!(store.finish(run_id, RunOutcome::passed(40)).await.unwrap());

        let run = store.load_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Passed);
        assert_eq!(run.step_results.len(), 2);
        assert_eq!(run.screenshots.len(), 2);
        assert_eq!(run.strategy_invocation_count, 4);
        assert!((run.cost_usd - 0.02).abs() < 1e-9);
        assert!(run.completed_at.is_some());

        // Terminal runs accept no further writes.
        assert!(!store.append_step(run_id, passed_step(2), usage).await.unwrap());
        assert!(!store
            .finish(run_id, RunOutcome::failed("late", FailureKind::Step, None, 1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_append_step_rejects_out_of_order() {
        let (_dir, store) = store();
        let run_id = store.create_run(Uuid::new_v4()).await.unwrap();
        store.mark_running(run_id, Utc::now()).await.unwrap();

        let err = store
            .append_step(run_id, passed_step(1), StepUsage::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_cannot_pass_with_failed_step() {
        let (_dir, store) = store();
        let run_id = store.create_run(Uuid::new_v4()).await.unwrap();
        store.mark_running(run_id, Utc::now()).await.unwrap();

        let mut failed = passed_step(0);
        failed.status = StepStatus::Failed;
        store
            .append_step(run_id, failed, StepUsage::default())
            .await
            .unwrap();
        assert!(store.finish(run_id, RunOutcome::passed(5)).await.is_err());
    }

    #[tokio::test]
    async fn test_fail_stale_is_compare_and_set() {
        let (_dir, store) = store();
        let run_id = store.create_run(Uuid::new_v4()).await.unwrap();
        let started = Utc::now() - chrono::Duration::minutes(15);
        {
            let conn = store.pool().get().unwrap();
            conn.execute(
                "UPDATE test_runs SET status = 'running', started_at = ?1 WHERE id = ?2",
                params![timestamp(started), run_id.to_string()],
            )
            .unwrap();
        }

        let cutoff = Utc::now() - chrono::Duration::minutes(10);
        assert_eq!(store.stale_running(cutoff).await.unwrap(), vec![run_id]);

        // A fresh heartbeat between query and update wins over the sweeper.
        assert!(store.heartbeat(run_id).await.unwrap());
        assert!(!store.fail_stale(run_id, cutoff, "execution timeout").await.unwrap());
        assert!(store.stale_running(cutoff).await.unwrap().is_empty());

        let later = Utc::now() + chrono::Duration::seconds(1);
        assert!(store.fail_stale(run_id, later, "execution timeout").await.unwrap());
        let run = store.load_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("execution timeout"));
        assert_eq!(run.error_kind, Some(FailureKind::Timeout));
        assert!(run.duration_ms.unwrap() >= 15 * 60 * 1000);
    }
}
