//! Worker configuration: TOML file with compiled-in defaults, then
//! environment variable overrides for deployment-specific values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::memory::ReliabilityPolicy;
use crate::queue::{QueueSettings, DEFAULT_GROUP, RUNS_STREAM};
use crate::strategy::ResolverSettings;

/// Environment variable naming the config file when `--config` is absent.
pub const CONFIG_ENV: &str = "HEALRUN_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub browser: BrowserConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl WorkerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(config)
    }

    /// Resolve the effective configuration:
    /// 1. the explicit `path`, else the file named by `HEALRUN_CONFIG`, else defaults;
    /// 2. environment overrides on top;
    /// 3. validation.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match Self::source(path) {
            Some(p) => Self::load(&p)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// The config file `resolve` reads, if any.
    pub fn source(path: Option<&Path>) -> Option<PathBuf> {
        path.map(Path::to_path_buf)
            .or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from))
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("QUEUE_URL") {
            self.queue.url = url;
        }
        if let Some(url) = lookup("DATABASE_URL") {
            self.database.url = url;
        }
        if let Some(name) = lookup("WORKER_CONSUMER_NAME").filter(|n| !n.trim().is_empty()) {
            self.worker.consumer_name = Some(name);
        }
        if let Some(raw) = lookup("STUCK_RUN_TIMEOUT_MINUTES") {
            self.recovery.stuck_run_timeout_minutes = parse_env("STUCK_RUN_TIMEOUT_MINUTES", raw)?;
        }
        if let Some(raw) = lookup("RECOVERY_CHECK_INTERVAL_SECONDS") {
            self.recovery.check_interval_secs = parse_env("RECOVERY_CHECK_INTERVAL_SECONDS", raw)?;
        }
        if let Some(url) = lookup("WEBDRIVER_URL") {
            self.browser.webdriver_url = url;
        }
        if let Some(dir) = lookup("EVIDENCE_DIR") {
            self.browser.evidence_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.url.trim().is_empty() {
            return Err(ConfigError::Invalid("queue.url must not be empty".into()));
        }
        if self.database.url.trim().is_empty() {
            return Err(ConfigError::Invalid("database.url must not be empty".into()));
        }
        if self.recovery.stuck_run_timeout_minutes == 0 {
            return Err(ConfigError::Invalid(
                "recovery.stuck_run_timeout_minutes must be positive".into(),
            ));
        }
        if self.recovery.check_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "recovery.check_interval_secs must be positive".into(),
            ));
        }
        if self.worker.heartbeat_secs == 0 {
            return Err(ConfigError::Invalid("worker.heartbeat_secs must be positive".into()));
        }
        if self.worker.retry_attempts == 0 {
            return Err(ConfigError::Invalid("worker.retry_attempts must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.resolver.reliability_floor) {
            return Err(ConfigError::Invalid(
                "resolver.reliability_floor must be within [0, 1]".into(),
            ));
        }
        if !(self.resolver.reliability_alpha > 0.0 && self.resolver.reliability_alpha < 1.0) {
            return Err(ConfigError::Invalid(
                "resolver.reliability_alpha must be within (0, 1)".into(),
            ));
        }
        // Live runs must refresh their heartbeat well inside the stuck window.
        if self.worker.heartbeat_secs * 2 >= self.recovery.stuck_run_timeout_minutes * 60 {
            return Err(ConfigError::Invalid(
                "worker.heartbeat_secs must be under half the stuck-run timeout".into(),
            ));
        }
        Ok(())
    }

    pub fn queue_path(&self) -> &str {
        sqlite_path(&self.queue.url)
    }

    pub fn database_path(&self) -> &str {
        sqlite_path(&self.database.url)
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            stream: self.queue.stream.clone(),
            group: self.queue.group.clone(),
            claim_block: Duration::from_millis(self.queue.claim_block_ms),
            poll_interval: Duration::from_millis(self.queue.poll_interval_ms.max(1)),
            reclaim_idle: Duration::from_secs(self.queue.reclaim_idle_secs),
        }
    }

    pub fn resolver_settings(&self) -> ResolverSettings {
        ResolverSettings {
            reliability_floor: self.resolver.reliability_floor,
            structural_candidates: self.resolver.structural_candidates,
            perceptual_cost_usd: self.resolver.perceptual_cost_usd,
        }
    }

    pub fn reliability_policy(&self) -> ReliabilityPolicy {
        ReliabilityPolicy::new(self.resolver.reliability_alpha)
    }

    pub fn stuck_run_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery.stuck_run_timeout_minutes * 60)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery.check_interval_secs)
    }

    /// Configured consumer name, or a fresh `worker-<host>-<pid>-<rand>`.
    pub fn consumer_name(&self) -> String {
        match &self.worker.consumer_name {
            Some(name) => name.clone(),
            None => generate_consumer_name(),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &'static str, raw: String) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { key, value: raw })
}

/// Accepts either a bare path or a `sqlite://` URL.
fn sqlite_path(url: &str) -> &str {
    url.strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix("sqlite:"))
        .unwrap_or(url)
}

fn hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

pub fn generate_consumer_name() -> String {
    let suffix: u32 = rand::thread_rng().gen();
    format!("worker-{}-{}-{:08x}", hostname(), std::process::id(), suffix)
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// SQLite path (or `sqlite://` URL) of the queue database.
    pub url: String,
    pub stream: String,
    pub group: String,
    pub claim_block_ms: u64,
    pub poll_interval_ms: u64,
    /// Pending jobs idle this long are taken over by other consumers.
    pub reclaim_idle_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            url: "data/queue.db".to_string(),
            stream: RUNS_STREAM.to_string(),
            group: DEFAULT_GROUP.to_string(),
            claim_block_ms: 5_000,
            poll_interval_ms: 250,
            reclaim_idle_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "data/healrun.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSection {
    pub consumer_name: Option<String>,
    pub heartbeat_secs: u64,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub idle_log_secs: u64,
    pub health_log_secs: u64,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            consumer_name: None,
            heartbeat_secs: 30,
            retry_attempts: 3,
            retry_base_delay_ms: 1_000,
            idle_log_secs: 30,
            health_log_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub stuck_run_timeout_minutes: u64,
    pub check_interval_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            stuck_run_timeout_minutes: 10,
            check_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Cached entries at or below this score are not replayed.
    pub reliability_floor: f64,
    pub reliability_alpha: f64,
    pub structural_candidates: usize,
    pub perceptual_cost_usd: f64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        let settings = ResolverSettings::default();
        Self {
            reliability_floor: settings.reliability_floor,
            reliability_alpha: ReliabilityPolicy::default().alpha,
            structural_candidates: settings.structural_candidates,
            perceptual_cost_usd: settings.perceptual_cost_usd,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub webdriver_url: String,
    pub headless: bool,
    pub step_timeout_secs: u64,
    pub run_timeout_secs: u64,
    pub capture_screenshots: bool,
    pub evidence_dir: PathBuf,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            webdriver_url: "http://localhost:4444".to_string(),
            headless: true,
            step_timeout_secs: 60,
            run_timeout_secs: 300,
            capture_screenshots: true,
            evidence_dir: PathBuf::from("data/evidence"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            filter: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = WorkerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.stuck_run_timeout(), Duration::from_secs(600));
        assert_eq!(config.recovery_interval(), Duration::from_secs(60));
        assert_eq!(config.queue_settings().stream, "runs:queue");
        assert_eq!(config.queue_settings().group, "run-workers");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: WorkerConfig = toml::from_str(
            r#"
            [recovery]
            stuck_run_timeout_minutes = 20

            [logging]
            format = "json"
            "#,
        )
        .unwrap();
        assert_eq!(config.recovery.stuck_run_timeout_minutes, 20);
        assert_eq!(config.recovery.check_interval_secs, 60);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.worker.retry_attempts, 3);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = WorkerConfig::default();
        config
            .apply_env(env(&[
                ("QUEUE_URL", "sqlite:///tmp/q.db"),
                ("DATABASE_URL", "/tmp/app.db"),
                ("WORKER_CONSUMER_NAME", "worker-fixed"),
                ("STUCK_RUN_TIMEOUT_MINUTES", "15"),
                ("RECOVERY_CHECK_INTERVAL_SECONDS", "5"),
            ]))
            .unwrap();
        assert_eq!(config.queue_path(), "/tmp/q.db");
        assert_eq!(config.database_path(), "/tmp/app.db");
        assert_eq!(config.consumer_name(), "worker-fixed");
        assert_eq!(config.stuck_run_timeout(), Duration::from_secs(900));
        assert_eq!(config.recovery_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_bad_env_number_is_rejected() {
        let mut config = WorkerConfig::default();
        let err = config
            .apply_env(env(&[("STUCK_RUN_TIMEOUT_MINUTES", "ten")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidEnv {
                key: "STUCK_RUN_TIMEOUT_MINUTES",
                ..
            }
        ));
    }

    #[test]
    fn test_heartbeat_must_fit_inside_stuck_timeout() {
        let mut config = WorkerConfig::default();
        config.recovery.stuck_run_timeout_minutes = 1;
        config.worker.heartbeat_secs = 45;
        assert!(config.validate().is_err());
        config.worker.heartbeat_secs = 20;
        config.validate().unwrap();
    }

    #[test]
    fn test_generated_consumer_names_are_unique() {
        let config = WorkerConfig::default();
        let a = config.consumer_name();
        let b = config.consumer_name();
        assert!(a.starts_with("worker-"));
        assert!(a.contains(&std::process::id().to_string()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_consumer_name_carries_host() {
        let host = hostname();
        assert!(!host.is_empty());
        assert_eq!(host, host.trim());
        assert!(generate_consumer_name().starts_with(&format!("worker-{host}-")));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("healrun.toml");
        std::fs::write(&path, "[browser]\nwebdriver_url = \"http://grid:4444\"\n").unwrap();
        let config = WorkerConfig::load(&path).unwrap();
        assert_eq!(config.browser.webdriver_url, "http://grid:4444");

        std::fs::write(&path, "[browser\n").unwrap();
        assert!(matches!(
            WorkerConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }
}
