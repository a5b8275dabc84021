//! Layered configuration for runweave.
//!
//! Settings come from built-in defaults, then `.runweave/runweave.toml` (or
//! the file given with `--config`), then `RUNWEAVE_*` environment variables,
//! then CLI flags.
//!
//! # Configuration File Format
//!
//! ```toml
//! [store]
//! events_path = ".runweave/events.db"
//! broker_path = ".runweave/broker.db"
//!
//! [runs]
//! timeout_secs = 3600
//!
//! [ingest]
//! group = "neo4j_ingest"
//! stream_pattern = "workflow:*:events"
//! batch_size = 50
//! claim_min_idle_ms = 60000
//! max_deliveries = 10
//!
//! [queue]
//! namespace = "llm_queue"
//! tpm_budget = 100000
//! budget_ratio = 0.98
//!
//! [lock]
//! namespace = "github_token"
//! ttl_ms = 10000
//! max_attempts = 40
//!
//! [logging]
//! format = "json"
//! directory = ".runweave/logs"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::broker::GroupStart;
use crate::ingest::{IngestConfig, StreamSource, default_consumer_name};
use crate::lock::LockConfig;
use crate::queue::QueueConfig;

pub const CONFIG_DIR: &str = ".runweave";
pub const CONFIG_FILE: &str = "runweave.toml";
pub const DEFAULT_STREAM_PATTERN: &str = "workflow:*:events";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "text" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            _ => anyhow::bail!("Invalid log format '{}'. Valid values: pretty, json", s),
        }
    }
}

/// Where a consumer group created on first scan starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartPosition {
    #[default]
    Latest,
    Beginning,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub events_path: PathBuf,
    pub broker_path: PathBuf,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            events_path: PathBuf::from(CONFIG_DIR).join("events.db"),
            broker_path: PathBuf::from(CONFIG_DIR).join("broker.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunsSection {
    /// Age after which a still-running run reads as timed out.
    pub timeout_secs: i64,
}

impl Default for RunsSection {
    fn default() -> Self {
        Self {
            timeout_secs: crate::eventlog::DEFAULT_RUN_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestSection {
    pub group: String,
    /// A single shared stream. Takes precedence over `stream_pattern`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_pattern: Option<String>,
    pub start: StartPosition,
    pub batch_size: usize,
    pub block_ms: u64,
    pub poll_interval_ms: u64,
    pub rescan_interval_secs: u64,
    pub claim_min_idle_ms: u64,
    pub max_deliveries: i64,
}

impl Default for IngestSection {
    fn default() -> Self {
        Self {
            group: "neo4j_ingest".into(),
            stream_key: None,
            stream_pattern: None,
            start: StartPosition::Latest,
            batch_size: 50,
            block_ms: 5_000,
            poll_interval_ms: 100,
            rescan_interval_secs: 30,
            claim_min_idle_ms: 60_000,
            max_deliveries: 10,
        }
    }
}

impl IngestSection {
    pub fn source(&self) -> StreamSource {
        match (&self.stream_key, &self.stream_pattern) {
            (Some(key), _) => StreamSource::Key(key.clone()),
            (None, Some(pattern)) => StreamSource::Pattern(pattern.clone()),
            (None, None) => StreamSource::Pattern(DEFAULT_STREAM_PATTERN.into()),
        }
    }

    /// Stream a producer should write a run's events to.
    pub fn stream_for_run(&self, run_id: &str) -> String {
        match &self.stream_key {
            Some(key) => key.clone(),
            None => format!("workflow:{}:events", run_id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub namespace: String,
    pub tpm_budget: i64,
    pub budget_ratio: f64,
    pub tpm_window_secs: u64,
    pub default_backoff_ms: u64,
    /// Ceiling on any provider cooldown, hinted or default.
    pub max_backoff_ms: u64,
    pub idle_ms: u64,
    pub poll_interval_ms: u64,
    pub max_wait_secs: u64,
    pub endpoint: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            namespace: "llm_queue".into(),
            tpm_budget: 100_000,
            budget_ratio: 0.98,
            tpm_window_secs: 60,
            default_backoff_ms: 60_000,
            max_backoff_ms: 3_600_000,
            idle_ms: 200,
            poll_interval_ms: 250,
            max_wait_secs: 90,
            endpoint: "https://api.openai.com/v1/chat/completions".into(),
            api_key_env: "OPENAI_API_KEY".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockSection {
    pub namespace: String,
    pub ttl_ms: u64,
    pub poll_interval_ms: u64,
    pub max_attempts: u32,
    pub token_url: String,
    pub client_id_env: String,
    pub client_secret_env: String,
}

impl Default for LockSection {
    fn default() -> Self {
        Self {
            namespace: "github_token".into(),
            ttl_ms: 10_000,
            poll_interval_ms: 250,
            max_attempts: 40,
            token_url: "https://github.com/login/oauth/access_token".into(),
            client_id_env: "GITHUB_CLIENT_ID".into(),
            client_secret_env: "GITHUB_CLIENT_SECRET".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub format: LogFormat,
    /// Directory for daily-rolling log files, in addition to stderr.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
}

/// The complete runweave.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunweaveToml {
    pub store: StoreSection,
    pub runs: RunsSection,
    pub ingest: IngestSection,
    pub queue: QueueSection,
    pub lock: LockSection,
    pub logging: LoggingSection,
}

impl RunweaveToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse runweave.toml")
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize runweave.toml")?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `RUNWEAVE_*` overrides, reading variables through `lookup`.
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("RUNWEAVE_EVENTS_DB") {
            self.store.events_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("RUNWEAVE_BROKER_DB") {
            self.store.broker_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("RUNWEAVE_RUN_TIMEOUT_SECS") {
            self.runs.timeout_secs = v
                .parse()
                .with_context(|| format!("RUNWEAVE_RUN_TIMEOUT_SECS is not an integer: '{}'", v))?;
        }
        if let Some(v) = lookup("RUNWEAVE_INGEST_GROUP") {
            self.ingest.group = v;
        }
        if let Some(v) = lookup("RUNWEAVE_INGEST_STREAM") {
            self.ingest.stream_key = Some(v);
        }
        if let Some(v) = lookup("RUNWEAVE_INGEST_PATTERN") {
            self.ingest.stream_pattern = Some(v);
        }
        if let Some(v) = lookup("RUNWEAVE_TPM_BUDGET") {
            self.queue.tpm_budget = v
                .parse()
                .with_context(|| format!("RUNWEAVE_TPM_BUDGET is not an integer: '{}'", v))?;
        }
        if let Some(v) = lookup("RUNWEAVE_LOG_FORMAT") {
            self.logging.format = v.parse()?;
        }
        Ok(())
    }

    /// Validate the configuration and return any problems found.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();

        if self.runs.timeout_secs <= 0 {
            problems.push(format!(
                "runs.timeout_secs must be positive, got {}",
                self.runs.timeout_secs
            ));
        } else if let Err(e) = self.run_timeout() {
            problems.push(e.to_string());
        }
        if self.ingest.group.trim().is_empty() {
            problems.push("ingest.group must not be empty".to_string());
        }
        if self.ingest.stream_key.is_some() && self.ingest.stream_pattern.is_some() {
            problems.push(
                "ingest.stream_key and ingest.stream_pattern are both set; stream_key wins".to_string(),
            );
        }
        if let Some(pattern) = &self.ingest.stream_pattern
            && let Err(e) = glob::Pattern::new(pattern)
        {
            problems.push(format!("Invalid ingest.stream_pattern '{}': {}", pattern, e));
        }
        if self.ingest.batch_size == 0 {
            problems.push("ingest.batch_size must be at least 1".to_string());
        }
        if self.ingest.max_deliveries < 1 {
            problems.push("ingest.max_deliveries must be at least 1".to_string());
        }
        if self.queue.tpm_budget <= 0 {
            problems.push(format!(
                "queue.tpm_budget must be positive, got {}",
                self.queue.tpm_budget
            ));
        }
        if !(self.queue.budget_ratio > 0.0 && self.queue.budget_ratio <= 1.0) {
            problems.push(format!(
                "queue.budget_ratio must be in (0, 1], got {}",
                self.queue.budget_ratio
            ));
        }
        if self.queue.max_backoff_ms < self.queue.default_backoff_ms {
            problems.push(format!(
                "queue.max_backoff_ms ({}) is below queue.default_backoff_ms ({})",
                self.queue.max_backoff_ms, self.queue.default_backoff_ms
            ));
        }
        if self.queue.max_wait_secs == 0 {
            problems.push("queue.max_wait_secs must be positive".to_string());
        }
        if self.lock.max_attempts == 0 {
            problems.push("lock.max_attempts must be at least 1".to_string());
        }
        if self.lock.ttl_ms == 0 {
            problems.push("lock.ttl_ms must be positive".to_string());
        }

        problems
    }

    pub fn ingest_config(&self, consumer: Option<String>) -> IngestConfig {
        let s = &self.ingest;
        IngestConfig {
            source: s.source(),
            group: s.group.clone(),
            consumer: consumer.unwrap_or_else(default_consumer_name),
            start: match s.start {
                StartPosition::Latest => GroupStart::Latest,
                StartPosition::Beginning => GroupStart::Beginning,
            },
            batch_size: s.batch_size.max(1),
            block: Duration::from_millis(s.block_ms),
            poll_interval: Duration::from_millis(s.poll_interval_ms),
            rescan_interval: Duration::from_secs(s.rescan_interval_secs),
            claim_min_idle: Duration::from_millis(s.claim_min_idle_ms),
            max_deliveries: s.max_deliveries,
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        let s = &self.queue;
        QueueConfig {
            namespace: s.namespace.clone(),
            tpm_budget: s.tpm_budget,
            budget_ratio: s.budget_ratio,
            tpm_window: Duration::from_secs(s.tpm_window_secs),
            default_backoff: Duration::from_millis(s.default_backoff_ms),
            max_backoff: Duration::from_millis(s.max_backoff_ms),
            idle: Duration::from_millis(s.idle_ms),
            poll_interval: Duration::from_millis(s.poll_interval_ms),
            max_wait: Duration::from_secs(s.max_wait_secs),
        }
    }

    pub fn lock_config(&self) -> LockConfig {
        let s = &self.lock;
        LockConfig {
            namespace: s.namespace.clone(),
            ttl: Duration::from_millis(s.ttl_ms),
            poll_interval: Duration::from_millis(s.poll_interval_ms),
            max_attempts: s.max_attempts,
        }
    }

    pub fn run_timeout(&self) -> Result<chrono::Duration> {
        chrono::TimeDelta::try_seconds(self.runs.timeout_secs).with_context(|| {
            format!(
                "runs.timeout_secs is out of range: {}",
                self.runs.timeout_secs
            )
        })
    }
}

/// Resolved configuration: the parsed file plus environment and CLI overrides.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    /// The file settings came from, if any.
    pub source: Option<PathBuf>,
    pub toml: RunweaveToml,
    pub verbose: bool,
}

impl Config {
    /// Load from `config_path`, or from `.runweave/runweave.toml` under
    /// `project_dir` when that exists, then apply the process environment.
    pub fn load(project_dir: &Path, config_path: Option<&Path>, verbose: bool) -> Result<Self> {
        let default_path = project_dir.join(CONFIG_DIR).join(CONFIG_FILE);
        let (toml, source) = match config_path {
            Some(path) => (RunweaveToml::load(path)?, Some(path.to_path_buf())),
            None if default_path.exists() => (RunweaveToml::load(&default_path)?, Some(default_path)),
            None => (RunweaveToml::default(), None),
        };
        let mut config = Self {
            project_dir: project_dir.to_path_buf(),
            source,
            toml,
            verbose,
        };
        config
            .toml
            .apply_env_with(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn default_config_path(&self) -> PathBuf {
        self.project_dir.join(CONFIG_DIR).join(CONFIG_FILE)
    }

    /// Resolve a configured path against the project directory.
    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }

    pub fn events_path(&self) -> PathBuf {
        self.resolve(&self.toml.store.events_path)
    }

    pub fn broker_path(&self) -> PathBuf {
        self.resolve(&self.toml.store.broker_path)
    }

    pub fn log_directory(&self) -> Option<PathBuf> {
        self.toml.logging.directory.as_deref().map(|d| self.resolve(d))
    }
}
