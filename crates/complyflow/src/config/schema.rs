use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::Backoff;
use crate::secrets::expand_home;
use crate::worker::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    /// SQLite file holding documents, the ledger, domain rows and queues.
    #[serde(default)]
    pub database_path: Option<String>,
    /// Root directory of the object store.
    pub storage_root: String,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub retry: StageRetryConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub planning: PlanningConfig,
}

impl Config {
    /// Configured database path, or `~/.complyflow/data/complyflow.db`.
    pub fn database_path(&self) -> PathBuf {
        match &self.database_path {
            Some(path) => PathBuf::from(expand_home(path)),
            None => crate::db::default_database_path()
                .unwrap_or_else(|| PathBuf::from("complyflow.db")),
        }
    }

    pub fn storage_root(&self) -> PathBuf {
        PathBuf::from(expand_home(&self.storage_root))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::Plain,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    /// Threads serving the extraction and categorization queues.
    #[serde(default = "default_worker_count")]
    pub extractor: usize,
    #[serde(default = "default_worker_count")]
    pub planner: usize,
    #[serde(default = "default_worker_count")]
    pub reporter: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// An in-progress stage older than this is considered abandoned.
    #[serde(default = "default_lease_timeout_secs")]
    pub lease_timeout_secs: u64,
    /// Redelivery delay for a message whose stage cannot start yet.
    #[serde(default = "default_defer_delay_ms")]
    pub defer_delay_ms: u64,
}

fn default_worker_count() -> usize {
    num_cpus::get().clamp(1, 4)
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_lease_timeout_secs() -> u64 {
    900
}

fn default_defer_delay_ms() -> u64 {
    2_000
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            extractor: default_worker_count(),
            planner: default_worker_count(),
            reporter: default_worker_count(),
            poll_interval_ms: default_poll_interval_ms(),
            lease_timeout_secs: default_lease_timeout_secs(),
            defer_delay_ms: default_defer_delay_ms(),
        }
    }
}

impl WorkersConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease_timeout(&self) -> Duration {
        Duration::from_secs(self.lease_timeout_secs)
    }

    pub fn defer_delay(&self) -> Duration {
        Duration::from_millis(self.defer_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    /// Receives without an ack before a message is dead-lettered.
    #[serde(default = "default_max_receives")]
    pub max_receives: u32,
    /// Redrives allowed per document stage and generation.
    #[serde(default = "default_max_redrives")]
    pub max_redrives: u32,
}

fn default_visibility_timeout_secs() -> u64 {
    300
}

fn default_max_receives() -> u32 {
    5
}

fn default_max_redrives() -> u32 {
    3
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: default_visibility_timeout_secs(),
            max_receives: default_max_receives(),
            max_redrives: default_max_redrives(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default = "default_enqueue_attempts")]
    pub enqueue_attempts: u32,
    #[serde(default = "default_enqueue_backoff_ms")]
    pub enqueue_backoff_ms: u64,
}

fn default_enqueue_attempts() -> u32 {
    5
}

fn default_enqueue_backoff_ms() -> u64 {
    200
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            enqueue_attempts: default_enqueue_attempts(),
            enqueue_backoff_ms: default_enqueue_backoff_ms(),
        }
    }
}

/// Exponential backoff bounds plus an attempt budget.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    2_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }

    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff: self.backoff(),
        }
    }
}

/// Stage-level retry budget with optional per-stage overrides keyed by
/// stage name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageRetryConfig {
    #[serde(flatten)]
    pub default: RetryConfig,
    #[serde(default)]
    pub stages: HashMap<String, RetryConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    /// API key given inline. Prefer `api_key_file` or `api_key_env_var`.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub api_key_file: Option<String>,
    #[serde(default = "default_api_key_env_var")]
    pub api_key_env_var: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Transport attempts per request, the first one included.
    #[serde(default = "default_model_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_model_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_model_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_total_wait_secs")]
    pub max_total_wait_secs: u64,
    /// Consecutive failed invocations that open the circuit breaker.
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,
    #[serde(default = "default_breaker_cooldown_secs")]
    pub breaker_cooldown_secs: u64,
}

fn default_endpoint() -> String {
    "https://api.anthropic.com/v1/messages".to_string()
}

fn default_model_id() -> String {
    "claude-3-5-sonnet-latest".to_string()
}

fn default_api_key_env_var() -> Option<String> {
    Some("COMPLYFLOW_MODEL_API_KEY".to_string())
}

fn default_max_tokens() -> u32 {
    4_096
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_model_max_retries() -> u32 {
    4
}

fn default_model_base_delay_ms() -> u64 {
    1_000
}

fn default_model_max_delay_ms() -> u64 {
    30_000
}

fn default_max_total_wait_secs() -> u64 {
    120
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_cooldown_secs() -> u64 {
    60
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            model_id: default_model_id(),
            api_key: None,
            api_key_file: None,
            api_key_env_var: default_api_key_env_var(),
            max_tokens: default_max_tokens(),
            temperature: 0.0,
            timeout_secs: default_timeout_secs(),
            max_retries: default_model_max_retries(),
            base_delay_ms: default_model_base_delay_ms(),
            max_delay_ms: default_model_max_delay_ms(),
            max_total_wait_secs: default_max_total_wait_secs(),
            breaker_threshold: default_breaker_threshold(),
            breaker_cooldown_secs: default_breaker_cooldown_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanningConfig {
    /// Let the model rewrite template task titles and descriptions.
    #[serde(default)]
    pub refine_with_model: bool,
}
