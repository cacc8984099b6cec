//! Configuration management with file persistence

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

/// Tempograph configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub llm: LlmConfig,
    pub circuit: CircuitConfig,
    pub retry: RetryConfig,
    pub degradation: DegradationConfig,
    pub ingestion: IngestionConfig,
    pub storage: StorageConfig,
    pub notifications: NotificationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    #[serde(skip)]
    pub api_key: Option<String>,
    pub base_url: String,
    pub extraction_model: String,
    pub embedding_model: String,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://openrouter.ai/api/v1".to_string(),
            extraction_model: "anthropic/claude-3-5-haiku-latest".to_string(),
            embedding_model: "openai/text-embedding-3-small".to_string(),
            timeout_secs: 60,
        }
    }
}

/// Whether embedding and extraction calls share one failure counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitScope {
    #[default]
    Shared,
    PerCallType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    pub half_open_max_calls: u32,
    pub probe_interval_secs: u64,
    pub scope: CircuitScope,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_secs: 60,
            half_open_max_calls: 3,
            probe_interval_secs: 300,
            scope: CircuitScope::Shared,
        }
    }
}

impl CircuitConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_secs)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_schedule_secs: Vec<u64>,
    pub max_ledger_size: usize,
    pub drain_interval_secs: u64,
    pub drain_batch_size: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            // 5m, 15m, 45m, 2h, 6h
            backoff_schedule_secs: vec![300, 900, 2700, 7200, 21600],
            max_ledger_size: 10_000,
            drain_interval_secs: 60,
            drain_batch_size: 100,
        }
    }
}

impl RetryConfig {
    pub fn backoff_schedule(&self) -> Vec<Duration> {
        self.backoff_schedule_secs
            .iter()
            .map(|secs| Duration::from_secs(*secs))
            .collect()
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_secs(self.drain_interval_secs)
    }
}

/// What to do with an episode while the inference provider is unavailable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationPolicy {
    /// Reject the episode with a classified error
    Fail,
    /// Commit the raw episode, never retry
    StoreRawOnly,
    /// Commit the raw episode and schedule it on the retry ledger
    #[default]
    StoreRawAndRetry,
}

impl DegradationPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fail => "fail",
            Self::StoreRawOnly => "store_raw_only",
            Self::StoreRawAndRetry => "store_raw_and_retry",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradationConfig {
    pub policy: DegradationPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestionConfig {
    pub episode_timeout_secs: u64,
    pub embedding_concurrency: usize,
    pub provider_call_timeout_secs: u64,
    pub group_idle_grace_ms: u64,
    pub status_cache_size: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            episode_timeout_secs: 300,
            embedding_concurrency: 10,
            provider_call_timeout_secs: 30,
            group_idle_grace_ms: 500,
            status_cache_size: 10_000,
        }
    }
}

impl IngestionConfig {
    pub fn episode_timeout(&self) -> Duration {
        Duration::from_secs(self.episode_timeout_secs)
    }

    pub fn provider_call_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_call_timeout_secs)
    }

    pub fn group_idle_grace(&self) -> Duration {
        Duration::from_millis(self.group_idle_grace_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file; `None` uses the default data directory
    pub database_path: Option<PathBuf>,
    pub max_connections: u32,
    pub operation_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            max_connections: 5,
            operation_timeout_secs: 10,
        }
    }
}

impl StorageConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub webhook_url: Option<String>,
    pub webhook_timeout_secs: u64,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            webhook_timeout_secs: 10,
        }
    }
}

impl LlmConfig {
    pub fn resolved_api_key(&self) -> anyhow::Result<Option<String>> {
        self.enforce_env_only()?;

        Ok(env::var("TEMPOGRAPH_API_KEY")
            .or_else(|_| env::var("OPENROUTER_API_KEY"))
            .ok())
    }

    pub fn enforce_env_only(&self) -> anyhow::Result<()> {
        if self.api_key.is_some() {
            return Err(anyhow!(
                "Inference API keys must be provided via environment variables, not stored in configuration"
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Get the config directory path
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let dir = if let Ok(custom_dir) = env::var("TEMPOGRAPH_CONFIG_DIR") {
            PathBuf::from(custom_dir)
        } else {
            dirs::config_dir()
                .ok_or_else(|| anyhow!("Could not determine config directory"))?
                .join("tempograph")
        };
        Ok(dir)
    }

    /// Get the config file path
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Load configuration from file, or return defaults if it doesn't exist
    pub fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;

        if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self) -> anyhow::Result<()> {
        self.validate()?;

        let dir = Self::config_dir()?;
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create config directory: {}", dir.display()))?;

        let path = Self::config_path()?;
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(&path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.llm.enforce_env_only()?;

        if self.llm.timeout_secs == 0 {
            return Err(anyhow!("llm.timeout_secs must be greater than zero"));
        }
        if self.circuit.failure_threshold == 0 {
            return Err(anyhow!("circuit.failure_threshold must be at least 1"));
        }
        if self.circuit.half_open_max_calls == 0 {
            return Err(anyhow!("circuit.half_open_max_calls must be at least 1"));
        }
        if self.circuit.probe_interval_secs == 0 {
            return Err(anyhow!("circuit.probe_interval_secs must be greater than zero"));
        }
        if self.retry.max_attempts == 0 {
            return Err(anyhow!("retry.max_attempts must be at least 1"));
        }
        if self.retry.backoff_schedule_secs.is_empty() {
            return Err(anyhow!("retry.backoff_schedule_secs must not be empty"));
        }
        if self
            .retry
            .backoff_schedule_secs
            .windows(2)
            .any(|pair| pair[1] < pair[0])
        {
            return Err(anyhow!("retry.backoff_schedule_secs must be non-decreasing"));
        }
        if self.retry.max_ledger_size == 0 {
            return Err(anyhow!("retry.max_ledger_size must be at least 1"));
        }
        if self.retry.drain_interval_secs == 0 {
            return Err(anyhow!("retry.drain_interval_secs must be greater than zero"));
        }
        if self.ingestion.embedding_concurrency == 0 {
            return Err(anyhow!("ingestion.embedding_concurrency must be at least 1"));
        }
        if self.ingestion.episode_timeout_secs == 0 || self.ingestion.provider_call_timeout_secs == 0 {
            return Err(anyhow!("ingestion timeouts must be greater than zero"));
        }
        if self.storage.operation_timeout_secs == 0 {
            return Err(anyhow!("storage.operation_timeout_secs must be greater than zero"));
        }
        if self.storage.max_connections == 0 {
            return Err(anyhow!("storage.max_connections must be at least 1"));
        }
        Ok(())
    }

    /// Reset configuration to defaults
    pub fn reset() -> anyhow::Result<()> {
        let path = Self::config_path()?;
        if path.exists() {
            fs::remove_file(&path)
                .with_context(|| format!("Failed to remove config file: {}", path.display()))?;
        }
        Ok(())
    }
}
