use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration, loaded from a TOML file. Every section and field
/// has a default so a missing file yields a usable development setup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

impl Config {
    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(cfg)
    }

    /// Load from `path` when it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path: PathBuf = path.into();
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Config::default())
        }
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Environment variable holding the process-level vault secret.
    #[serde(default = "default_secret_env")]
    pub secret_env: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            secret_env: default_secret_env(),
        }
    }
}

fn default_secret_env() -> String {
    "WORKSYNC_SECRET".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("worksync.db")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Worker pool size.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Maximum queued (not yet running) jobs before `enqueue` refuses.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay for exponential backoff between attempts, in milliseconds.
    #[serde(default = "default_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Grace period for draining in-flight jobs on shutdown, in seconds.
    #[serde(default = "default_drain_secs")]
    pub drain_grace_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            capacity: default_capacity(),
            max_attempts: default_max_attempts(),
            retry_backoff_ms: default_backoff_ms(),
            drain_grace_secs: default_drain_secs(),
        }
    }
}

fn default_workers() -> usize {
    5
}
fn default_capacity() -> usize {
    100
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    1_000
}
fn default_drain_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Tick resolution for evaluating cron entries, in seconds.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
        }
    }
}

fn default_tick_secs() -> u64 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// `Some(key)` enforces API-key auth on admin routes; `None` allows all
    /// (development mode). The webhook receive route is always open — it is
    /// authenticated by HMAC signatures instead.
    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            api_key: None,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8601".to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
