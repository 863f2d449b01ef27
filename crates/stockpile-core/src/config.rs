//! Stockpile configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, StockpileError};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StockpileConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub collectors: CollectorsConfig,
}

/// Scheduler loop and execution engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between due-task scans.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Backoff after a scan-loop error before retrying the loop.
    #[serde(default = "default_error_backoff_secs")]
    pub error_backoff_secs: u64,
    /// Maximum concurrently running executions.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Maximum due tasks fetched per scan.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Wall-clock bound on a single collect+store attempt.
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,
    /// Base of the exponential retry backoff (`base * 2^retry_count`).
    #[serde(default = "default_retry_backoff_base_secs")]
    pub retry_backoff_base_secs: u64,
    /// Cap on the retry backoff.
    #[serde(default = "default_retry_backoff_cap_secs")]
    pub retry_backoff_cap_secs: u64,
    /// RUNNING tasks older than this at startup are swept back to PENDING.
    #[serde(default = "default_stale_running_grace_secs")]
    pub stale_running_grace_secs: u64,
}

fn default_tick_secs() -> u64 { 10 }
fn default_error_backoff_secs() -> u64 { 30 }
fn default_max_concurrent() -> usize { 5 }
fn default_batch_size() -> usize { 20 }
fn default_attempt_timeout_secs() -> u64 { 300 }
fn default_retry_backoff_base_secs() -> u64 { 60 }
fn default_retry_backoff_cap_secs() -> u64 { 3600 }
fn default_stale_running_grace_secs() -> u64 { 1800 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            error_backoff_secs: default_error_backoff_secs(),
            max_concurrent: default_max_concurrent(),
            batch_size: default_batch_size(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            retry_backoff_base_secs: default_retry_backoff_base_secs(),
            retry_backoff_cap_secs: default_retry_backoff_cap_secs(),
            stale_running_grace_secs: default_stale_running_grace_secs(),
        }
    }
}

/// Task database settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database path.
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String { "~/.stockpile/stockpile.db".into() }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

/// Settings shared by the concrete collectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorsConfig {
    /// Base URL of the upstream stock data API.
    #[serde(default = "default_stock_api_base_url")]
    pub stock_api_base_url: String,
    /// API key for the upstream stock data API.
    #[serde(default)]
    pub stock_api_key: String,
    /// Directory collected payloads are written into.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Per-request HTTP timeout for collector fetches.
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
}

fn default_stock_api_base_url() -> String { "https://api.example.com".into() }
fn default_data_dir() -> String { "~/.stockpile/data".into() }
fn default_http_timeout_secs() -> u64 { 30 }

impl Default for CollectorsConfig {
    fn default() -> Self {
        Self {
            stock_api_base_url: default_stock_api_base_url(),
            stock_api_key: String::new(),
            data_dir: default_data_dir(),
            http_timeout_secs: default_http_timeout_secs(),
        }
    }
}

impl StockpileConfig {
    /// Load config from the default path (~/.stockpile/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| StockpileError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| StockpileError::Config(format!("Failed to parse config: {e}")))?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| StockpileError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Stockpile home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".stockpile")
    }

    /// Database path with `~` expanded.
    pub fn database_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.database.path).into_owned())
    }

    /// Data directory with `~` expanded.
    pub fn data_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.collectors.data_dir).into_owned())
    }
}
