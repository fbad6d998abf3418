//! Configuration module for chandrive.

use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

use crate::{DriveError, Result};

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite catalog file.
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "data/chandrive.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// One transport tier and its single-message ceiling.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TierConfig {
    /// Tier name as understood by the transport (e.g. "bot", "client").
    pub name: String,
    /// Largest message the tier accepts, in bytes.
    pub ceiling_bytes: u64,
}

fn default_tiers() -> Vec<TierConfig> {
    vec![
        TierConfig {
            name: "bot".to_string(),
            ceiling_bytes: 50 * 1024 * 1024,
        },
        TierConfig {
            name: "client".to_string(),
            ceiling_bytes: 2000 * 1024 * 1024,
        },
    ]
}

/// Retry behaviour for transient transport failures.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Attempts per chunk, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    /// Upper bound for the doubling backoff, in milliseconds.
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    4
}

fn default_initial_backoff() -> u64 {
    200
}

fn default_max_backoff() -> u64 {
    5000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

/// Storage engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Transport tier capability table.
    #[serde(default = "default_tiers")]
    pub tiers: Vec<TierConfig>,
    /// Maximum number of chunks a single blob may be split into.
    #[serde(default = "default_max_chunks")]
    pub max_chunks_per_blob: u32,
    /// Chunks in flight at once during an upload.
    #[serde(default = "default_upload_concurrency")]
    pub upload_concurrency: usize,
    /// Chunks fetched ahead of the consumer during a download.
    #[serde(default = "default_download_concurrency")]
    pub download_concurrency: usize,
    /// Retry policy for transient transport failures.
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_max_chunks() -> u32 {
    64
}

fn default_upload_concurrency() -> usize {
    2
}

fn default_download_concurrency() -> usize {
    4
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            tiers: default_tiers(),
            max_chunks_per_blob: default_max_chunks(),
            upload_concurrency: default_upload_concurrency(),
            download_concurrency: default_download_concurrency(),
            retry: RetryConfig::default(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Path to the log file.
    #[serde(default = "default_log_file")]
    pub file: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "logs/chandrive.log".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: default_log_file(),
        }
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Database configuration.
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Storage engine configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(DriveError::Io)?;
        Self::parse(&content)
    }

    /// Load configuration from a TOML file and apply environment variable overrides.
    pub fn load_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| DriveError::Validation(format!("config parse error: {e}")))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Supported environment variables:
    /// - `CHANDRIVE_DATABASE_PATH`: Override the catalog location
    /// - `CHANDRIVE_LOG_LEVEL`: Override the log level
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("CHANDRIVE_DATABASE_PATH") {
            if !path.is_empty() {
                self.database.path = path;
            }
        }
        if let Ok(level) = std::env::var("CHANDRIVE_LOG_LEVEL") {
            if !level.is_empty() {
                self.logging.level = level;
            }
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        let storage = &self.storage;

        if storage.tiers.is_empty() {
            return Err(DriveError::Config(
                "storage.tiers must list at least one tier".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for tier in &storage.tiers {
            if tier.name.trim().is_empty() {
                return Err(DriveError::Config("tier name must not be empty".to_string()));
            }
            if tier.ceiling_bytes == 0 {
                return Err(DriveError::Config(format!(
                    "tier {} has a zero ceiling",
                    tier.name
                )));
            }
            if !seen.insert(tier.name.as_str()) {
                return Err(DriveError::Config(format!(
                    "tier {} is listed twice",
                    tier.name
                )));
            }
        }

        if storage.max_chunks_per_blob == 0 {
            return Err(DriveError::Config(
                "max_chunks_per_blob must be at least 1".to_string(),
            ));
        }
        if storage.upload_concurrency == 0 || storage.download_concurrency == 0 {
            return Err(DriveError::Config(
                "concurrency windows must be at least 1".to_string(),
            ));
        }
        if storage.retry.max_attempts == 0 {
            return Err(DriveError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if storage.retry.initial_backoff_ms > storage.retry.max_backoff_ms {
            return Err(DriveError::Config(
                "retry.initial_backoff_ms exceeds retry.max_backoff_ms".to_string(),
            ));
        }

        Ok(())
    }
}
