//! Sink configuration file support
//!
//! Handles parsing of TOML (or JSON, by file extension) configuration files,
//! environment variable overrides and validation.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::logging::{LogConfig, LogLevel};
use crate::schema::{CompileOptions, DEFAULT_DECIMAL_PRECISION, DEFAULT_DECIMAL_SCALE};

/// Default ClickHouse HTTP endpoint
pub const DEFAULT_CLICKHOUSE_URL: &str = "http://localhost:8123";

/// Environment variable for the ClickHouse endpoint
pub const ENV_CLICKHOUSE_URL: &str = "SINK_CLICKHOUSE_URL";

/// Environment variable for the ClickHouse database
pub const ENV_CLICKHOUSE_DATABASE: &str = "SINK_CLICKHOUSE_DATABASE";

/// Environment variable for the ClickHouse user
pub const ENV_CLICKHOUSE_USER: &str = "SINK_CLICKHOUSE_USER";

/// Environment variable for the ClickHouse password
pub const ENV_CLICKHOUSE_PASSWORD: &str = "SINK_CLICKHOUSE_PASSWORD";

/// Environment variable for the insert batch size
pub const ENV_BATCH_SIZE: &str = "SINK_BATCH_SIZE";

/// Environment variable for the log level
pub const ENV_LOG_LEVEL: &str = "SINK_LOG_LEVEL";

/// Error type for configuration handling
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type for configuration handling
pub type ConfigResult<T> = Result<T, ConfigError>;

/// ClickHouse connection section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClickHouseConfig {
    /// HTTP endpoint
    #[serde(default = "default_url")]
    pub url: String,

    /// Target database
    #[serde(default = "default_database")]
    pub database: String,

    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Per-request timeout
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Retries of idempotent statements after transient failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry; doubles on each further retry
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

fn default_url() -> String {
    DEFAULT_CLICKHOUSE_URL.to_string()
}

fn default_database() -> String {
    "default".to_string()
}

fn default_user() -> String {
    "default".to_string()
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    100
}

impl Default for ClickHouseConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            database: default_database(),
            user: default_user(),
            password: None,
            request_timeout_secs: default_request_timeout_secs(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
        }
    }
}

/// Ingestion section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Rows per table buffered before a flush
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Idle time after the last row before a partial batch is flushed
    #[serde(default = "default_idle_flush_ms")]
    pub idle_flush_ms: u64,

    /// Key tuples per delete mutation
    #[serde(default = "default_delete_batch_size")]
    pub delete_batch_size: usize,

    /// Coerce values to their column types
    #[serde(default = "default_true")]
    pub translate_values: bool,

    /// Clean-first runs truncate canonical tables instead of staging
    #[serde(default)]
    pub direct_insert: bool,

    #[serde(default = "default_decimal_precision")]
    pub decimal_precision: u8,

    #[serde(default = "default_decimal_scale")]
    pub decimal_scale: u8,
}

fn default_batch_size() -> usize {
    10_000
}

fn default_idle_flush_ms() -> u64 {
    5_000
}

fn default_delete_batch_size() -> usize {
    1_000
}

fn default_true() -> bool {
    true
}

fn default_decimal_precision() -> u8 {
    DEFAULT_DECIMAL_PRECISION
}

fn default_decimal_scale() -> u8 {
    DEFAULT_DECIMAL_SCALE
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            idle_flush_ms: default_idle_flush_ms(),
            delete_batch_size: default_delete_batch_size(),
            translate_values: true,
            direct_insert: false,
            decimal_precision: default_decimal_precision(),
            decimal_scale: default_decimal_scale(),
        }
    }
}

impl IngestConfig {
    /// Idle flush interval
    pub fn idle_flush(&self) -> Duration {
        Duration::from_millis(self.idle_flush_ms)
    }

    /// Options for the schema compiler
    pub fn compile_options(&self) -> CompileOptions {
        CompileOptions {
            direct_insert: self.direct_insert,
            decimal_precision: self.decimal_precision,
            decimal_scale: self.decimal_scale,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SinkConfig {
    #[serde(default)]
    pub clickhouse: ClickHouseConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub logging: LogConfig,
}

impl SinkConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration file, apply environment overrides and validate.
    ///
    /// Files ending in `.json` are parsed as JSON, everything else as TOML.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ConfigError::IoError(format!("Failed to read {}: {}", path.display(), e))
        })?;

        let mut config = if path.extension().is_some_and(|ext| ext == "json") {
            Self::parse_json(&content)?
        } else {
            Self::parse(&content)?
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from TOML string
    pub fn parse(content: &str) -> ConfigResult<Self> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Parse configuration from JSON string
    pub fn parse_json(content: &str) -> ConfigResult<Self> {
        serde_json::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Convert configuration to TOML string
    pub fn to_toml(&self) -> ConfigResult<String> {
        toml::to_string_pretty(self).map_err(|e| {
            ConfigError::SerializationError(format!("Failed to serialize config: {}", e))
        })
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable source
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_CLICKHOUSE_URL) {
            self.clickhouse.url = url;
        }

        if let Some(database) = lookup(ENV_CLICKHOUSE_DATABASE) {
            self.clickhouse.database = database;
        }

        if let Some(user) = lookup(ENV_CLICKHOUSE_USER) {
            self.clickhouse.user = user;
        }

        if let Some(password) = lookup(ENV_CLICKHOUSE_PASSWORD) {
            self.clickhouse.password = Some(password);
        }

        if let Some(size) = lookup(ENV_BATCH_SIZE)
            && let Ok(size) = size.parse()
        {
            self.ingest.batch_size = size;
        }

        if let Some(level) = lookup(ENV_LOG_LEVEL)
            && let Ok(level) = level.parse::<LogLevel>()
        {
            self.logging.level = level;
        }
    }

    /// Check value ranges
    pub fn validate(&self) -> ConfigResult<()> {
        let url = &self.clickhouse.url;
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "clickhouse.url must be an http(s) URL, got '{}'",
                url
            )));
        }
        if self.clickhouse.database.is_empty() {
            return Err(ConfigError::Invalid(
                "clickhouse.database must not be empty".to_string(),
            ));
        }
        if self.ingest.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "ingest.batch_size must be positive".to_string(),
            ));
        }
        if self.ingest.delete_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "ingest.delete_batch_size must be positive".to_string(),
            ));
        }
        if self.ingest.idle_flush_ms == 0 {
            return Err(ConfigError::Invalid(
                "ingest.idle_flush_ms must be positive".to_string(),
            ));
        }
        let (precision, scale) = (self.ingest.decimal_precision, self.ingest.decimal_scale);
        if precision == 0 || precision > 76 || scale > precision {
            return Err(ConfigError::Invalid(format!(
                "invalid decimal precision/scale {}/{}",
                precision, scale
            )));
        }
        Ok(())
    }
}

/// Generate a sample configuration file content
pub fn sample_config() -> &'static str {
    r#"# Sink configuration

[clickhouse]
url = "http://localhost:8123"
database = "default"
user = "default"
# password = "..."
request_timeout_secs = 300
max_retries = 3
retry_backoff_ms = 100

[ingest]
# Rows buffered per table before a flush
batch_size = 10000
# Flush a partial batch after this much idle time
idle_flush_ms = 5000
delete_batch_size = 1000
translate_values = true
# Clean-first runs truncate the canonical tables instead of staging
direct_insert = false
decimal_precision = 10
decimal_scale = 2

[logging]
level = "info"
format = "text"
"#
}
