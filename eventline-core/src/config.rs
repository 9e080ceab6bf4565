//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/eventline/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/eventline/` (~/.config/eventline/)
//! - Data: `$XDG_DATA_HOME/eventline/` (~/.local/share/eventline/)
//! - State/Logs: `$XDG_STATE_HOME/eventline/` (~/.local/state/eventline/)
//!
//! ## Example
//!
//! ```toml
//! [tracker]
//! api_key = "el_live_xxxxxxxxxxxx"
//! base_url = "https://ingest.example.com"
//! environment = "production"
//!
//! [queue]
//! backend = "auto"
//! capacity = 1000
//!
//! [flush]
//! batch_size = 50
//! flush_interval_secs = 10
//! ```

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides `tracker.api_key`
pub const API_KEY_ENV: &str = "EVENTLINE_API_KEY";

/// Smallest queue capacity the pipeline will run with
pub const MIN_QUEUE_CAPACITY: usize = 10;

/// Largest batch a single request may carry
pub const MAX_BATCH_SIZE: usize = 500;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Endpoint, credentials and event defaults
    #[serde(default)]
    pub tracker: TrackerConfig,

    /// Pending event queue
    #[serde(default)]
    pub queue: QueueConfig,

    /// Flush scheduling
    #[serde(default)]
    pub flush: FlushConfig,

    /// Network delivery
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Endpoint and event defaults
#[derive(Debug, Deserialize, Clone)]
pub struct TrackerConfig {
    /// Enable/disable delivery. Events are still queued when disabled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// API key sent with every batch (can also use `EVENTLINE_API_KEY`)
    pub api_key: Option<String>,

    /// Ingestion server base URL (e.g., `https://ingest.example.com`)
    pub base_url: Option<String>,

    /// Environment tag attached to every event
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Host application version reported in the batch context
    pub app_version: Option<String>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            api_key: None,
            base_url: None,
            environment: default_environment(),
            app_version: None,
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_environment() -> String {
    "production".to_string()
}

impl TrackerConfig {
    /// API key from the environment, falling back to the config file
    pub fn resolved_api_key(&self) -> Option<String> {
        std::env::var(API_KEY_ENV)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| self.api_key.clone())
    }

    /// Base URL without a trailing slash
    pub fn normalized_base_url(&self) -> Option<String> {
        self.base_url
            .as_deref()
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
    }

    /// Check if delivery is enabled and has everything it needs
    pub fn is_ready(&self) -> bool {
        self.enabled && self.normalized_base_url().is_some() && self.resolved_api_key().is_some()
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        let Some(base_url) = self.normalized_base_url() else {
            return Err(Error::Config(
                "tracker.base_url is required when delivery is enabled".to_string(),
            ));
        };
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(Error::Config(format!(
                "tracker.base_url must be an http(s) URL, got {}",
                base_url
            )));
        }
        if self.resolved_api_key().is_none() {
            return Err(Error::Config(
                "tracker.api_key is required when delivery is enabled".to_string(),
            ));
        }
        if self.environment.trim().is_empty() {
            return Err(Error::Config(
                "tracker.environment must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Which queue backend to use
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    /// Durable if the storage probe succeeds, ephemeral otherwise
    #[default]
    Auto,
    /// Always durable; failing to open storage is an error
    Durable,
    /// Always in-process
    Ephemeral,
}

/// Pending event queue configuration
#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    /// Backend selection
    #[serde(default)]
    pub backend: BackendPreference,

    /// Maximum number of pending events (oldest are evicted)
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,

    /// Database path override (defaults to the XDG data dir)
    pub path: Option<PathBuf>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: BackendPreference::default(),
            capacity: default_queue_capacity(),
            path: None,
        }
    }
}

fn default_queue_capacity() -> usize {
    1000
}

impl QueueConfig {
    /// Configured capacity clamped up to [`MIN_QUEUE_CAPACITY`]
    pub fn effective_capacity(&self) -> usize {
        self.capacity.max(MIN_QUEUE_CAPACITY)
    }

    /// Database file the durable backend writes to
    pub fn database_path(&self) -> PathBuf {
        self.path.clone().unwrap_or_else(Config::database_path)
    }
}

/// Flush scheduling configuration
#[derive(Debug, Deserialize, Clone)]
pub struct FlushConfig {
    /// Events per request; also the queue size that triggers a flush
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Seconds between timer-driven flushes (minimum 1)
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    /// Pause between successive successful batches within one flush
    #[serde(default = "default_inter_batch_delay")]
    pub inter_batch_delay_ms: u64,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval_secs: default_flush_interval(),
            inter_batch_delay_ms: default_inter_batch_delay(),
        }
    }
}

fn default_batch_size() -> usize {
    50
}

fn default_flush_interval() -> u64 {
    10
}

fn default_inter_batch_delay() -> u64 {
    50
}

impl FlushConfig {
    /// Timer period, never shorter than one second
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }

    /// Pause between successful batches
    pub fn inter_batch_delay(&self) -> Duration {
        Duration::from_millis(self.inter_batch_delay_ms)
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 || self.batch_size > MAX_BATCH_SIZE {
            return Err(Error::Config(format!(
                "flush.batch_size must be between 1 and {}",
                MAX_BATCH_SIZE
            )));
        }
        Ok(())
    }
}

/// Network delivery configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DeliveryConfig {
    /// Upper bound on a single request, in seconds
    #[serde(default = "default_delivery_timeout")]
    pub timeout_secs: u64,

    /// Cooldown applied when a 429 carries no usable Retry-After
    #[serde(default = "default_retry_after")]
    pub default_retry_after_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_delivery_timeout(),
            default_retry_after_secs: default_retry_after(),
        }
    }
}

fn default_delivery_timeout() -> u64 {
    60
}

fn default_retry_after() -> u64 {
    60
}

impl DeliveryConfig {
    /// Request timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.tracker.validate()?;
        self.flush.validate()?;
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/eventline/config.toml` (~/.config/eventline/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("eventline").join("config.toml")
    }

    /// Returns the data directory path (for the SQLite database)
    ///
    /// `$XDG_DATA_HOME/eventline/` (~/.local/share/eventline/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("eventline")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/eventline/` (~/.local/state/eventline/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("eventline")
    }

    /// Returns the database file path
    ///
    /// `$XDG_DATA_HOME/eventline/eventline.db`
    pub fn database_path() -> PathBuf {
        Self::data_dir().join("eventline.db")
    }

    /// Returns the log file path
    ///
    /// Today's log file, `$XDG_STATE_HOME/eventline/eventline.<YYYY-MM-DD>.log`
    ///
    /// Daily rotation names files by UTC date.
    pub fn log_path() -> PathBuf {
        Self::state_dir().join(format!(
            "eventline.{}.log",
            chrono::Utc::now().format("%Y-%m-%d")
        ))
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}
