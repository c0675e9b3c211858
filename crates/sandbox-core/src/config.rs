//! Configuration for the execution daemon.
//!
//! Simple `key=value` file format with `#` comments and optional quotes.
//! Precedence: CLI flags > environment > config file > defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::request::RequestLimits;

/// Environment variable naming the workspace root.
pub const WORKSPACE_DIR_ENV: &str = "WORKSPACE_DIR";

/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "SANDBOXD_CONFIG";

/// Workspace root used when nothing else is configured.
pub const DEFAULT_WORKSPACE_ROOT: &str = "/workspace";

/// Upper bound on the default concurrency limit.
const DEFAULT_MAX_CONCURRENT_CAP: usize = 4;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("invalid config line: {0}")]
    InvalidLine(String),
    #[error("invalid integer value for {key}: {value}")]
    InvalidInt { key: String, value: String },
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
    #[error("unknown config key: {0}")]
    UnknownKey(String),
}

/// What to do with a request when every execution slot is busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backpressure {
    /// Hold the request as `Pending` in FIFO order.
    #[default]
    Queue,
    /// Refuse the request with `TooManyRequests`.
    Reject,
}

impl Backpressure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queue => "queue",
            Self::Reject => "reject",
        }
    }
}

/// Daemon configuration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    // Workspace
    pub workspace_root: PathBuf,
    /// Permission bits applied to the root on creation (Unix only).
    pub workspace_mode: u32,
    /// Top-level entries that survive a workspace reset.
    pub reserved_entries: Vec<String>,

    // Process runner
    pub shell: String,
    pub default_timeout_sec: u64,
    pub max_timeout_sec: u64,
    pub grace_period_ms: u64,
    /// Per-stream capture limit.
    pub max_output_bytes: usize,

    // Admission
    pub max_concurrent: usize,
    pub backpressure: Backpressure,
    /// Pending executions allowed in queue mode.
    pub max_queued: usize,

    // Results
    pub max_wait_sec: u64,
    pub retention_count: usize,
    pub retention_age_sec: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from(DEFAULT_WORKSPACE_ROOT),
            workspace_mode: 0o777,
            reserved_entries: Vec::new(),
            shell: "/bin/sh".to_string(),
            default_timeout_sec: 30,
            max_timeout_sec: 3600,
            grace_period_ms: 2000,
            max_output_bytes: 10 * 1024 * 1024,
            max_concurrent: default_max_concurrent(),
            backpressure: Backpressure::Queue,
            max_queued: 64,
            max_wait_sec: 300,
            retention_count: 256,
            retention_age_sec: 3600,
        }
    }
}

/// Available cores, capped to keep the default small.
pub fn default_max_concurrent() -> usize {
    std::thread::available_parallelism()
        .map_or(1, std::num::NonZeroUsize::get)
        .clamp(1, DEFAULT_MAX_CONCURRENT_CAP)
}

impl Config {
    /// Load config from a file, merging with defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_file(path)?;
        Ok(config)
    }

    /// Load and merge values from a config file.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path)?;
        self.parse_content(&content)
    }

    /// Config file to load when none is given explicitly.
    ///
    /// `$SANDBOXD_CONFIG`, else `<config_dir>/sandboxd/config` when it exists.
    pub fn default_path() -> Option<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_PATH_ENV) {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir()
            .map(|d| d.join("sandboxd").join("config"))
            .filter(|p| p.is_file())
    }

    /// Apply environment overrides (`WORKSPACE_DIR`).
    pub fn apply_env(&mut self) {
        if let Some(root) = std::env::var_os(WORKSPACE_DIR_ENV) {
            if !root.is_empty() {
                self.workspace_root = PathBuf::from(root);
            }
        }
    }

    /// Parse config content (key=value format).
    pub fn parse_content(&mut self, content: &str) -> Result<(), ConfigError> {
        for line in content.lines() {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(ConfigError::InvalidLine(line.to_string()));
            };

            let key = key.trim();
            let value = Self::unquote(value.trim());

            self.apply_value(key, &value)?;
        }
        self.check()
    }

    /// Remove surrounding quotes from a value.
    fn unquote(value: &str) -> String {
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            return value[1..value.len() - 1].to_string();
        }
        value.to_string()
    }

    fn apply_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "workspace_root" => self.workspace_root = PathBuf::from(value),
            "workspace_mode" => {
                let digits = value.trim_start_matches("0o");
                self.workspace_mode =
                    u32::from_str_radix(digits, 8).map_err(|_| ConfigError::InvalidValue {
                        key: key.to_string(),
                        reason: format!("'{value}' is not an octal mode"),
                    })?;
            }
            "reserved_entries" => {
                self.reserved_entries = value
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            "shell" => self.shell = value.to_string(),
            "default_timeout_sec" => self.default_timeout_sec = Self::parse_int(key, value)?,
            "max_timeout_sec" => self.max_timeout_sec = Self::parse_int(key, value)?,
            "grace_period_ms" => self.grace_period_ms = Self::parse_int(key, value)?,
            "max_output_bytes" => self.max_output_bytes = Self::parse_int(key, value)?,
            "max_concurrent" => self.max_concurrent = Self::parse_int(key, value)?,
            "backpressure" => {
                self.backpressure = match value {
                    "queue" => Backpressure::Queue,
                    "reject" => Backpressure::Reject,
                    _ => {
                        return Err(ConfigError::InvalidLine(format!(
                            "backpressure must be 'queue' or 'reject', got '{value}'"
                        )))
                    }
                }
            }
            "max_queued" => self.max_queued = Self::parse_int(key, value)?,
            "max_wait_sec" => self.max_wait_sec = Self::parse_int(key, value)?,
            "retention_count" => self.retention_count = Self::parse_int(key, value)?,
            "retention_age_sec" => self.retention_age_sec = Self::parse_int(key, value)?,
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
        value.parse().map_err(|_| ConfigError::InvalidInt {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    /// Reject combinations the engine cannot run with.
    pub fn check(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, reason: &str| {
            Err(ConfigError::InvalidValue {
                key: key.to_string(),
                reason: reason.to_string(),
            })
        };
        if self.max_concurrent == 0 {
            return invalid("max_concurrent", "must be at least 1");
        }
        if self.default_timeout_sec == 0 {
            return invalid("default_timeout_sec", "must be at least 1");
        }
        if self.default_timeout_sec > self.max_timeout_sec {
            return invalid("default_timeout_sec", "must not exceed max_timeout_sec");
        }
        if self.shell.trim().is_empty() {
            return invalid("shell", "must not be empty");
        }
        Ok(())
    }

    pub fn request_limits(&self) -> RequestLimits {
        RequestLimits {
            default_timeout: Duration::from_secs(self.default_timeout_sec),
            max_timeout: Duration::from_secs(self.max_timeout_sec),
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_sec)
    }

    pub fn retention_age(&self) -> Duration {
        Duration::from_secs(self.retention_age_sec)
    }
}
