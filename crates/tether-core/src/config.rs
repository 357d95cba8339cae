//! Configuration loading for Tether.
//!
//! Settings come from a YAML file (`tether.yml`). Every key is optional;
//! missing keys take the defaults below.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// File names probed when no explicit config path is given.
pub const CONFIG_CANDIDATES: [&str; 2] = ["tether.yml", "tether.yaml"];

/// Scheduler and coordinator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TetherConfig {
    /// Lease budget for automated tasks. `None` disables expiry.
    #[serde(default = "default_automated_timeout_secs")]
    pub automated_timeout_secs: Option<u64>,

    /// Lease budget for human-driven tasks. Unbounded by default.
    #[serde(default)]
    pub human_timeout_secs: Option<u64>,

    /// Longest the scheduler waits for a stack abort to free the runner.
    #[serde(default = "default_abort_grace_secs")]
    pub abort_grace_secs: u64,

    /// Fallback tick for condition waiters.
    #[serde(default = "default_waiter_poll_ms")]
    pub waiter_poll_ms: u64,

    /// Message subtype that marks a root task as finished.
    #[serde(default = "default_completion_tag")]
    pub completion_tag: String,

    /// Start with the automated queue administratively paused.
    #[serde(default)]
    pub start_paused: bool,
}

#[allow(clippy::unnecessary_wraps)]
fn default_automated_timeout_secs() -> Option<u64> {
    Some(600)
}

fn default_abort_grace_secs() -> u64 {
    30
}

fn default_waiter_poll_ms() -> u64 {
    1000
}

fn default_completion_tag() -> String {
    "completion_result".to_string()
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            automated_timeout_secs: default_automated_timeout_secs(),
            human_timeout_secs: None,
            abort_grace_secs: default_abort_grace_secs(),
            waiter_poll_ms: default_waiter_poll_ms(),
            completion_tag: default_completion_tag(),
            start_paused: false,
        }
    }
}

impl TetherConfig {
    /// Loads and validates a config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    /// Parses and validates YAML text. Empty input yields the defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Finds the first candidate config file in `dir`.
    pub fn discover(dir: impl AsRef<Path>) -> Option<PathBuf> {
        CONFIG_CANDIDATES
            .iter()
            .map(|name| dir.as_ref().join(name))
            .find(|path| path.is_file())
    }

    /// Rejects zero durations and an empty completion tag.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.automated_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "automated_timeout_secs must be greater than 0 (use null to disable)".into(),
            ));
        }
        if self.human_timeout_secs == Some(0) {
            return Err(ConfigError::Invalid(
                "human_timeout_secs must be greater than 0 (use null to disable)".into(),
            ));
        }
        if self.waiter_poll_ms == 0 {
            return Err(ConfigError::Invalid(
                "waiter_poll_ms must be greater than 0".into(),
            ));
        }
        if self.completion_tag.trim().is_empty() {
            return Err(ConfigError::Invalid("completion_tag must not be empty".into()));
        }
        Ok(())
    }

    pub fn automated_timeout(&self) -> Option<Duration> {
        self.automated_timeout_secs.map(Duration::from_secs)
    }

    pub fn human_timeout(&self) -> Option<Duration> {
        self.human_timeout_secs.map(Duration::from_secs)
    }

    pub fn abort_grace(&self) -> Duration {
        Duration::from_secs(self.abort_grace_secs)
    }

    pub fn waiter_poll(&self) -> Duration {
        Duration::from_millis(self.waiter_poll_ms)
    }
}
