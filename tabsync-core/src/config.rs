//! Configuration loading for tabsync.
//!
//! Every field has a default, so an empty TOML document is a valid config.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "TABSYNC_CONFIG";

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Hysteresis applied by `publish` when the caller does not pass one.
    /// `None` persists every change immediately.
    pub default_hysteresis_ms: Option<u64>,
    /// Register flush-all listeners on the host's teardown events.
    pub flush_on_teardown: bool,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// `EnvFilter` directive, e.g. `"tabsync_store=debug"`.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_hysteresis_ms: None,
            flush_on_teardown: true,
            log: LogConfig::default(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

impl SyncConfig {
    /// Load from `--config <path>` or `TABSYNC_CONFIG`, falling back to defaults
    /// when neither is given.
    pub fn load() -> Result<Self, ConfigError> {
        let config = match config_path_from_args().or_else(config_path_from_env) {
            Some(path) => Self::from_path(&path)?,
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: SyncConfig = toml::from_str(contents)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_hysteresis_ms == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "default_hysteresis_ms",
                reason: "must be > 0 (omit it to persist immediately)".to_string(),
            });
        }
        if self.log.filter.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "log.filter",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }

    pub fn default_hysteresis(&self) -> Option<Duration> {
        self.default_hysteresis_ms.map(Duration::from_millis)
    }

    pub fn with_default_hysteresis(mut self, delay: Option<Duration>) -> Self {
        self.default_hysteresis_ms = delay.map(|d| d.as_millis() as u64);
        self
    }

    pub fn with_flush_on_teardown(mut self, enabled: bool) -> Self {
        self.flush_on_teardown = enabled;
        self
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}
