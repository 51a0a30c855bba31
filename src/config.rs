//! Runtime configuration for the state bus and its participants.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while loading a [`StateSyncConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The configuration text is not valid YAML for this schema.
    #[error("Invalid config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// An environment override holds an unusable value.
    #[error("Invalid value for {var}: {value}")]
    InvalidEnv { var: String, value: String },

    /// A setting holds a value outside its allowed range.
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// Configuration shared by a bus and every participant attached to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateSyncConfig {
    /// Catch and log panics raised by bus handlers instead of unwinding
    /// through the publisher.
    pub catch_handler_panics: bool,
    /// First id handed out by the bus's identity allocator.
    pub first_participant_id: u64,
    /// Log suppressed (unchanged) property writes.
    pub log_skipped_updates: bool,
}

impl Default for StateSyncConfig {
    fn default() -> Self {
        Self {
            catch_handler_panics: true,
            first_participant_id: 1,
            log_skipped_updates: true,
        }
    }
}

impl StateSyncConfig {
    /// Environment variable overriding [`catch_handler_panics`](Self::catch_handler_panics).
    pub const ENV_CATCH_PANICS: &'static str = "STATE_SYNC_CATCH_PANICS";
    /// Environment variable overriding [`first_participant_id`](Self::first_participant_id).
    pub const ENV_FIRST_ID: &'static str = "STATE_SYNC_FIRST_ID";

    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from YAML text. Missing keys keep their defaults.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every setting is usable.
    ///
    /// `first_participant_id` must leave room for at least one more id.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.first_participant_id == u64::MAX {
            return Err(ConfigError::InvalidValue {
                key: "first_participant_id".to_string(),
                value: self.first_participant_id.to_string(),
            });
        }
        Ok(())
    }

    /// Load a configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&text)
    }

    /// Apply overrides from the process environment.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|var| std::env::var(var).ok())
    }

    fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(Self::ENV_CATCH_PANICS) {
            self.catch_handler_panics = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => return Err(invalid(Self::ENV_CATCH_PANICS, raw)),
            };
        }
        if let Some(raw) = lookup(Self::ENV_FIRST_ID) {
            self.first_participant_id = raw
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|id| *id != u64::MAX)
                .ok_or_else(|| invalid(Self::ENV_FIRST_ID, raw.clone()))?;
        }
        Ok(self)
    }
}

fn invalid(var: &str, value: String) -> ConfigError {
    ConfigError::InvalidEnv {
        var: var.to_string(),
        value,
    }
}
