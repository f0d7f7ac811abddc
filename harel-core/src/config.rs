//! Interpreter and host configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via HAREL_CONFIG)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// What happens when an `error.*` event is processed and no transition
/// consumes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnhandledErrorBehavior {
    /// Log and continue.
    #[default]
    Ignore,
    /// Stop the session and report the fault through its result.
    DestroyStateMachine,
    /// Return the error from the run loop.
    RethrowException,
}

impl FromStr for UnhandledErrorBehavior {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ignore" => Ok(Self::Ignore),
            "destroy" | "destroy_state_machine" => Ok(Self::DestroyStateMachine),
            "rethrow" | "rethrow_exception" => Ok(Self::RethrowException),
            other => Err(ConfigError::ValidationError(format!(
                "unknown unhandled error behavior '{}'",
                other
            ))),
        }
    }
}

/// How much interpreter state is checkpointed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistenceLevel {
    /// Nothing is written.
    #[default]
    None,
    /// At every macrostep boundary.
    Minimal,
    /// After every microstep as well.
    Full,
}

impl FromStr for PersistenceLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "minimal" => Ok(Self::Minimal),
            "full" => Ok(Self::Full),
            other => Err(ConfigError::ValidationError(format!(
                "unknown persistence level '{}'",
                other
            ))),
        }
    }
}

/// Behavior of a bounded external queue when it is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Enqueue fails with `QueueFull`.
    #[default]
    Reject,
    /// Async enqueue waits for room.
    Block,
}

impl FromStr for BackpressurePolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "block" => Ok(Self::Block),
            other => Err(ConfigError::ValidationError(format!(
                "unknown backpressure policy '{}'",
                other
            ))),
        }
    }
}

/// Per-session interpreter options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterConfig {
    pub unhandled_error: UnhandledErrorBehavior,
    pub persistence_level: PersistenceLevel,
    /// External queue capacity (0 = unbounded).
    pub queue_capacity: usize,
    pub backpressure: BackpressurePolicy,
}

impl InterpreterConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("HAREL_UNHANDLED_ERROR") {
            if let Ok(parsed) = value.parse() {
                self.unhandled_error = parsed;
            }
        }

        if let Ok(value) = std::env::var("HAREL_PERSISTENCE_LEVEL") {
            if let Ok(parsed) = value.parse() {
                self.persistence_level = parsed;
            }
        }

        if let Ok(value) = std::env::var("HAREL_QUEUE_CAPACITY") {
            if let Ok(n) = value.parse() {
                self.queue_capacity = n;
            }
        }

        if let Ok(value) = std::env::var("HAREL_BACKPRESSURE") {
            if let Ok(parsed) = value.parse() {
                self.backpressure = parsed;
            }
        }
    }

    /// Returns the queue capacity, `None` when unbounded.
    pub fn capacity(&self) -> Option<usize> {
        (self.queue_capacity > 0).then_some(self.queue_capacity)
    }
}

/// Host options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Maximum concurrent sessions (0 = unlimited).
    pub max_sessions: usize,
    /// Data model used by documents that name none.
    pub datamodel: String,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            max_sessions: 0,
            datamodel: "json".to_string(),
        }
    }
}

impl HostConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(max) = std::env::var("HAREL_MAX_SESSIONS") {
            if let Ok(n) = max.parse() {
                self.max_sessions = n;
            }
        }

        if let Ok(name) = std::env::var("HAREL_DATAMODEL") {
            if !name.is_empty() {
                self.datamodel = name;
            }
        }
    }
}

/// Complete configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub interpreter: InterpreterConfig,
    pub host: HostConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("HAREL_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.interpreter.apply_env_overrides();
        self.host.apply_env_overrides();
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.datamodel.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "host.datamodel must not be empty".to_string(),
            ));
        }
        if self.interpreter.backpressure == BackpressurePolicy::Block
            && self.interpreter.queue_capacity == 0
        {
            return Err(ConfigError::ValidationError(
                "block backpressure requires a queue_capacity".to_string(),
            ));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {}", .0.display(), .1)]
    IoError(PathBuf, std::io::Error),

    #[error("failed to parse config file '{}': {}", .0.display(), .1)]
    ParseError(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}
