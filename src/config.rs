//! Engine Configuration
//!
//! Loads dispatcher and store settings from a YAML file, with environment
//! variable overrides for the values operators tune most often.
//!
//! # Example YAML Format
//!
//! ```yaml
//! dispatcher:
//!   pool_size: 8
//!   poll_batch_size: 8
//!   sleep_ms: 1000
//!   capacity_wait_ms: 100
//!   shutdown_timeout_ms: 60000
//! store:
//!   claim_timeout_ms: 300000
//! ```
//!
//! Durations are given in milliseconds. Missing keys take their defaults.

use std::fs;
use std::str::FromStr;
use std::time::Duration;

use log::{debug, info};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Twice the number of logical CPUs.
pub static DEFAULT_POOL_SIZE: Lazy<usize> = Lazy::new(|| 2 * num_cpus::get());

/// Default idle sleep between empty polls.
pub const DEFAULT_SLEEP_INTERVAL: Duration = Duration::from_millis(1000);

/// Default wait when every worker is busy.
pub const DEFAULT_CAPACITY_WAIT: Duration = Duration::from_millis(100);

/// Default bound on draining in-flight executors at shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

/// Default age after which a store claim is considered abandoned.
pub const DEFAULT_CLAIM_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Top-level engine configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub dispatcher: DispatcherConfig,
    pub store: StoreConfig,
}

/// Settings of the dispatch loop and its worker pool.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Number of worker threads
    pub pool_size: usize,

    /// Upper bound on instance ids claimed per poll
    pub poll_batch_size: usize,

    /// Sleep after a poll returned nothing
    #[serde(rename = "sleep_ms", with = "millis")]
    pub sleep_interval: Duration,

    /// Sleep while all workers are busy
    #[serde(rename = "capacity_wait_ms", with = "millis")]
    pub capacity_wait: Duration,

    /// How long shutdown waits for in-flight executors
    #[serde(rename = "shutdown_timeout_ms", with = "millis")]
    pub shutdown_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            pool_size: *DEFAULT_POOL_SIZE,
            poll_batch_size: *DEFAULT_POOL_SIZE,
            sleep_interval: DEFAULT_SLEEP_INTERVAL,
            capacity_wait: DEFAULT_CAPACITY_WAIT,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

/// Settings of the bundled in-memory store.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    #[serde(rename = "claim_timeout_ms", with = "millis")]
    pub claim_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            claim_timeout: DEFAULT_CLAIM_TIMEOUT,
        }
    }
}

impl EngineConfig {
    /// Loads and validates a configuration file.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use flowrunner::config::EngineConfig;
    ///
    /// fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let config = EngineConfig::load("flowrunner.yaml")?;
    ///     println!("Pool size: {}", config.dispatcher.pool_size);
    ///     Ok(())
    /// }
    /// ```
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        info!("Loading configuration from: {}", path);

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;

        debug!("Config content loaded ({} bytes)", content.len());
        Self::from_yaml_str(&content)
    }

    /// Parses and validates YAML configuration text.
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        // An empty document means all defaults
        let config: EngineConfig = if content.trim().is_empty() {
            EngineConfig::default()
        } else {
            serde_yaml::from_str(content)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Applies `FLOWRUNNER_*` environment variables on top of this config.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary key lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("FLOWRUNNER_POOL_SIZE") {
            self.dispatcher.pool_size = parse_number("FLOWRUNNER_POOL_SIZE", &value)?;
        }
        if let Some(value) = lookup("FLOWRUNNER_BATCH_SIZE") {
            self.dispatcher.poll_batch_size = parse_number("FLOWRUNNER_BATCH_SIZE", &value)?;
        }
        if let Some(value) = lookup("FLOWRUNNER_SLEEP_MS") {
            self.dispatcher.sleep_interval =
                Duration::from_millis(parse_number("FLOWRUNNER_SLEEP_MS", &value)?);
        }
        if let Some(value) = lookup("FLOWRUNNER_SHUTDOWN_TIMEOUT_MS") {
            self.dispatcher.shutdown_timeout =
                Duration::from_millis(parse_number("FLOWRUNNER_SHUTDOWN_TIMEOUT_MS", &value)?);
        }
        self.validate()
    }

    /// Rejects settings the dispatcher cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatcher.pool_size == 0 {
            return Err(ConfigError::Invalid {
                key: "dispatcher.pool_size".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.dispatcher.poll_batch_size == 0 {
            return Err(ConfigError::Invalid {
                key: "dispatcher.poll_batch_size".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_number<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        key: key.to_string(),
        message: format!("expected a non-negative integer, got '{}'", value),
    })
}

/// Serde adapter for durations written as integer milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
