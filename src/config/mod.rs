//! Application configuration.
//!
//! Aggregates the section types owned by each module into a single `Config`
//! loaded from YAML files and environment variables.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::hooks::HooksConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::ratelimit::{BreakerConfig, RateLimitPolicy};
use crate::queue::QueueConfig;
use crate::registry::CommandPolicy;
use crate::store::StoreConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "conductor.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "CONDUCTOR_CONFIG";
/// Prefix for configuration environment variables (`CONDUCTOR__QUEUE__WORKERS`).
pub const CONFIG_ENV_PREFIX: &str = "CONDUCTOR";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "CONDUCTOR_LOG";
/// Environment variable selecting JSON log output.
pub const LOG_FORMAT_ENV_VAR: &str = "CONDUCTOR_LOG_FORMAT";

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Optimistic write retry policy.
    pub store: StoreConfig,
    pub hooks: HooksConfig,
    /// Event queue sizing and redelivery.
    pub queue: QueueConfig,
    /// Defaults for commands that enable a circuit breaker.
    pub breaker: BreakerConfig,
    pub orchestrator: OrchestratorConfig,
    /// Throttling policies by category.
    pub rate_limits: Vec<RateLimitPolicy>,
    /// Per-command overrides of registered hooks and rate-limit class.
    pub commands: HashMap<String, CommandPolicy>,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `conductor.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix and `__`
    ///    separators
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.capacity == 0 {
            return Err(ConfigError::Invalid("queue.capacity must be > 0".into()));
        }
        if self.queue.max_attempts == 0 {
            return Err(ConfigError::Invalid("queue.max_attempts must be > 0".into()));
        }
        if self.queue.workers == Some(0) {
            return Err(ConfigError::Invalid("queue.workers must be > 0".into()));
        }
        if self.orchestrator.default_deadline_ms == 0 {
            return Err(ConfigError::Invalid(
                "orchestrator.default_deadline_ms must be > 0".into(),
            ));
        }
        if let Some(policy) = self.rate_limits.iter().find(|p| p.window_ms == 0) {
            return Err(ConfigError::Invalid(format!(
                "rate limit '{}' needs a non-zero window",
                policy.category
            )));
        }
        Ok(())
    }

    /// Config with short delays, for tests.
    pub fn for_test() -> Self {
        let mut config = Self::default();
        config.store.base_delay_ms = 1;
        config.store.max_delay_ms = 10;
        config.queue.workers = Some(2);
        config.queue.base_backoff_ms = 10;
        config.queue.max_backoff_ms = 50;
        config.queue.jitter = false;
        config
    }

    pub fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.orchestrator.default_deadline_ms)
    }
}
