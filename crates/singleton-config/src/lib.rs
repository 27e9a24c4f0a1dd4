//! Singleton Runner Configuration
//!
//! TOML-based configuration with environment variable override support.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Smallest ttl whose renewal interval (ttl / 3) is still non-zero.
pub const MIN_TTL_MS: u64 = 3;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Root application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub redis: RedisConfig,
    pub singleton: SingletonConfig,
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
        }
    }
}

/// Election settings for one coordination key
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SingletonConfig {
    /// Coordination key shared by every instance that competes for the task
    pub key: String,
    /// Lease lifetime; the lease is refreshed every third of it
    pub ttl_ms: u64,
    /// Delay between acquisition attempts (defaults to ttl / 3)
    pub retry_interval_ms: Option<u64>,
    /// How long to wait for a cancelled task before releasing the lease anyway (defaults to ttl / 3)
    pub drain_timeout_ms: Option<u64>,
    /// Instance id used in logs; generated when empty
    pub instance_id: String,
}

impl Default for SingletonConfig {
    fn default() -> Self {
        Self {
            key: "singleton:heartbeat".to_string(),
            ttl_ms: 30_000,
            retry_interval_ms: None,
            drain_timeout_ms: None,
            instance_id: String::new(),
        }
    }
}

impl SingletonConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn retry_interval(&self) -> Option<Duration> {
        self.retry_interval_ms.map(Duration::from_millis)
    }

    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout_ms.map(Duration::from_millis)
    }

    pub fn instance_id(&self) -> Option<&str> {
        let id = self.instance_id.trim();
        (!id.is_empty()).then_some(id)
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Load configuration with environment variable override
    pub fn load() -> Result<Self, ConfigError> {
        let loader = ConfigLoader::new();
        loader.load()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis.url.trim().is_empty() {
            return Err(ConfigError::ValidationError("redis.url must not be empty".into()));
        }
        if self.singleton.key.trim().is_empty() {
            return Err(ConfigError::ValidationError("singleton.key must not be empty".into()));
        }
        if self.singleton.ttl_ms < MIN_TTL_MS {
            return Err(ConfigError::ValidationError(format!(
                "singleton.ttl_ms must be at least {}, got {}",
                MIN_TTL_MS, self.singleton.ttl_ms
            )));
        }
        if self.singleton.retry_interval_ms == Some(0) {
            return Err(ConfigError::ValidationError(
                "singleton.retry_interval_ms must be greater than zero".into(),
            ));
        }
        if self.singleton.drain_timeout_ms == Some(0) {
            return Err(ConfigError::ValidationError(
                "singleton.drain_timeout_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# Singleton Runner Configuration
# Environment variables (SINGLETON_*) override these settings

[redis]
url = "redis://localhost:6379"

[singleton]
key = "singleton:heartbeat"
ttl_ms = 30000
# retry_interval_ms = 10000
# drain_timeout_ms = 10000
instance_id = ""
"#
        .to_string()
    }
}
