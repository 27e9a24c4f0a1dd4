//! Configuration loader with file and environment variable support

use crate::{AppConfig, ConfigError};
use std::env;
use std::path::PathBuf;
use tracing::{info, warn};

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "singleton.toml",
    "config.toml",
    "./config/singleton.toml",
    "./config/config.toml",
    "/etc/singleton/config.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self { config_path: None }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
        }
    }

    /// Load configuration from file (if found) with environment variable overrides,
    /// then validate the result
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        self.load_with(|name| env::var(name).ok())
    }

    fn load_with<F>(&self, lookup: F) -> Result<AppConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = AppConfig::default();

        if let Some(path) = self.find_config_file(&lookup) {
            info!(?path, "Loading configuration from file");
            config = AppConfig::from_file(&path)?;
        }

        apply_overrides(&mut config, &lookup);
        config.validate()?;

        Ok(config)
    }

    /// Find the configuration file to use
    fn find_config_file<F>(&self, lookup: &F) -> Option<PathBuf>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = &self.config_path {
            if path.exists() {
                return Some(path.clone());
            }
            warn!(?path, "Configured file does not exist, searching defaults");
        }

        if let Some(path) = lookup("SINGLETON_CONFIG").map(PathBuf::from) {
            if path.exists() {
                return Some(path);
            }
        }

        CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply environment variable overrides
fn apply_overrides<F>(config: &mut AppConfig, lookup: &F)
where
    F: Fn(&str) -> Option<String>,
{
    // Redis
    if let Some(val) = lookup("SINGLETON_REDIS_URL") {
        config.redis.url = val;
    }

    // Election
    if let Some(val) = lookup("SINGLETON_KEY") {
        config.singleton.key = val;
    }
    if let Some(val) = lookup("SINGLETON_TTL_MS") {
        match val.parse() {
            Ok(ttl) => config.singleton.ttl_ms = ttl,
            Err(_) => warn!(value = %val, "Ignoring unparsable SINGLETON_TTL_MS"),
        }
    }
    if let Some(val) = lookup("SINGLETON_RETRY_INTERVAL_MS") {
        match val.parse() {
            Ok(interval) => config.singleton.retry_interval_ms = Some(interval),
            Err(_) => warn!(value = %val, "Ignoring unparsable SINGLETON_RETRY_INTERVAL_MS"),
        }
    }
    if let Some(val) = lookup("SINGLETON_DRAIN_TIMEOUT_MS") {
        match val.parse() {
            Ok(timeout) => config.singleton.drain_timeout_ms = Some(timeout),
            Err(_) => warn!(value = %val, "Ignoring unparsable SINGLETON_DRAIN_TIMEOUT_MS"),
        }
    }
    if let Some(val) = lookup("SINGLETON_INSTANCE_ID") {
        config.singleton.instance_id = val;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    fn config_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    #[test]
    fn test_explicit_path_is_loaded() {
        let file = config_file("[singleton]\nkey = \"reports:nightly\"\nttl_ms = 6000\n");

        let config = ConfigLoader::with_path(file.path())
            .load_with(env_of(&[]))
            .unwrap();

        assert_eq!(config.singleton.key, "reports:nightly");
        assert_eq!(config.singleton.ttl_ms, 6000);
    }

    #[test]
    fn test_config_env_var_points_at_file() {
        let file = config_file("[redis]\nurl = \"redis://cache:6379\"\n");
        let path = file.path().to_string_lossy().to_string();

        let config = ConfigLoader::with_path("/nonexistent/singleton.toml")
            .load_with(env_of(&[("SINGLETON_CONFIG", &path)]))
            .unwrap();

        assert_eq!(config.redis.url, "redis://cache:6379");
    }

    #[test]
    fn test_env_overrides_file_values() {
        let file = config_file("[singleton]\nkey = \"from-file\"\nttl_ms = 6000\n");

        let config = ConfigLoader::with_path(file.path())
            .load_with(env_of(&[
                ("SINGLETON_KEY", "from-env"),
                ("SINGLETON_TTL_MS", "12000"),
                ("SINGLETON_RETRY_INTERVAL_MS", "250"),
                ("SINGLETON_DRAIN_TIMEOUT_MS", "1500"),
                ("SINGLETON_INSTANCE_ID", "node-a"),
                ("SINGLETON_REDIS_URL", "redis://other:6380"),
            ]))
            .unwrap();

        assert_eq!(config.singleton.key, "from-env");
        assert_eq!(config.singleton.ttl_ms, 12000);
        assert_eq!(config.singleton.retry_interval_ms, Some(250));
        assert_eq!(config.singleton.drain_timeout_ms, Some(1500));
        assert_eq!(config.singleton.instance_id(), Some("node-a"));
        assert_eq!(config.redis.url, "redis://other:6380");
    }

    #[test]
    fn test_unparsable_override_is_ignored() {
        let file = config_file("[singleton]\nttl_ms = 6000\n");

        let config = ConfigLoader::with_path(file.path())
            .load_with(env_of(&[("SINGLETON_TTL_MS", "soon")]))
            .unwrap();

        assert_eq!(config.singleton.ttl_ms, 6000);
    }

    #[test]
    fn test_invalid_result_is_rejected() {
        let file = config_file("[singleton]\nkey = \"job\"\n");

        let result = ConfigLoader::with_path(file.path())
            .load_with(env_of(&[("SINGLETON_TTL_MS", "1")]));

        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }
}
