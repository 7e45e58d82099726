//! Configuration management for Keygate.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{KeygateError, Result};
use crate::ratelimit::{FailurePolicy, RouteRule, RouteTable, StrategyDefaults, StrategyRegistry};

/// Prefix for environment overrides, e.g. `KEYGATE__STORE__URL`.
const ENV_PREFIX: &str = "KEYGATE";

/// Main configuration for the Keygate service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeygateConfig {
    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Default limits and strategy sizing
    #[serde(default)]
    pub defaults: StrategyDefaults,

    /// Behaviour when the counter store is unreachable
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Rate limited call sites
    #[serde(default)]
    pub routes: Vec<RouteRule>,
}

impl Default for KeygateConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            defaults: StrategyDefaults::default(),
            failure_policy: FailurePolicy::default(),
            logging: LoggingConfig::default(),
            routes: Vec::new(),
        }
    }
}

/// Which counter store backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store; limits are not shared between processes.
    #[default]
    Memory,
    /// Shared Redis server.
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend selection
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Upper bound on one admission round-trip, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// How often the memory backend purges expired keys, in seconds
    #[serde(default = "default_reaper_interval")]
    pub reaper_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_redis_url(),
            timeout_ms: default_timeout_ms(),
            reaper_interval_secs: default_reaper_interval(),
        }
    }
}

impl StoreConfig {
    /// Reject settings the store layer cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.timeout_ms == 0 {
            return Err(KeygateError::InvalidConfiguration(
                "store.timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.reaper_interval_secs == 0 {
            return Err(KeygateError::InvalidConfiguration(
                "store.reaper_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_timeout_ms() -> u64 {
    250
}

fn default_reaper_interval() -> u64 {
    30
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl KeygateConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| {
            KeygateError::InvalidConfiguration(format!("Failed to parse config: {}", e))
        })
    }

    /// Load configuration from an optional file, overlaid with `KEYGATE__*`
    /// environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(::config::File::with_name(path));
        }
        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| KeygateError::InvalidConfiguration(e.to_string()))
    }

    /// Check store settings and strategy sizing before anything is started.
    pub fn validate(&self) -> Result<()> {
        self.store.validate()?;
        self.strategy_registry().map(|_| ())
    }

    /// Validate the configured routes.
    pub fn route_table(&self) -> Result<RouteTable> {
        RouteTable::from_rules(&self.routes, &self.defaults)
    }

    /// Strategy registry sized from the configured defaults.
    pub fn strategy_registry(&self) -> Result<StrategyRegistry> {
        let refill_rate = self.defaults.refill_rate;
        if !(refill_rate.is_finite() && refill_rate > 0.0) {
            return Err(KeygateError::InvalidConfiguration(format!(
                "refill_rate must be a finite positive number, got {}",
                refill_rate
            )));
        }
        if self.defaults.bucket_idle_ttl_secs == 0 {
            return Err(KeygateError::InvalidConfiguration(
                "bucket_idle_ttl_secs must be greater than zero".to_string(),
            ));
        }
        Ok(StrategyRegistry::new(&self.defaults))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::Algorithm;

    #[test]
    fn test_defaults() {
        let config = KeygateConfig::default();
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.timeout(), Duration::from_millis(250));
        assert_eq!(config.failure_policy, FailurePolicy::FailClosed);
        assert_eq!(config.defaults.limit, 10);
        assert_eq!(config.logging.level, "info");
        assert!(config.routes.is_empty());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
store:
  backend: redis
  url: redis://cache:6379
  timeout_ms: 100
failure_policy: fail_open
defaults:
  refill_rate: 2.5
logging:
  level: debug
  json: true
routes:
  - method: GET
    path: /api/test/sliding-window
    algorithm: sliding-window
    limit: 4
    window_secs: 20
"#;
        let config = KeygateConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.url, "redis://cache:6379");
        assert_eq!(config.store.timeout(), Duration::from_millis(100));
        assert_eq!(config.failure_policy, FailurePolicy::FailOpen);
        assert_eq!(config.defaults.refill_rate, 2.5);
        assert_eq!(config.defaults.window_secs, 60);
        assert!(config.logging.json);

        let routes = config.route_table().unwrap();
        let route = routes.find("GET", "/api/test/sliding-window").unwrap();
        assert_eq!(route.algorithm(), Algorithm::SlidingWindow);
        assert_eq!(route.limit(), 4);
    }

    #[test]
    fn test_invalid_refill_rate_rejected() {
        for rate in ["0.0", "-1.5", ".inf", ".nan"] {
            let yaml = format!("defaults: {{ refill_rate: {rate} }}");
            let config = KeygateConfig::from_yaml(&yaml).unwrap();
            assert!(
                config.strategy_registry().unwrap_err().is_config_error(),
                "refill_rate {rate} should be rejected"
            );
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn test_zero_reaper_interval_rejected() {
        let config = KeygateConfig::from_yaml("store: { reaper_interval_secs: 0 }").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.is_config_error());
        assert!(err.to_string().contains("reaper_interval_secs"));
    }

    #[test]
    fn test_zero_store_timeout_rejected() {
        let config = KeygateConfig::from_yaml("store: { timeout_ms: 0 }").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.is_config_error());
        assert!(err.to_string().contains("timeout_ms"));
    }

    #[test]
    fn test_default_config_validates() {
        assert!(KeygateConfig::default().validate().is_ok());
    }

    #[test]
    fn test_sample_config_is_valid() {
        let config = KeygateConfig::from_yaml(include_str!("../config/keygate.yaml")).unwrap();
        let routes = config.route_table().unwrap();
        assert_eq!(routes.len(), 4);
        assert_eq!(
            routes.find("GET", "/api/test/custom-key").unwrap().key(),
            Some("custom-test-key")
        );
        assert!(config.strategy_registry().is_ok());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_failure_policy_rejected() {
        assert!(KeygateConfig::from_yaml("failure_policy: sometimes").is_err());
    }

    #[test]
    fn test_load_file_with_env_override() {
        let path = std::env::temp_dir().join(format!("keygate-{}.yaml", uuid::Uuid::new_v4()));
        let yaml = r#"
store:
  backend: redis
  timeout_ms: 100
routes:
  - { method: GET, path: /a, limit: 2 }
"#;
        std::fs::write(&path, yaml).unwrap();

        std::env::set_var("KEYGATE__STORE__TIMEOUT_MS", "750");
        let loaded = KeygateConfig::load(path.to_str());
        std::env::remove_var("KEYGATE__STORE__TIMEOUT_MS");
        std::fs::remove_file(&path).unwrap();

        let config = loaded.unwrap();
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.timeout_ms, 750);
        assert_eq!(config.route_table().unwrap().len(), 1);
    }
}
