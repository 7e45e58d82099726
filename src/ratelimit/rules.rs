//! Per-call-site rate limit policies and route registration.
//!
//! Route rules are declared in YAML and validated into [`RateLimitConfig`]s
//! when they are registered, so a bad limit, window, or algorithm name stops
//! startup instead of surfacing on a request.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use super::strategy::{Algorithm, StrategyDefaults};
use crate::error::{KeygateError, Result};

/// Validated, immutable policy for one call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    algorithm: Algorithm,
    limit: u64,
    window_secs: u64,
    key: Option<String>,
}

impl RateLimitConfig {
    /// Create a policy, rejecting a zero limit or window.
    pub fn new(algorithm: Algorithm, limit: u64, window_secs: u64) -> Result<Self> {
        if limit == 0 {
            return Err(KeygateError::InvalidConfiguration(
                "limit must be greater than zero".to_string(),
            ));
        }
        if window_secs == 0 {
            return Err(KeygateError::InvalidConfiguration(
                "window_secs must be greater than zero".to_string(),
            ));
        }

        Ok(Self {
            algorithm,
            limit,
            window_secs,
            key: None,
        })
    }

    /// Use a fixed rate limit key instead of deriving one per call.
    pub fn with_key(mut self, key: impl Into<String>) -> Result<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(KeygateError::InvalidConfiguration(
                "explicit key must not be empty".to_string(),
            ));
        }
        self.key = Some(key);
        Ok(self)
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window_secs(&self) -> u64 {
        self.window_secs
    }

    /// The explicit key, if one was configured.
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }
}

/// A rate limit rule as written in configuration.
///
/// Numeric fields are signed so that negative values reach validation and are
/// reported as configuration errors rather than parse failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteRule {
    /// HTTP method, matched case-insensitively
    pub method: String,
    /// Request path, matched exactly
    pub path: String,
    /// Algorithm identifier
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    /// Requests allowed per window (defaults to `StrategyDefaults::limit`)
    #[serde(default)]
    pub limit: Option<i64>,
    /// Window length in seconds (defaults to `StrategyDefaults::window_secs`)
    #[serde(default)]
    pub window_secs: Option<i64>,
    /// Explicit rate limit key shared by every caller of this route
    #[serde(default)]
    pub key: Option<String>,
}

fn default_algorithm() -> String {
    Algorithm::TokenBucket.as_str().to_string()
}

impl RouteRule {
    /// Validate this rule into a policy, filling gaps from `defaults`.
    pub fn validate(&self, defaults: &StrategyDefaults) -> Result<RateLimitConfig> {
        let context = |e: KeygateError| match e {
            KeygateError::InvalidConfiguration(msg) => KeygateError::InvalidConfiguration(
                format!("route {} {}: {}", self.method, self.path, msg),
            ),
            other => other,
        };

        let algorithm: Algorithm = self.algorithm.parse().map_err(context)?;
        let limit = positive(self.limit, defaults.limit, "limit").map_err(context)?;
        let window_secs =
            positive(self.window_secs, defaults.window_secs, "window_secs").map_err(context)?;

        let config = RateLimitConfig::new(algorithm, limit, window_secs).map_err(context)?;
        match self.key.as_deref() {
            Some(key) if !key.is_empty() => config.with_key(key).map_err(context),
            _ => Ok(config),
        }
    }
}

fn positive(value: Option<i64>, default: u64, field: &str) -> Result<u64> {
    match value {
        None => Ok(default),
        Some(v) if v > 0 => Ok(v as u64),
        Some(v) => Err(KeygateError::InvalidConfiguration(format!(
            "{field} must be greater than zero, got {v}"
        ))),
    }
}

/// Validated policies indexed by call site.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: HashMap<(String, String), RateLimitConfig>,
}

impl RouteTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register every rule. Fails on the first invalid or duplicate rule.
    pub fn from_rules(rules: &[RouteRule], defaults: &StrategyDefaults) -> Result<Self> {
        let mut table = Self::new();
        for rule in rules {
            let config = rule.validate(defaults)?;
            table.register(&rule.method, &rule.path, config)?;
        }
        Ok(table)
    }

    /// Load and validate a YAML list of route rules.
    pub fn from_yaml(yaml: &str, defaults: &StrategyDefaults) -> Result<Self> {
        let rules: Vec<RouteRule> = serde_yaml::from_str(yaml).map_err(|e| {
            KeygateError::InvalidConfiguration(format!("Failed to parse route rules: {}", e))
        })?;
        Self::from_rules(&rules, defaults)
    }

    /// Load and validate route rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P, defaults: &StrategyDefaults) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading route rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents, defaults)
    }

    /// Register a policy for a call site.
    pub fn register(&mut self, method: &str, path: &str, config: RateLimitConfig) -> Result<()> {
        let site = (method.to_ascii_uppercase(), path.to_string());
        if self.routes.contains_key(&site) {
            return Err(KeygateError::InvalidConfiguration(format!(
                "route {} {} registered twice",
                site.0, site.1
            )));
        }

        info!(
            method = %site.0,
            path = %site.1,
            algorithm = %config.algorithm(),
            limit = config.limit(),
            window_secs = config.window_secs(),
            "Registered rate limited route"
        );
        self.routes.insert(site, config);
        Ok(())
    }

    /// Find the policy for a call site.
    pub fn find(&self, method: &str, path: &str) -> Option<&RateLimitConfig> {
        self.routes.get(&(method.to_ascii_uppercase(), path.to_string()))
    }

    /// Registered call sites, sorted by path then method.
    pub fn routes(&self) -> Vec<(&str, &str, &RateLimitConfig)> {
        let mut routes: Vec<_> = self
            .routes
            .iter()
            .map(|((method, path), config)| (method.as_str(), path.as_str(), config))
            .collect();
        routes.sort_by(|a, b| (a.1, a.0).cmp(&(b.1, b.0)));
        routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
