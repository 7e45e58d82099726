//! Rate limiting algorithms and their registry.

mod fixed_window;
mod sliding_window;
mod token_bucket;

pub use fixed_window::FixedWindow;
pub use sliding_window::SlidingWindow;
pub use token_bucket::TokenBucket;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::store::{CounterStore, StoreError};
use crate::error::KeygateError;

/// Identifier of a rate limiting algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Algorithm {
    TokenBucket,
    FixedWindow,
    SlidingWindow,
}

impl Algorithm {
    /// All known algorithms.
    pub const ALL: [Algorithm; 3] = [
        Algorithm::TokenBucket,
        Algorithm::FixedWindow,
        Algorithm::SlidingWindow,
    ];

    /// The identifier used in configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::TokenBucket => "token-bucket",
            Algorithm::FixedWindow => "fixed-window",
            Algorithm::SlidingWindow => "sliding-window",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = KeygateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Algorithm::ALL
            .into_iter()
            .find(|algorithm| algorithm.as_str() == s)
            .ok_or_else(|| {
                KeygateError::InvalidConfiguration(format!("unknown rate limit algorithm: {s}"))
            })
    }
}

/// Default sizing shared by every call site and strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyDefaults {
    /// Limit (or bucket capacity) when a call site names none.
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Window length in seconds when a call site names none.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Token bucket refill speed in tokens per second, independent of the window.
    #[serde(default = "default_refill_rate")]
    pub refill_rate: f64,

    /// How long an untouched token bucket survives in the store.
    #[serde(default = "default_bucket_idle_ttl")]
    pub bucket_idle_ttl_secs: u64,
}

impl Default for StrategyDefaults {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            window_secs: default_window_secs(),
            refill_rate: default_refill_rate(),
            bucket_idle_ttl_secs: default_bucket_idle_ttl(),
        }
    }
}

fn default_limit() -> u64 {
    10
}

fn default_window_secs() -> u64 {
    60
}

fn default_refill_rate() -> f64 {
    1.0
}

fn default_bucket_idle_ttl() -> u64 {
    3600
}

/// A rate limiting algorithm evaluated atomically against a counter store.
#[async_trait]
pub trait RateLimitStrategy: Send + Sync {
    /// Which algorithm this is.
    fn algorithm(&self) -> Algorithm;

    /// The store key holding state for a rate limit key.
    fn store_key(&self, key: &str) -> String;

    /// Decide whether one more request for `key` fits within `limit` per `window_secs`.
    async fn is_allowed(
        &self,
        store: &dyn CounterStore,
        key: &str,
        limit: u64,
        window_secs: u64,
        now: f64,
    ) -> Result<bool, StoreError>;
}

/// Maps each [`Algorithm`] to its strategy.
#[derive(Debug, Clone)]
pub struct StrategyRegistry {
    token_bucket: TokenBucket,
    fixed_window: FixedWindow,
    sliding_window: SlidingWindow,
}

impl StrategyRegistry {
    /// Build the registry, sizing the token bucket from `defaults`.
    pub fn new(defaults: &StrategyDefaults) -> Self {
        Self {
            token_bucket: TokenBucket::new(defaults.refill_rate, defaults.bucket_idle_ttl_secs),
            fixed_window: FixedWindow,
            sliding_window: SlidingWindow,
        }
    }

    /// Look up the strategy for an algorithm.
    pub fn get(&self, algorithm: Algorithm) -> &dyn RateLimitStrategy {
        match algorithm {
            Algorithm::TokenBucket => &self.token_bucket,
            Algorithm::FixedWindow => &self.fixed_window,
            Algorithm::SlidingWindow => &self.sliding_window,
        }
    }

    /// Look up a strategy by its configuration identifier.
    pub fn get_by_name(&self, name: &str) -> crate::error::Result<&dyn RateLimitStrategy> {
        Ok(self.get(name.parse()?))
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new(&StrategyDefaults::default())
    }
}
