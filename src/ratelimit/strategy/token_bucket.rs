//! Token bucket rate limiting.
//!
//! A bucket holds up to `capacity` tokens and refills continuously at
//! `refill_rate` tokens per second. Each admitted request takes one token.
//! The refill speed does not depend on the configured window length.

use async_trait::async_trait;
use tracing::trace;

use super::{Algorithm, RateLimitStrategy};
use crate::ratelimit::store::{CounterStore, ScriptCall, StoreError, ADMITTED};

/// Token bucket strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBucket {
    refill_rate: f64,
    idle_ttl_secs: u64,
}

impl TokenBucket {
    /// Create a bucket strategy refilling at `refill_rate` tokens per second,
    /// whose state expires after `idle_ttl_secs` without an admitted request.
    pub fn new(refill_rate: f64, idle_ttl_secs: u64) -> Self {
        Self {
            refill_rate,
            idle_ttl_secs,
        }
    }

    /// Refill speed in tokens per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }
}

#[async_trait]
impl RateLimitStrategy for TokenBucket {
    fn algorithm(&self) -> Algorithm {
        Algorithm::TokenBucket
    }

    fn store_key(&self, key: &str) -> String {
        format!("token_bucket:{key}")
    }

    async fn is_allowed(
        &self,
        store: &dyn CounterStore,
        key: &str,
        capacity: u64,
        window_secs: u64,
        now: f64,
    ) -> Result<bool, StoreError> {
        let store_key = self.store_key(key);
        trace!(
            key = %store_key,
            capacity,
            window_secs,
            refill_rate = self.refill_rate,
            "Evaluating token bucket"
        );

        let call = ScriptCall::TokenBucket {
            now,
            capacity,
            refill_rate: self.refill_rate,
            idle_ttl_secs: self.idle_ttl_secs,
        };
        Ok(store.atomic_execute(&store_key, &call).await? == ADMITTED)
    }
}
