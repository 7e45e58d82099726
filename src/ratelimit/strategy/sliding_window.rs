//! Sliding window log rate limiting.
//!
//! Keeps one log entry per admitted request, scored by its timestamp. Entries
//! at or before `now - window_secs` are purged before counting, so admission
//! is exact over the trailing window.

use async_trait::async_trait;
use tracing::trace;
use uuid::Uuid;

use super::{Algorithm, RateLimitStrategy};
use crate::ratelimit::store::{CounterStore, ScriptCall, StoreError, ADMITTED};

/// Sliding window log strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlidingWindow;

#[async_trait]
impl RateLimitStrategy for SlidingWindow {
    fn algorithm(&self) -> Algorithm {
        Algorithm::SlidingWindow
    }

    fn store_key(&self, key: &str) -> String {
        format!("sliding_window:{key}")
    }

    async fn is_allowed(
        &self,
        store: &dyn CounterStore,
        key: &str,
        limit: u64,
        window_secs: u64,
        now: f64,
    ) -> Result<bool, StoreError> {
        let store_key = self.store_key(key);
        let cutoff = now - window_secs as f64;
        trace!(key = %store_key, limit, window_secs, cutoff, "Evaluating sliding window");

        // The nonce keeps same-timestamp entries from different callers distinct.
        let call = ScriptCall::SlidingWindow {
            now,
            cutoff,
            limit,
            ttl_secs: window_secs.saturating_mul(2),
            member: format!("{now}:{}", Uuid::new_v4().simple()),
        };
        Ok(store.atomic_execute(&store_key, &call).await? == ADMITTED)
    }
}
