//! Fixed window counter rate limiting.
//!
//! The counter lives under the raw key, not under the aligned window start, and
//! its TTL is refreshed to `window_secs` on every admission. A counter that is
//! still alive when the next aligned window begins keeps counting against the
//! old quota until it expires.

use async_trait::async_trait;
use tracing::trace;

use super::{Algorithm, RateLimitStrategy};
use crate::ratelimit::store::{CounterStore, ScriptCall, StoreError, ADMITTED};

/// Fixed window counter strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixedWindow;

impl FixedWindow {
    /// Start of the aligned window containing `now`.
    pub fn window_start(now: f64, window_secs: u64) -> i64 {
        let window = window_secs as i64;
        (now.floor() as i64).div_euclid(window) * window
    }
}

#[async_trait]
impl RateLimitStrategy for FixedWindow {
    fn algorithm(&self) -> Algorithm {
        Algorithm::FixedWindow
    }

    fn store_key(&self, key: &str) -> String {
        format!("fixed_window:{key}")
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
        let window_start = Self::window_start(now, window_secs);
        trace!(key = %store_key, limit, window_secs, window_start, "Evaluating fixed window");

        let call = ScriptCall::FixedWindow {
            window_start,
            limit,
            window_secs,
        };
        Ok(store.atomic_execute(&store_key, &call).await? == ADMITTED)
    }
}
