//! Per-call-site admission middleware.

use std::future::Future;
use std::sync::Arc;

use super::descriptor::CallContext;
use super::limiter::{Decision, RateLimiter};
use super::rules::{RateLimitConfig, RouteTable};
use crate::error::{KeygateError, Result};

/// A [`RateLimiter`] bound to one call site's policy.
///
/// Create one per protected operation at registration time and call
/// [`CallSiteGuard::run`] around every invocation.
#[derive(Clone)]
pub struct CallSiteGuard {
    limiter: Arc<RateLimiter>,
    config: RateLimitConfig,
}

impl CallSiteGuard {
    pub fn new(limiter: Arc<RateLimiter>, config: RateLimitConfig) -> Self {
        Self { limiter, config }
    }

    /// Build the guard for a registered route.
    pub fn for_route(
        limiter: Arc<RateLimiter>,
        routes: &RouteTable,
        method: &str,
        path: &str,
    ) -> Result<Self> {
        let config = routes.find(method, path).cloned().ok_or_else(|| {
            KeygateError::InvalidConfiguration(format!(
                "no rate limit registered for {} {}",
                method, path
            ))
        })?;
        Ok(Self::new(limiter, config))
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Evaluate without turning a deny into an error.
    pub async fn check(&self, ctx: &CallContext) -> Result<Decision> {
        self.limiter.evaluate(&self.config, ctx).await
    }

    /// Run `op` if the call is admitted.
    pub async fn run<F, Fut, T, E>(&self, ctx: &CallContext, op: F) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<KeygateError>,
    {
        self.limiter.guard(&self.config, ctx, op).await
    }
}
