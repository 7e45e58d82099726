//! Request admission.
//!
//! [`RateLimiter`] derives the key for a call, runs the configured strategy
//! against the shared counter store, and turns the outcome into a
//! [`Decision`]. It holds no per-key state of its own, so any number of
//! instances can share one store.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::clock::{Clock, SystemClock};
use super::descriptor::CallContext;
use super::rules::RateLimitConfig;
use super::store::{CounterStore, StoreError};
use super::strategy::{Algorithm, StrategyRegistry};
use crate::error::{KeygateError, Result};

/// Default bound on a single store round-trip.
const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(250);

/// What to do when the counter store cannot answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Admit the request and mark the decision degraded.
    FailOpen,
    /// Reject the request with [`KeygateError::StoreUnavailable`].
    #[default]
    FailClosed,
}

/// Outcome of one admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether the call may proceed
    pub allowed: bool,
    /// The derived rate limit key
    pub key: String,
    /// Algorithm that produced the decision
    pub algorithm: Algorithm,
    /// Set when the store failed and the fail-open policy admitted the call
    pub degraded: bool,
}

/// The admission layer shared by every call site.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    registry: StrategyRegistry,
    clock: Arc<dyn Clock>,
    failure_policy: FailurePolicy,
    store_timeout: Duration,
}

impl RateLimiter {
    /// Create a limiter over `store` with default strategies, wall clock,
    /// fail-closed policy and store timeout.
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self {
            store,
            registry: StrategyRegistry::default(),
            clock: Arc::new(SystemClock),
            failure_policy: FailurePolicy::default(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
        }
    }

    pub fn with_registry(mut self, registry: StrategyRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    /// Evaluate one call against its policy.
    ///
    /// A deny is returned as `Ok` with `allowed == false`. Store failures
    /// follow the configured [`FailurePolicy`].
    pub async fn evaluate(&self, config: &RateLimitConfig, ctx: &CallContext) -> Result<Decision> {
        let key = ctx.derive_key(config);
        let strategy = self.registry.get(config.algorithm());
        let now = self.clock.now();

        trace!(
            key = %key,
            algorithm = %config.algorithm(),
            limit = config.limit(),
            window_secs = config.window_secs(),
            "Checking rate limit"
        );

        let check = strategy.is_allowed(
            self.store.as_ref(),
            &key,
            config.limit(),
            config.window_secs(),
            now,
        );
        let outcome = tokio::time::timeout(self.store_timeout, check)
            .await
            .unwrap_or(Err(StoreError::Timeout(self.store_timeout)));

        match outcome {
            Ok(allowed) => {
                if !allowed {
                    debug!(key = %key, algorithm = %config.algorithm(), "Rate limit exceeded");
                }
                Ok(Decision {
                    allowed,
                    key,
                    algorithm: config.algorithm(),
                    degraded: false,
                })
            }
            Err(source) => match self.failure_policy {
                FailurePolicy::FailOpen => {
                    warn!(key = %key, error = %source, "Counter store failed, admitting request");
                    Ok(Decision {
                        allowed: true,
                        key,
                        algorithm: config.algorithm(),
                        degraded: true,
                    })
                }
                FailurePolicy::FailClosed => {
                    warn!(key = %key, error = %source, "Counter store failed, rejecting request");
                    Err(KeygateError::StoreUnavailable { key, source })
                }
            },
        }
    }

    /// Evaluate and turn a deny into [`KeygateError::LimitExceeded`].
    pub async fn admit(&self, config: &RateLimitConfig, ctx: &CallContext) -> Result<Decision> {
        let decision = self.evaluate(config, ctx).await?;
        if decision.allowed {
            Ok(decision)
        } else {
            Err(KeygateError::LimitExceeded { key: decision.key })
        }
    }

    /// Run `op` only if the call is admitted.
    ///
    /// Errors from `op` are returned untouched; rejections are converted into
    /// the caller's error type.
    pub async fn guard<F, Fut, T, E>(
        &self,
        config: &RateLimitConfig,
        ctx: &CallContext,
        op: F,
    ) -> std::result::Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: From<KeygateError>,
    {
        self.admit(config, ctx).await?;
        op().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use crate::ratelimit::descriptor::RequestInfo;
    use crate::ratelimit::store::{MemoryStore, ScriptCall};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct BrokenStore;

    #[async_trait]
    impl CounterStore for BrokenStore {
        async fn atomic_execute(
            &self,
            key: &str,
            _call: &ScriptCall,
        ) -> std::result::Result<i64, StoreError> {
            Err(StoreError::WrongType { key: key.to_string() })
        }

        async fn ping(&self) -> std::result::Result<(), StoreError> {
            Ok(())
        }
    }

    struct StalledStore;

    #[async_trait]
    impl CounterStore for StalledStore {
        async fn atomic_execute(
            &self,
            _key: &str,
            _call: &ScriptCall,
        ) -> std::result::Result<i64, StoreError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(1)
        }

        async fn ping(&self) -> std::result::Result<(), StoreError> {
            Ok(())
        }
    }

    #[derive(Debug)]
    enum AppError {
        Rejected(KeygateError),
        Handler(&'static str),
    }

    impl From<KeygateError> for AppError {
        fn from(e: KeygateError) -> Self {
            AppError::Rejected(e)
        }
    }

    fn limiter_at(start: f64) -> (Arc<ManualClock>, Arc<MemoryStore>, RateLimiter) {
        let clock = Arc::new(ManualClock::new(start));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let limiter = RateLimiter::new(store.clone()).with_clock(clock.clone());
        (clock, store, limiter)
    }

    fn request_ctx(peer: &str) -> CallContext {
        CallContext::request(
            "TestController:tokenBucket",
            RequestInfo::new("GET", "/api/test/token-bucket", peer),
        )
    }

    #[tokio::test]
    async fn test_evaluate_allows_then_denies() {
        let (_clock, _store, limiter) = limiter_at(0.0);
        let config = RateLimitConfig::new(Algorithm::TokenBucket, 5, 30).unwrap();
        let ctx = request_ctx("10.0.0.1");

        for _ in 0..5 {
            let decision = limiter.evaluate(&config, &ctx).await.unwrap();
            assert!(decision.allowed);
            assert!(!decision.degraded);
            assert_eq!(decision.key, "10.0.0.1:GET:/api/test/token-bucket");
        }
        let decision = limiter.evaluate(&config, &ctx).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.algorithm, Algorithm::TokenBucket);
    }

    #[tokio::test]
    async fn test_admit_reports_limit_exceeded_with_key() {
        let (_clock, _store, limiter) = limiter_at(0.0);
        let config = RateLimitConfig::new(Algorithm::FixedWindow, 1, 15).unwrap();
        let ctx = CallContext::component("ReportJob:run");

        tokio_test::assert_ok!(limiter.admit(&config, &ctx).await);
        let err = limiter.admit(&config, &ctx).await.unwrap_err();
        match err {
            KeygateError::LimitExceeded { key } => assert_eq!(key, "ReportJob:run"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_clients_are_limited_separately() {
        let (_clock, _store, limiter) = limiter_at(0.0);
        let config = RateLimitConfig::new(Algorithm::SlidingWindow, 1, 20).unwrap();

        assert!(limiter.evaluate(&config, &request_ctx("10.0.0.1")).await.unwrap().allowed);
        assert!(limiter.evaluate(&config, &request_ctx("10.0.0.2")).await.unwrap().allowed);
        assert!(!limiter.evaluate(&config, &request_ctx("10.0.0.1")).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_explicit_key_is_shared_across_clients() {
        let (_clock, _store, limiter) = limiter_at(0.0);
        let config = RateLimitConfig::new(Algorithm::TokenBucket, 2, 30)
            .unwrap()
            .with_key("custom-test-key")
            .unwrap();

        assert!(limiter.evaluate(&config, &request_ctx("10.0.0.1")).await.unwrap().allowed);
        assert!(limiter.evaluate(&config, &request_ctx("10.0.0.2")).await.unwrap().allowed);
        let decision = limiter.evaluate(&config, &request_ctx("10.0.0.3")).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.key, "custom-test-key");
    }

    #[tokio::test]
    async fn test_repeated_denial_is_idempotent() {
        for algorithm in Algorithm::ALL {
            let (_clock, store, limiter) = limiter_at(100.0);
            let config = RateLimitConfig::new(algorithm, 2, 20).unwrap();
            let ctx = CallContext::component("Job:run");
            let store_key = StrategyRegistry::default()
                .get(algorithm)
                .store_key("Job:run");

            assert!(limiter.evaluate(&config, &ctx).await.unwrap().allowed);
            assert!(limiter.evaluate(&config, &ctx).await.unwrap().allowed);

            let first = limiter.evaluate(&config, &ctx).await.unwrap();
            let state = store.snapshot(&store_key);
            let second = limiter.evaluate(&config, &ctx).await.unwrap();

            assert!(!first.allowed, "{algorithm} should deny");
            assert_eq!(first, second, "{algorithm} denial changed the outcome");
            assert_eq!(store.snapshot(&store_key), state, "{algorithm} denial mutated state");
        }
    }

    #[tokio::test]
    async fn test_fail_closed_on_store_error() {
        let limiter = RateLimiter::new(Arc::new(BrokenStore));
        let config = RateLimitConfig::new(Algorithm::FixedWindow, 3, 15).unwrap();

        let err = limiter
            .evaluate(&config, &CallContext::component("Job:run"))
            .await
            .unwrap_err();
        assert!(matches!(err, KeygateError::StoreUnavailable { .. }));
        assert!(!err.is_limit_exceeded());
    }

    #[tokio::test]
    async fn test_fail_open_on_store_error() {
        let limiter =
            RateLimiter::new(Arc::new(BrokenStore)).with_failure_policy(FailurePolicy::FailOpen);
        let config = RateLimitConfig::new(Algorithm::FixedWindow, 3, 15).unwrap();

        let decision = limiter
            .evaluate(&config, &CallContext::component("Job:run"))
            .await
            .unwrap();
        assert!(decision.allowed);
        assert!(decision.degraded);
    }

    #[tokio::test]
    async fn test_store_timeout_is_a_store_failure() {
        let limiter = RateLimiter::new(Arc::new(StalledStore))
            .with_store_timeout(Duration::from_millis(20));
        let config = RateLimitConfig::new(Algorithm::TokenBucket, 3, 15).unwrap();

        let err = limiter
            .evaluate(&config, &CallContext::component("Job:run"))
            .await
            .unwrap_err();
        match err {
            KeygateError::StoreUnavailable { source, .. } => {
                assert!(matches!(source, StoreError::Timeout(_)))
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_guard_runs_operation_only_when_admitted() {
        let (_clock, _store, limiter) = limiter_at(0.0);
        let config = RateLimitConfig::new(Algorithm::FixedWindow, 1, 15).unwrap();
        let ctx = request_ctx("10.0.0.1");
        let calls = AtomicUsize::new(0);

        let first: std::result::Result<&str, AppError> = limiter
            .guard(&config, &ctx, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("done")
            })
            .await;
        assert_eq!(first.unwrap(), "done");

        let second: std::result::Result<&str, AppError> = limiter
            .guard(&config, &ctx, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok("done")
            })
            .await;
        assert!(matches!(
            second,
            Err(AppError::Rejected(KeygateError::LimitExceeded { .. }))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_guard_passes_operation_errors_through() {
        let (_clock, _store, limiter) = limiter_at(0.0);
        let config = RateLimitConfig::new(Algorithm::TokenBucket, 5, 30).unwrap();

        let result: std::result::Result<(), AppError> = limiter
            .guard(&config, &request_ctx("10.0.0.1"), || async {
                Err(AppError::Handler("boom"))
            })
            .await;
        assert!(matches!(result, Err(AppError::Handler("boom"))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_never_exceed_limit() {
        for algorithm in Algorithm::ALL {
            let (_clock, _store, limiter) = limiter_at(0.0);
            let limiter = Arc::new(limiter);
            let config = RateLimitConfig::new(algorithm, 10, 60).unwrap();

            let handles: Vec<_> = (0..64)
                .map(|_| {
                    let limiter = limiter.clone();
                    let config = config.clone();
                    tokio::spawn(async move {
                        let ctx = CallContext::component("Shared:resource");
                        limiter.evaluate(&config, &ctx).await.unwrap().allowed
                    })
                })
                .collect();

            let mut allowed = 0;
            for handle in handles {
                if handle.await.unwrap() {
                    allowed += 1;
                }
            }
            assert_eq!(allowed, 10, "{algorithm} admitted {allowed} of 64");
        }
    }
}
