//! Rate limiting strategies, counter stores and request admission.

pub mod clock;
pub mod store;
pub mod strategy;
mod descriptor;
mod guard;
mod limiter;
mod rules;

pub use descriptor::{CallContext, RequestInfo};
pub use guard::CallSiteGuard;
pub use limiter::{Decision, FailurePolicy, RateLimiter};
pub use rules::{RateLimitConfig, RouteRule, RouteTable};
pub use strategy::{Algorithm, StrategyDefaults, StrategyRegistry};
