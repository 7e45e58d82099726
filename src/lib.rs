//! Keygate - Distributed Request Admission
//!
//! This crate grants or denies individual calls against per-key quotas. All
//! counter state lives in a shared store (Redis in production) and every
//! decision is a single atomic script execution there, so any number of
//! limiter instances can enforce the same limits without coordinating.
//!
//! Three algorithms are available: token bucket, fixed window counter and
//! sliding window log. Call sites register a [`ratelimit::RateLimitConfig`]
//! and wrap their operation with a [`ratelimit::CallSiteGuard`].

pub mod config;
pub mod error;
pub mod ratelimit;
