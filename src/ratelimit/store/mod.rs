//! Shared counter store abstraction.
//!
//! All per-key limiter state lives in a [`CounterStore`]. Each strategy
//! expresses its read-modify-write sequence as a [`ScriptCall`], which the
//! store must execute as one indivisible unit per key. Backends:
//!
//! - [`MemoryStore`]: in-process, for single-node deployments and tests
//! - [`RedisStore`]: Lua scripts executed server-side

mod memory;
mod redis_store;

pub use self::memory::{MemoryStore, StoredValue};
pub use self::redis_store::RedisStore;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Script result signalling an admitted request.
pub const ADMITTED: i64 = 1;
/// Script result signalling a denied request.
pub const DENIED: i64 = 0;

/// Errors raised by a counter store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store did not answer within the configured bound.
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),

    /// Connection or script failure reported by Redis.
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The key holds a value of a different type than the script expects.
    #[error("key {key} holds a value of the wrong type")]
    WrongType { key: String },

    /// The script returned something other than an admission flag.
    #[error("unexpected script reply: {0}")]
    UnexpectedReply(String),
}

/// One atomic read-modify-write-expire sequence, with its arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptCall {
    /// Refill then consume one token from a `tokens`/`last_refill` hash.
    TokenBucket {
        now: f64,
        capacity: u64,
        refill_rate: f64,
        idle_ttl_secs: u64,
    },
    /// Increment a plain counter while it is below `limit`.
    FixedWindow {
        window_start: i64,
        limit: u64,
        window_secs: u64,
    },
    /// Purge stale log entries, then append `member` while under `limit`.
    SlidingWindow {
        now: f64,
        cutoff: f64,
        limit: u64,
        ttl_secs: u64,
        member: String,
    },
}

impl ScriptCall {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            ScriptCall::TokenBucket { .. } => "token_bucket",
            ScriptCall::FixedWindow { .. } => "fixed_window",
            ScriptCall::SlidingWindow { .. } => "sliding_window",
        }
    }
}

/// A store able to run [`ScriptCall`]s atomically per key.
///
/// Implementations must guarantee that concurrent calls against the same key
/// observe each other as if executed one after another.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Execute `call` against `key` atomically, returning [`ADMITTED`] or [`DENIED`].
    async fn atomic_execute(&self, key: &str, call: &ScriptCall) -> Result<i64, StoreError>;

    /// Check that the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;
}
