//! Redis-backed counter store.
//!
//! Each [`ScriptCall`] maps to a Lua script run with `EVALSHA`, so the whole
//! read-modify-write-expire sequence executes inside Redis without
//! interleaving from other clients.
//!
//! The scripts and `MemoryStore::run` implement the same sequences. A change
//! to one must be made to the other; the tests below run the shared scenarios
//! against both when `REDIS_URL` is set.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::{debug, info};

use super::{CounterStore, ScriptCall, StoreError, ADMITTED, DENIED};

const TOKEN_BUCKET_LUA: &str = r#"
local now = tonumber(ARGV[1])
local capacity = tonumber(ARGV[2])
local refill_rate = tonumber(ARGV[3])
local idle_ttl = tonumber(ARGV[4])

local bucket = redis.call('HMGET', KEYS[1], 'tokens', 'last_refill')
local tokens = tonumber(bucket[1]) or capacity
local last_refill = tonumber(bucket[2]) or now

local elapsed = math.max(0, now - last_refill)
tokens = math.min(capacity, tokens + elapsed * refill_rate)

if tokens < 1 then
    return 0
end

redis.call('HSET', KEYS[1], 'tokens', tostring(tokens - 1), 'last_refill', ARGV[1])
redis.call('EXPIRE', KEYS[1], idle_ttl)
return 1
"#;

const FIXED_WINDOW_LUA: &str = r#"
local limit = tonumber(ARGV[2])
local window_secs = tonumber(ARGV[3])

local count = tonumber(redis.call('GET', KEYS[1])) or 0
if count >= limit then
    return 0
end

redis.call('INCR', KEYS[1])
redis.call('EXPIRE', KEYS[1], window_secs)
return 1
"#;

const SLIDING_WINDOW_LUA: &str = r#"
local now = tonumber(ARGV[1])
local cutoff = tonumber(ARGV[2])
local limit = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])

redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', cutoff)
if redis.call('ZCARD', KEYS[1]) >= limit then
    return 0
end

redis.call('ZADD', KEYS[1], now, ARGV[5])
redis.call('EXPIRE', KEYS[1], ttl)
return 1
"#;

/// Counter store backed by a Redis server.
///
/// Cloning is cheap; clones share one auto-reconnecting connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    token_bucket: Script,
    fixed_window: Script,
    sliding_window: Script,
}

impl RedisStore {
    /// Connect to the Redis server at `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!(url = %url, "Connected to Redis counter store");

        Ok(Self {
            conn,
            token_bucket: Script::new(TOKEN_BUCKET_LUA),
            fixed_window: Script::new(FIXED_WINDOW_LUA),
            sliding_window: Script::new(SLIDING_WINDOW_LUA),
        })
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn atomic_execute(&self, key: &str, call: &ScriptCall) -> Result<i64, StoreError> {
        let mut conn = self.conn.clone();

        let result: i64 = match call {
            ScriptCall::TokenBucket {
                now,
                capacity,
                refill_rate,
                idle_ttl_secs,
            } => {
                self.token_bucket
                    .key(key)
                    .arg(*now)
                    .arg(*capacity)
                    .arg(*refill_rate)
                    .arg(*idle_ttl_secs)
                    .invoke_async(&mut conn)
                    .await?
            }
            ScriptCall::FixedWindow {
                window_start,
                limit,
                window_secs,
            } => {
                self.fixed_window
                    .key(key)
                    .arg(*window_start)
                    .arg(*limit)
                    .arg(*window_secs)
                    .invoke_async(&mut conn)
                    .await?
            }
            ScriptCall::SlidingWindow {
                now,
                cutoff,
                limit,
                ttl_secs,
                member,
            } => {
                self.sliding_window
                    .key(key)
                    .arg(*now)
                    .arg(*cutoff)
                    .arg(*limit)
                    .arg(*ttl_secs)
                    .arg(member.as_str())
                    .invoke_async(&mut conn)
                    .await?
            }
        };

        debug!(key = %key, script = call.name(), result, "Executed script on Redis");

        match result {
            ADMITTED | DENIED => Ok(result),
            other => Err(StoreError::UnexpectedReply(other.to_string())),
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
