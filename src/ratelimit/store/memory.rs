//! In-process counter store.
//!
//! Mirrors the Redis data model (hashes, integers, sorted sets, key TTLs) so
//! the strategies behave identically against either backend. Atomicity per key
//! comes from holding the key's map entry for the whole script.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{CounterStore, ScriptCall, StoreError, ADMITTED, DENIED};
use crate::ratelimit::clock::{Clock, SystemClock};

/// A value held under one store key.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredValue {
    /// Field/value pairs, stored as strings like a Redis hash.
    Hash(BTreeMap<String, String>),
    /// A plain integer counter.
    Integer(i64),
    /// `(score, member)` pairs ordered by score.
    SortedSet(Vec<(f64, String)>),
}

#[derive(Debug, Default)]
struct Slot {
    value: Option<StoredValue>,
    expires_at: Option<f64>,
}

impl Slot {
    fn is_expired(&self, now: f64) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }

    fn clear(&mut self) {
        self.value = None;
        self.expires_at = None;
    }

    fn expire_in(&mut self, now: f64, secs: u64) {
        self.expires_at = Some(now + secs as f64);
    }
}

/// Counter store kept in process memory.
pub struct MemoryStore {
    entries: DashMap<String, Slot>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create a store expiring keys against the wall clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store expiring keys against `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Current value under `key`, if present and not expired.
    pub fn snapshot(&self, key: &str) -> Option<StoredValue> {
        let now = self.clock.now();
        self.entries
            .get(key)
            .filter(|slot| !slot.is_expired(now))
            .and_then(|slot| slot.value.clone())
    }

    /// Remaining time to live of `key` in seconds.
    pub fn ttl(&self, key: &str) -> Option<f64> {
        let now = self.clock.now();
        let slot = self.entries.get(key)?;
        if slot.is_expired(now) || slot.value.is_none() {
            return None;
        }
        slot.expires_at.map(|at| at - now)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries
            .iter()
            .filter(|slot| slot.value.is_some() && !slot.is_expired(now))
            .count()
    }

    /// Whether the store holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired key, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries
            .retain(|_, slot| slot.value.is_some() && !slot.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Periodically purge expired keys until the returned task is aborted.
    pub fn spawn_reaper(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let removed = self.purge_expired();
                if removed > 0 {
                    debug!(removed, "Reaped expired counter keys");
                }
            }
        })
    }

    // Keep in step with the Lua scripts in `redis_store.rs`.
    fn run(slot: &mut Slot, key: &str, now: f64, call: &ScriptCall) -> Result<i64, StoreError> {
        match call {
            ScriptCall::TokenBucket {
                now: at,
                capacity,
                refill_rate,
                idle_ttl_secs,
            } => {
                let capacity = *capacity as f64;
                let (tokens, last_refill) = match &slot.value {
                    None => (capacity, *at),
                    Some(StoredValue::Hash(fields)) => (
                        parse_field(fields, "tokens").unwrap_or(capacity),
                        parse_field(fields, "last_refill").unwrap_or(*at),
                    ),
                    Some(_) => return Err(wrong_type(key)),
                };

                let elapsed = (at - last_refill).max(0.0);
                let tokens = (tokens + elapsed * refill_rate).min(capacity);
                if tokens < 1.0 {
                    return Ok(DENIED);
                }

                let mut fields = BTreeMap::new();
                fields.insert("tokens".to_string(), (tokens - 1.0).to_string());
                fields.insert("last_refill".to_string(), at.to_string());
                slot.value = Some(StoredValue::Hash(fields));
                slot.expire_in(now, *idle_ttl_secs);
                Ok(ADMITTED)
            }

            ScriptCall::FixedWindow {
                limit, window_secs, ..
            } => {
                let count = match &slot.value {
                    None => 0,
                    Some(StoredValue::Integer(n)) => *n,
                    Some(_) => return Err(wrong_type(key)),
                };
                if count >= *limit as i64 {
                    return Ok(DENIED);
                }

                slot.value = Some(StoredValue::Integer(count + 1));
                slot.expire_in(now, *window_secs);
                Ok(ADMITTED)
            }

            ScriptCall::SlidingWindow {
                now: at,
                cutoff,
                limit,
                ttl_secs,
                member,
            } => {
                let mut log = match slot.value.take() {
                    None => Vec::new(),
                    Some(StoredValue::SortedSet(log)) => log,
                    Some(other) => {
                        slot.value = Some(other);
                        return Err(wrong_type(key));
                    }
                };

                log.retain(|(score, _)| *score > *cutoff);
                if log.len() as u64 >= *limit {
                    slot.value = Some(StoredValue::SortedSet(log));
                    return Ok(DENIED);
                }

                log.retain(|(_, m)| m != member);
                let pos = log.partition_point(|(score, _)| *score <= *at);
                log.insert(pos, (*at, member.clone()));
                slot.value = Some(StoredValue::SortedSet(log));
                slot.expire_in(now, *ttl_secs);
                Ok(ADMITTED)
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_field(fields: &BTreeMap<String, String>, name: &str) -> Option<f64> {
    fields.get(name).and_then(|v| v.parse().ok())
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::WrongType {
        key: key.to_string(),
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn atomic_execute(&self, key: &str, call: &ScriptCall) -> Result<i64, StoreError> {
        let now = self.clock.now();
        let result = {
            let mut slot = self.entries.entry(key.to_string()).or_default();
            if slot.is_expired(now) {
                slot.clear();
            }
            Self::run(&mut slot, key, now, call)
        };

        // A denial against an absent key must not leave a placeholder behind.
        self.entries.remove_if(key, |_, slot| slot.value.is_none());

        trace!(key = %key, script = call.name(), result = ?result, "Executed script in memory");
        result
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
