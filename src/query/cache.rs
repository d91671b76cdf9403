//! Time-bounded cache of query results.
//!
//! Entries are keyed by [`CacheKey`], a deterministic encoding of an endpoint
//! name and its argument. Data is stored type-erased and recovered with a
//! downcast, so one [`CacheManager`] serves every endpoint of an
//! [`Api`](super::Api).

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Identifies one cached `(endpoint, argument)` pair.
///
/// The argument is encoded as JSON with object keys sorted at every level, so
/// structurally equal arguments always map to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    endpoint: Arc<str>,
    arg: String,
}

impl CacheKey {
    /// Encodes `arg` for `endpoint`.
    pub fn new<A: Serialize + ?Sized>(endpoint: &str, arg: &A) -> Result<Self, serde_json::Error> {
        let value = serde_json::to_value(arg)?;
        Ok(Self::from_value(endpoint, &value))
    }

    /// Builds a key from an already serialized argument.
    pub fn from_value(endpoint: &str, arg: &Value) -> Self {
        Self {
            endpoint: Arc::from(endpoint),
            arg: canonical(arg).to_string(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The canonical JSON encoding of the argument.
    pub fn arg(&self) -> &str {
        &self.arg
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.endpoint, self.arg)
    }
}

fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::with_capacity(map.len());
            for key in keys {
                sorted.insert(key.clone(), canonical(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

/// A cached result with its timestamp and time-to-live.
#[derive(Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub data: Arc<dyn Any + Send + Sync>,
    pub stored_at: Instant,
    pub ttl: Duration,
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("stored_at", &self.stored_at)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl CacheEntry {
    /// Checks whether this entry can still be served.
    ///
    /// A zero TTL is always expired.
    pub fn is_valid(&self) -> bool {
        !self.ttl.is_zero() && self.stored_at.elapsed() < self.ttl
    }

    /// Returns the data if it has type `D`.
    pub fn downcast<D: Send + Sync + 'static>(&self) -> Option<Arc<D>> {
        Arc::clone(&self.data).downcast::<D>().ok()
    }
}

/// Stores query results with a per-entry time-to-live.
///
/// Expired entries are dropped lazily on [`lookup`](Self::lookup), by
/// [`sweep`](Self::sweep), or by a background sweeper started with
/// [`spawn_sweeper`](Self::spawn_sweeper).
#[derive(Debug, Default)]
pub struct CacheManager {
    entries: DashMap<CacheKey, CacheEntry>,
}

impl CacheManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry for `key` if it has not expired.
    pub fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.entries.get(key)?.value().clone();
        if entry.is_valid() {
            tracing::trace!(%key, "cache hit");
            Some(entry)
        } else {
            tracing::trace!(%key, "cache entry expired");
            self.entries.remove_if(key, |_, entry| !entry.is_valid());
            None
        }
    }

    /// Returns the cached data for `key` if it is valid and of type `D`.
    pub fn lookup_data<D: Send + Sync + 'static>(&self, key: &CacheKey) -> Option<Arc<D>> {
        self.lookup(key).and_then(|entry| entry.downcast::<D>())
    }

    /// Caches `data` under `key` for `ttl`, replacing any previous entry.
    ///
    /// Returns `false` without storing anything when `ttl` is zero.
    pub fn store<D: Send + Sync + 'static>(&self, key: CacheKey, data: Arc<D>, ttl: Duration) -> bool {
        if ttl.is_zero() {
            return false;
        }
        tracing::trace!(%key, ?ttl, "cache store");
        let entry = CacheEntry {
            key: key.clone(),
            data,
            stored_at: Instant::now(),
            ttl,
        };
        self.entries.insert(key, entry);
        true
    }

    /// Removes the entry for `key`. Returns `true` if one existed.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Removes every entry of `endpoint` and returns their keys.
    pub fn invalidate_endpoint(&self, endpoint: &str) -> Vec<CacheKey> {
        let mut removed = Vec::new();
        self.entries.retain(|key, _| {
            if key.endpoint() == endpoint {
                removed.push(key.clone());
                false
            } else {
                true
            }
        });
        removed.sort();
        removed
    }

    /// Drops every expired entry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_valid());
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            tracing::debug!(removed, "swept expired cache entries");
        }
        removed
    }

    /// Sweeps expired entries every `interval` until cancelled.
    ///
    /// The task only holds a weak reference and stops on its own once the
    /// cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> SweeperHandle {
        let token = CancellationToken::new();
        let cache: Weak<Self> = Arc::downgrade(self);
        let child = token.clone();

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = child.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(cache) = cache.upgrade() else { break };
                        cache.sweep();
                    }
                }
            }
            tracing::trace!("cache sweeper stopped");
        });

        SweeperHandle { token, join }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }
}

/// Handle for a running cache sweeper task.
pub struct SweeperHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl SweeperHandle {
    /// A token that stops the sweeper when cancelled.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stop the sweeper and wait for the task to finish.
    pub async fn cancel(self) {
        self.token.cancel();
        let _ = self.join.await;
    }
}
