//! Cache-aside front: L1 (process-local LRU) in front of L2 (shared).
//!
//! ## Read path
//!
//! L1 hit returns immediately. On an L1 miss the L2 tier is consulted; an L2 hit is
//! promoted into L1 before returning, with the cache's `default_ttl`. Memoizers
//! build their caches with [`MultiTierCache::isolated_with_ttl`], so a promoted
//! memo never outlives its own TTL.
//!
//! ## Write path
//!
//! `set` writes L1 synchronously first, then awaits the L2 write before returning.
//! A read right after `set` is served from L1 whatever happens to the L2 write.
//!
//! ## Failures
//!
//! Every L2 call runs under a timeout. Errors and timeouts are logged, counted in
//! [`CacheStats::l2_errors`] and treated as a miss. They never fail the caller.

use std::collections::HashSet;
use std::future::Future;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tracing::{debug, instrument, warn};

use super::local::LocalCache;
use super::shared::{CacheError, SharedCache};
use crate::config::EngineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheOptions {
    pub l1_capacity: NonZeroUsize,
    /// TTL used when `set` is called without one, and for L2 promotions.
    pub default_ttl: Duration,
    pub l2_timeout: Duration,
}

impl CacheOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            l1_capacity: config.l1_capacity,
            default_ttl: config.default_ttl,
            l2_timeout: config.l2_timeout,
        }
    }
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

/// Per-tier counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l2_hits: u64,
    pub l2_misses: u64,
    pub l2_errors: u64,
    /// Share of `get` calls answered by either tier (0.0 when nothing was read).
    pub hit_rate: f64,
}

#[derive(Debug, Default)]
struct Counters {
    l1_hits: AtomicU64,
    l1_misses: AtomicU64,
    l2_hits: AtomicU64,
    l2_misses: AtomicU64,
    l2_errors: AtomicU64,
}

struct Inner {
    l1: LocalCache,
    l2: Option<Arc<dyn SharedCache>>,
    options: CacheOptions,
    counters: Counters,
    /// Memo namespaces claimed on this L2 keyspace; shared by every isolated sibling.
    namespaces: Arc<Mutex<HashSet<String>>>,
}

/// Two-tier cache handle. Clones share the same tiers and counters.
#[derive(Clone)]
pub struct MultiTierCache {
    inner: Arc<Inner>,
}

impl MultiTierCache {
    pub fn new(l2: Option<Arc<dyn SharedCache>>, options: CacheOptions) -> Self {
        Self::with_parts(l2, options, Arc::default())
    }

    fn with_parts(
        l2: Option<Arc<dyn SharedCache>>,
        options: CacheOptions,
        namespaces: Arc<Mutex<HashSet<String>>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                l1: LocalCache::new(options.l1_capacity),
                l2,
                options,
                counters: Counters::default(),
                namespaces,
            }),
        }
    }

    /// L1 only; every L1 miss is a total miss.
    pub fn local_only(options: CacheOptions) -> Self {
        Self::new(None, options)
    }

    /// A new cache with its own L1 and counters, sharing this cache's L2 and options.
    pub fn isolated(&self) -> Self {
        Self::with_parts(self.inner.l2.clone(), self.inner.options, self.inner.namespaces.clone())
    }

    /// Like [`isolated`](Self::isolated), with `default_ttl` capped at `ttl`.
    pub fn isolated_with_ttl(&self, ttl: Duration) -> Self {
        let options = CacheOptions {
            default_ttl: self.inner.options.default_ttl.min(ttl),
            ..self.inner.options
        };
        Self::with_parts(self.inner.l2.clone(), options, self.inner.namespaces.clone())
    }

    /// Reserve a key namespace on the shared keyspace. `false` if already taken.
    pub(crate) fn claim_namespace(&self, namespace: &str) -> bool {
        self.inner.namespaces.lock().insert(namespace.to_string())
    }

    pub(crate) fn release_namespace(&self, namespace: &str) {
        self.inner.namespaces.lock().remove(namespace);
    }

    pub fn options(&self) -> CacheOptions {
        self.inner.options
    }

    pub async fn get(&self, key: &str) -> Option<JsonValue> {
        let inner = &self.inner;

        if let Some(value) = inner.l1.get(key) {
            inner.counters.l1_hits.fetch_add(1, Ordering::Relaxed);
            return Some(value);
        }
        inner.counters.l1_misses.fetch_add(1, Ordering::Relaxed);

        let l2 = inner.l2.as_ref()?;
        match self.l2_call("get", key, l2.get(key)).await {
            Some(Some(value)) => {
                inner.counters.l2_hits.fetch_add(1, Ordering::Relaxed);
                inner.l1.set(key, value.clone(), inner.options.default_ttl);
                Some(value)
            }
            Some(None) => {
                inner.counters.l2_misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => None,
        }
    }

    /// Typed read; a value that no longer deserializes counts as absent.
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let value = self.get(key).await?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(err) => {
                warn!(key, error = %err, "cached value has unexpected shape; treating as miss");
                None
            }
        }
    }

    pub async fn set(&self, key: &str, value: JsonValue, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.inner.options.default_ttl);
        self.inner.l1.set(key, value.clone(), ttl);

        if let Some(l2) = &self.inner.l2 {
            self.l2_call("set", key, l2.set_ex(key, &value, ttl)).await;
        }
    }

    pub async fn set_as<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) {
        match serde_json::to_value(value) {
            Ok(json) => self.set(key, json, ttl).await,
            Err(err) => warn!(key, error = %err, "value is not serializable; not cached"),
        }
    }

    /// Remove `key` from both tiers. Returns whether either tier held it.
    pub async fn invalidate(&self, key: &str) -> bool {
        let in_l1 = self.inner.l1.remove(key);
        let in_l2 = match &self.inner.l2 {
            Some(l2) => self.l2_call("delete", key, l2.delete(key)).await.unwrap_or(false),
            None => false,
        };
        in_l1 || in_l2
    }

    /// Remove every key starting with `prefix` from both tiers.
    ///
    /// Returns the number of distinct keys removed.
    #[instrument(skip(self), fields(removed = tracing::field::Empty))]
    pub async fn invalidate_pattern(&self, prefix: &str) -> usize {
        let mut removed = self.inner.l1.remove_prefix(prefix);
        if let Some(l2) = &self.inner.l2 {
            if let Some(keys) = self.l2_call("delete_prefix", prefix, l2.delete_prefix(prefix)).await {
                removed.extend(keys);
            }
        }
        removed.sort_unstable();
        removed.dedup();

        tracing::Span::current().record("removed", removed.len());
        removed.len()
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.inner.counters;
        let l1_hits = c.l1_hits.load(Ordering::Relaxed);
        let l1_misses = c.l1_misses.load(Ordering::Relaxed);
        let l2_hits = c.l2_hits.load(Ordering::Relaxed);
        let reads = l1_hits + l1_misses;

        CacheStats {
            l1_hits,
            l1_misses,
            l2_hits,
            l2_misses: c.l2_misses.load(Ordering::Relaxed),
            l2_errors: c.l2_errors.load(Ordering::Relaxed),
            hit_rate: if reads == 0 {
                0.0
            } else {
                (l1_hits + l2_hits) as f64 / reads as f64
            },
        }
    }

    pub fn l1_len(&self) -> usize {
        self.inner.l1.len()
    }

    /// Run an L2 operation under the configured timeout. `None` means the tier failed.
    async fn l2_call<T, F>(&self, op: &'static str, key: &str, call: F) -> Option<T>
    where
        F: Future<Output = Result<T, CacheError>>,
    {
        let timeout = self.inner.options.l2_timeout;
        let err = match tokio::time::timeout(timeout, call).await {
            Ok(Ok(value)) => {
                debug!(op, key, "l2 call succeeded");
                return Some(value);
            }
            Ok(Err(err)) => err,
            Err(_) => CacheError::Timeout(timeout),
        };

        self.inner.counters.l2_errors.fetch_add(1, Ordering::Relaxed);
        warn!(op, key, error = %err, "l2 cache tier failed; treating as miss");
        None
    }
}

impl core::fmt::Debug for MultiTierCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MultiTierCache")
            .field("options", &self.inner.options)
            .field("l1_len", &self.inner.l1.len())
            .field("has_l2", &self.inner.l2.is_some())
            .finish()
    }
}
