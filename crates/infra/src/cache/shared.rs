//! L2: shared cache port (network cache in production).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use thiserror::Error;

/// Failure of a shared cache tier. Tier failures never escape
/// [`MultiTierCache`](super::MultiTierCache); only memoizer construction returns
/// [`CacheError::NamespaceInUse`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("cache tier unavailable: {0}")]
    Unavailable(String),

    #[error("cache tier timed out after {0:?}")]
    Timeout(Duration),

    #[error("cache value serialization failed: {0}")]
    Serialization(String),

    #[error("memo namespace '{0}' is already in use on this cache")]
    NamespaceInUse(String),
}

/// Shared, TTL-bounded key/value cache.
///
/// Mutations are idempotent overwrites or deletes, so callers need no locking.
#[async_trait]
pub trait SharedCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<JsonValue>, CacheError>;

    async fn set_ex(&self, key: &str, value: &JsonValue, ttl: Duration) -> Result<(), CacheError>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    /// Delete every key starting with `prefix`, returning the deleted keys.
    async fn delete_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError>;
}

/// In-process stand-in for the shared tier (dev/tests).
#[derive(Debug, Default)]
pub struct InMemorySharedCache {
    entries: Mutex<HashMap<String, (JsonValue, Instant)>>,
    reads: AtomicU64,
}

impl InMemorySharedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `get` calls served so far.
    pub fn read_count(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries
            .lock()
            .get(key)
            .is_some_and(|(_, expires_at)| Instant::now() < *expires_at)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SharedCache for InMemorySharedCache {
    async fn get(&self, key: &str) -> Result<Option<JsonValue>, CacheError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            Some((value, expires_at)) if Instant::now() < *expires_at => return Ok(Some(value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set_ex(&self, key: &str, value: &JsonValue, ttl: Duration) -> Result<(), CacheError> {
        self.entries
            .lock()
            .insert(key.to_string(), (value.clone(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.entries.lock().remove(key).is_some())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        let mut entries = self.entries.lock();
        let matching: Vec<String> = entries.keys().filter(|k| k.starts_with(prefix)).cloned().collect();
        for key in &matching {
            entries.remove(key);
        }
        Ok(matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn honours_ttl_and_prefix_delete() {
        let l2 = InMemorySharedCache::new();
        l2.set_ex("a:1", &json!(1), Duration::from_secs(60)).await.unwrap();
        l2.set_ex("a:2", &json!(2), Duration::from_secs(60)).await.unwrap();
        l2.set_ex("b:1", &json!(3), Duration::ZERO).await.unwrap();

        assert_eq!(l2.get("a:1").await.unwrap(), Some(json!(1)));
        assert_eq!(l2.get("b:1").await.unwrap(), None);
        assert_eq!(l2.read_count(), 2);

        let mut removed = l2.delete_prefix("a:").await.unwrap();
        removed.sort();
        assert_eq!(removed, vec!["a:1".to_string(), "a:2".to_string()]);
        assert!(l2.is_empty());
        assert!(!l2.delete("a:1").await.unwrap());
    }
}
