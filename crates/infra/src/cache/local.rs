//! L1: process-local cache bounded by capacity (LRU) and per-entry TTL.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;

#[derive(Debug, Clone)]
struct Entry {
    value: JsonValue,
    expires_at: Instant,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// In-process LRU cache with expiry.
///
/// Expired entries are dropped lazily on access. Once the capacity is reached, the
/// least recently used entry is evicted.
#[derive(Debug)]
pub struct LocalCache {
    entries: Mutex<LruCache<String, Entry>>,
}

impl LocalCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, key: &str) -> Option<JsonValue> {
        let mut entries = self.entries.lock();
        let expired = match entries.get(key) {
            Some(entry) if !entry.is_expired(Instant::now()) => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        None
    }

    pub fn set(&self, key: impl Into<String>, value: JsonValue, ttl: Duration) {
        let expires_at = Instant::now() + ttl;
        self.entries.lock().put(key.into(), Entry { value, expires_at });
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.lock().pop(key).is_some()
    }

    /// Remove every key starting with `prefix`, returning the removed keys.
    pub fn remove_prefix(&self, prefix: &str) -> Vec<String> {
        let mut entries = self.entries.lock();
        let matching: Vec<String> = entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &matching {
            entries.pop(key);
        }
        matching
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> NonZeroUsize {
        self.entries.lock().cap()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache(capacity: usize) -> LocalCache {
        LocalCache::new(NonZeroUsize::new(capacity).unwrap())
    }

    const HOUR: Duration = Duration::from_secs(3_600);

    #[test]
    fn evicts_least_recently_used() {
        let l1 = cache(2);
        l1.set("a", json!(1), HOUR);
        l1.set("b", json!(2), HOUR);
        assert_eq!(l1.get("a"), Some(json!(1)));

        l1.set("c", json!(3), HOUR);

        assert_eq!(l1.get("b"), None);
        assert_eq!(l1.get("a"), Some(json!(1)));
        assert_eq!(l1.get("c"), Some(json!(3)));
        assert_eq!(l1.len(), 2);
    }

    #[test]
    fn expired_entries_are_misses() {
        let l1 = cache(4);
        l1.set("gone", json!("x"), Duration::ZERO);
        assert_eq!(l1.get("gone"), None);
        assert!(l1.is_empty());
    }

    #[test]
    fn removes_by_prefix() {
        let l1 = cache(8);
        l1.set("product:1", json!(1), HOUR);
        l1.set("product:2", json!(2), HOUR);
        l1.set("products.list:abc", json!([]), HOUR);

        let mut removed = l1.remove_prefix("product:");
        removed.sort();
        assert_eq!(removed, vec!["product:1".to_string(), "product:2".to_string()]);
        assert_eq!(l1.len(), 1);
        assert!(l1.remove("products.list:abc"));
        assert!(!l1.remove("products.list:abc"));
    }
}
