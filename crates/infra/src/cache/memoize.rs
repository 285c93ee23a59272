//! Memoization of async lookups on top of [`MultiTierCache`].
//!
//! Keys are `"{namespace}:{sha256(canonical json of args)}"`. Canonical JSON sorts
//! object keys at every depth, so argument structs that serialize the same way hash
//! the same way regardless of field order.
//!
//! A namespace belongs to exactly one live memoizer per shared keyspace: creating
//! a second memoizer with a taken namespace fails with
//! [`CacheError::NamespaceInUse`]. Dropping the memoizer frees its namespace.

use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::multi_tier::MultiTierCache;
use super::shared::CacheError;

/// A memoized async function `A -> Option<V>`.
///
/// Each memoizer owns an isolated L1 (see [`MultiTierCache::isolated_with_ttl`])
/// and an exclusive namespace of the L2 keyspace. `None` results are never cached.
pub struct Memoized<A, V, F> {
    namespace: String,
    ttl: Duration,
    cache: MultiTierCache,
    fetch: F,
    _marker: PhantomData<fn(A) -> V>,
}

impl<A, V, F> Memoized<A, V, F>
where
    A: Serialize,
    V: Serialize + DeserializeOwned,
{
    pub fn new(
        namespace: impl Into<String>,
        ttl: Duration,
        base: &MultiTierCache,
        fetch: F,
    ) -> Result<Self, CacheError> {
        let namespace = namespace.into();
        if !base.claim_namespace(&namespace) {
            return Err(CacheError::NamespaceInUse(namespace));
        }
        debug!(%namespace, ?ttl, "memoizer registered");

        Ok(Self {
            namespace,
            ttl,
            cache: base.isolated_with_ttl(ttl),
            fetch,
            _marker: PhantomData,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The memoizer's own cache; projections use it to drop stale results.
    pub fn cache(&self) -> &MultiTierCache {
        &self.cache
    }

    pub fn key_for(&self, args: &A) -> Result<String, CacheError> {
        let value = serde_json::to_value(args).map_err(|e| CacheError::Serialization(e.to_string()))?;
        let mut canonical = String::new();
        write_canonical(&value, &mut canonical);

        let digest = Sha256::digest(canonical.as_bytes());
        Ok(format!("{}:{}", self.namespace, hex::encode(digest)))
    }

    /// Return the cached result for `args`, or run the wrapped function and cache it.
    pub async fn call<Fut, E>(&self, args: A) -> Result<Option<V>, E>
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<Option<V>, E>>,
    {
        let key = match self.key_for(&args) {
            Ok(key) => key,
            Err(err) => {
                warn!(namespace = %self.namespace, error = %err, "memo key derivation failed; bypassing cache");
                return (self.fetch)(args).await;
            }
        };

        if let Some(hit) = self.cache.get_as::<V>(&key).await {
            debug!(%key, "memo hit");
            return Ok(Some(hit));
        }

        let result = (self.fetch)(args).await?;
        if let Some(value) = &result {
            self.cache.set_as(&key, value, Some(self.ttl)).await;
        }
        Ok(result)
    }

    pub async fn invalidate(&self, args: &A) -> bool {
        match self.key_for(args) {
            Ok(key) => self.cache.invalidate(&key).await,
            Err(_) => false,
        }
    }

    pub async fn invalidate_all(&self) -> usize {
        self.cache.invalidate_pattern(&format!("{}:", self.namespace)).await
    }
}

impl<A, V, F> Drop for Memoized<A, V, F> {
    fn drop(&mut self) {
        self.cache.release_namespace(&self.namespace);
    }
}

impl<A, V, F> core::fmt::Debug for Memoized<A, V, F> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Memoized")
            .field("namespace", &self.namespace)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

fn write_canonical(value: &JsonValue, out: &mut String) {
    match value {
        JsonValue::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&JsonValue::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        JsonValue::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}
