//! Redis-backed shared cache tier (feature `redis`).

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use serde_json::Value as JsonValue;
use tracing::{info, instrument};

use super::shared::{CacheError, SharedCache};

/// Shared cache on Redis: `SET .. EX` writes, `SCAN MATCH` + `DEL` prefix removal.
///
/// Every key is stored under `key_prefix`, so several deployments can share one
/// Redis without clashing. Keys returned by `delete_prefix` have the prefix stripped.
#[derive(Clone)]
pub struct RedisSharedCache {
    conn: MultiplexedConnection,
    key_prefix: String,
}

impl RedisSharedCache {
    #[instrument(skip(redis_url), err)]
    pub async fn connect(redis_url: &str, key_prefix: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(redis_url).map_err(unavailable)?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(unavailable)?;

        let _: String = redis::cmd("PING").query_async(&mut conn).await.map_err(unavailable)?;
        info!(key_prefix, "connected to redis shared cache");

        Ok(Self {
            conn,
            key_prefix: key_prefix.to_string(),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }
}

impl core::fmt::Debug for RedisSharedCache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisSharedCache")
            .field("key_prefix", &self.key_prefix)
            .finish_non_exhaustive()
    }
}

fn unavailable(err: redis::RedisError) -> CacheError {
    CacheError::Unavailable(err.to_string())
}

#[async_trait]
impl SharedCache for RedisSharedCache {
    async fn get(&self, key: &str) -> Result<Option<JsonValue>, CacheError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = redis::cmd("GET")
            .arg(self.full_key(key))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;

        raw.map(|s| serde_json::from_str(&s))
            .transpose()
            .map_err(|e| CacheError::Serialization(e.to_string()))
    }

    async fn set_ex(&self, key: &str, value: &JsonValue, ttl: Duration) -> Result<(), CacheError> {
        let data = serde_json::to_string(value).map_err(|e| CacheError::Serialization(e.to_string()))?;
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(self.full_key(key))
            .arg(data)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(unavailable)
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = redis::cmd("DEL")
            .arg(self.full_key(key))
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        Ok(deleted > 0)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", self.full_key(prefix));
        let mut cursor: u64 = 0;
        let mut removed = Vec::new();

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(unavailable)?;

            if !keys.is_empty() {
                let _: i64 = redis::cmd("DEL")
                    .arg(&keys)
                    .query_async(&mut conn)
                    .await
                    .map_err(unavailable)?;
                removed.extend(
                    keys.into_iter()
                        .filter_map(|k| k.strip_prefix(&self.key_prefix).map(str::to_string)),
                );
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        Ok(removed)
    }
}
