//! Multi-tier caching: process-local L1, shared L2, and memoization on top.

pub mod local;
pub mod memoize;
pub mod multi_tier;
#[cfg(feature = "redis")]
pub mod redis;
pub mod shared;

pub use local::LocalCache;
pub use memoize::Memoized;
pub use multi_tier::{CacheOptions, CacheStats, MultiTierCache};
#[cfg(feature = "redis")]
pub use redis::RedisSharedCache;
pub use shared::{CacheError, InMemorySharedCache, SharedCache};
