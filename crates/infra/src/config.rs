//! Engine configuration loaded from environment variables.
//!
//! | Variable | Default |
//! |---|---|
//! | `DATABASE_URL` | unset (in-memory event store) |
//! | `REDIS_URL` | unset (in-memory L2 cache) |
//! | `ATELIER_L1_CAPACITY` | 1000 |
//! | `ATELIER_CACHE_TTL_SECS` | 3600 |
//! | `ATELIER_L2_TIMEOUT_MS` | 250 |
//! | `ATELIER_DB_TIMEOUT_MS` | 5000 |
//! | `ATELIER_DEAD_LETTER_CAPACITY` | 1000 |
//! | `ATELIER_MAX_BATCH_SIZE` | 100 |
//! | `ATELIER_L2_KEY_PREFIX` | `atelier:` |

use std::num::NonZeroUsize;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

const DEFAULT_L1_CAPACITY: NonZeroUsize = NonZeroUsize::new(1_000).unwrap();
const DEFAULT_DEAD_LETTER_CAPACITY: NonZeroUsize = NonZeroUsize::new(1_000).unwrap();
const DEFAULT_MAX_BATCH_SIZE: NonZeroUsize = NonZeroUsize::new(100).unwrap();

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: '{value}'")]
    Invalid { var: &'static str, value: String },

    #[error("{var} must be greater than zero")]
    Zero { var: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub l1_capacity: NonZeroUsize,
    pub default_ttl: Duration,
    pub l2_timeout: Duration,
    pub db_timeout: Duration,
    pub dead_letter_capacity: NonZeroUsize,
    pub max_batch_size: NonZeroUsize,
    pub l2_key_prefix: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            redis_url: None,
            l1_capacity: DEFAULT_L1_CAPACITY,
            default_ttl: Duration::from_secs(3_600),
            l2_timeout: Duration::from_millis(250),
            db_timeout: Duration::from_millis(5_000),
            dead_letter_capacity: DEFAULT_DEAD_LETTER_CAPACITY,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            l2_key_prefix: "atelier:".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load from an arbitrary variable source. Unset and blank variables take the default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &str| lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        Ok(Self {
            database_url: get("DATABASE_URL"),
            redis_url: get("REDIS_URL"),
            l1_capacity: non_zero(&get, "ATELIER_L1_CAPACITY", defaults.l1_capacity)?,
            default_ttl: parse(&get, "ATELIER_CACHE_TTL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_ttl),
            l2_timeout: parse(&get, "ATELIER_L2_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.l2_timeout),
            db_timeout: parse(&get, "ATELIER_DB_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.db_timeout),
            dead_letter_capacity: non_zero(
                &get,
                "ATELIER_DEAD_LETTER_CAPACITY",
                defaults.dead_letter_capacity,
            )?,
            max_batch_size: non_zero(&get, "ATELIER_MAX_BATCH_SIZE", defaults.max_batch_size)?,
            l2_key_prefix: get("ATELIER_L2_KEY_PREFIX").unwrap_or(defaults.l2_key_prefix),
        })
    }
}

fn parse<T, G>(get: &G, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    get(var)
        .map(|value| value.parse::<T>().map_err(|_| ConfigError::Invalid { var, value }))
        .transpose()
}

fn non_zero<G>(get: &G, var: &'static str, default: NonZeroUsize) -> Result<NonZeroUsize, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match parse::<usize, G>(get, var)? {
        None => Ok(default),
        Some(n) => NonZeroUsize::new(n).ok_or(ConfigError::Zero { var }),
    }
}
