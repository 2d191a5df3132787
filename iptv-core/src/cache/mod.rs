//! Fast key-value cache and job queue.
//!
//! Every caller treats this service as advisory: key material has a durable
//! copy on disk, demand counters fall back to a default priority, and jobs
//! that never reach the queue are found by workers scanning the store.

pub mod memory;
pub mod redis;

use std::fmt;
use std::time::Duration;

use chrono::NaiveDate;
use thiserror::Error;

pub use self::memory::MemoryCache;
pub use self::redis::RedisCache;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("cache operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("cache unavailable: {0}")]
    Unavailable(String),
    #[error("unexpected cache value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

pub type CacheResult<T> = Result<T, CacheError>;

#[async_trait::async_trait]
pub trait FastCache: Send + Sync + fmt::Debug {
    async fn get(&self, key: &str) -> CacheResult<Option<String>>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> CacheResult<()>;

    /// Atomically increments an integer counter, creating it at zero first.
    async fn incr(&self, key: &str) -> CacheResult<i64>;

    async fn push_job(&self, queue: &str, payload: &str) -> CacheResult<()>;

    async fn pop_job(&self, queue: &str) -> CacheResult<Option<String>>;
}

/// Key naming for everything this crate stores in the cache.
#[derive(Debug, Clone)]
pub struct CacheKeys {
    prefix: String,
}

impl CacheKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn key_material(&self, channel: &str, day: NaiveDate) -> String {
        format!("{}:key:{}:{}", self.prefix, channel, day.format("%Y-%m-%d"))
    }

    pub fn demand(&self, canonical_id: &str) -> String {
        format!("{}:demand:{}", self.prefix, canonical_id)
    }

    pub fn acquisition_jobs(&self) -> String {
        format!("{}:acquisition:jobs", self.prefix)
    }
}

impl Default for CacheKeys {
    fn default() -> Self {
        Self::new("iptv")
    }
}
