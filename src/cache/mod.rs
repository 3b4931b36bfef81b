//! Tiered cache: a bounded local LRU tier in front of an optional shared
//! external tier.

mod external;
mod local;
mod manager;
mod stampede;

pub use external::{ExternalCache, RedisCache};
#[cfg(test)]
pub(crate) use external::testing;
pub use manager::{CacheManager, CacheStats, CacheTypeStats, ExternalTierStats, Invalidated};
pub use stampede::StampedeGuard;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::config::CacheTypeConfig;
use crate::error::AppError;

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Redis error: {0}")]
    Redis(String),

    #[error("External cache timed out after {0:?}")]
    Timeout(Duration),

    #[error("External cache circuit is open")]
    CircuitOpen,

    #[error("Entry of {size} bytes exceeds the memory budget of {budget} bytes")]
    EntryTooLarge { size: usize, budget: usize },

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Cache internal error: {0}")]
    Internal(String),
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Redis(err.to_string())
    }
}

impl From<deadpool_redis::PoolError> for CacheError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        CacheError::Redis(err.to_string())
    }
}

impl From<CacheError> for AppError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Serialization(e) => AppError::Serialization(e),
            CacheError::Redis(e) => AppError::Redis(e),
            CacheError::Timeout(d) => AppError::Timeout(format!("external cache after {:?}", d)),
            CacheError::CircuitOpen => AppError::CircuitOpen {
                name: "cache.external".to_string(),
                retry_after: Duration::ZERO,
            },
            CacheError::EntryTooLarge { .. } => AppError::ResourceExhausted(err.to_string()),
            CacheError::InvalidPattern(e) => AppError::Validation(e),
            CacheError::Internal(e) => AppError::Internal(e),
        }
    }
}

/// Logical partition of the cache; each type carries its own defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    Connection,
    Session,
    User,
    Message,
    Server,
    General,
}

impl CacheType {
    pub const ALL: [CacheType; 6] = [
        CacheType::Connection,
        CacheType::Session,
        CacheType::User,
        CacheType::Message,
        CacheType::Server,
        CacheType::General,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheType::Connection => "connection",
            CacheType::Session => "session",
            CacheType::User => "user",
            CacheType::Message => "message",
            CacheType::Server => "server",
            CacheType::General => "general",
        }
    }

    pub fn default_config(&self) -> CacheTypeConfig {
        match self {
            CacheType::Connection => CacheTypeConfig::new(3600.0, 10_000),
            CacheType::Session => CacheTypeConfig::new(1800.0, 10_000),
            CacheType::User => CacheTypeConfig::new(900.0, 5_000),
            CacheType::Message => CacheTypeConfig::new(300.0, 20_000),
            CacheType::Server => CacheTypeConfig::new(60.0, 1_000),
            CacheType::General => CacheTypeConfig::new(600.0, 10_000),
        }
    }
}

impl std::fmt::Display for CacheType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Victim selection when a cache type reaches its `max_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Least recently accessed
    #[default]
    Lru,
    /// Least frequently accessed
    Lfu,
    /// Soonest to expire
    Ttl,
}

/// Per-write overrides of the cache type defaults
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
}

impl SetOptions {
    pub fn ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Default::default()
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }
}

/// Cache entry held by the local tier
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub cache_type: CacheType,
    pub created_at: Instant,
    pub accessed_at: Instant,
    pub access_count: u64,
    pub ttl: Option<Duration>,
    pub size_bytes: usize,
    pub tags: HashSet<String>,
    /// Monotonic recency stamp; the smallest is the least recently accessed
    pub(crate) recency: u64,
}

impl CacheEntry {
    pub fn new(
        key: impl Into<String>,
        value: Vec<u8>,
        cache_type: CacheType,
        ttl: Option<Duration>,
        tags: HashSet<String>,
    ) -> Self {
        let key = key.into();
        let now = Instant::now();
        let size_bytes = key.len() + value.len();
        Self {
            key,
            value,
            cache_type,
            created_at: now,
            accessed_at: now,
            access_count: 0,
            ttl,
            size_bytes,
            tags,
            recency: 0,
        }
    }

    pub fn expires_at(&self) -> Option<Instant> {
        self.ttl.map(|ttl| self.created_at + ttl)
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.expires_at().map(|at| now >= at).unwrap_or(false)
    }

    pub fn touch(&mut self, now: Instant) {
        self.accessed_at = now;
        self.access_count += 1;
    }
}

/// Build a cache key from parts
pub fn make_cache_key(parts: &[&str]) -> String {
    parts.join(":")
}

/// Namespaced key shared by both tiers: `<domain>:<cache_type>:<key>`
pub fn namespaced_key(domain: &str, cache_type: CacheType, key: &str) -> String {
    format!("{}:{}:{}", domain, cache_type, key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespaced_key() {
        assert_eq!(
            namespaced_key("realtime", CacheType::Connection, "sid-1"),
            "realtime:connection:sid-1"
        );
        assert_eq!(make_cache_key(&["user", "42", "prefs"]), "user:42:prefs");
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expiry() {
        let entry = CacheEntry::new(
            "k",
            b"value".to_vec(),
            CacheType::General,
            Some(Duration::from_secs(5)),
            HashSet::new(),
        );
        assert_eq!(entry.size_bytes, 6);
        assert!(!entry.is_expired(Instant::now()));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(entry.is_expired(Instant::now()));
    }
}
