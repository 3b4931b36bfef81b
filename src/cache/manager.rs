//! Cache manager for the realtime service
//!
//! Owns the local tier and the optional external tier. Constructed once by
//! the service and shared by reference; there is no global instance.

use serde::{de::DeserializeOwned, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::local::{glob_to_regex, LocalLookup, LocalTier};
use super::{
    namespaced_key, CacheEntry, CacheError, CacheResult, CacheType, ExternalCache, SetOptions,
    StampedeGuard,
};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::config::CacheConfig;
use crate::error::AppResult;
use crate::health::ComponentHealth;

/// Counters for one cache type
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CacheTypeStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub deletes: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
}

impl CacheTypeStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ExternalTierStats {
    pub enabled: bool,
    pub hits: u64,
    pub misses: u64,
    pub errors: u64,
    pub circuit: CircuitState,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub per_type: BTreeMap<CacheType, CacheTypeStats>,
    pub entries: usize,
    pub memory_bytes: usize,
    pub max_memory_bytes: usize,
    pub hit_rate: f64,
    pub external: ExternalTierStats,
}

/// Entries removed by a bulk invalidation, per tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct Invalidated {
    pub local: usize,
    pub external: usize,
}

#[derive(Default)]
struct ExternalCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

pub struct CacheManager {
    config: CacheConfig,
    local: Mutex<LocalTier>,
    external: Option<Arc<dyn ExternalCache>>,
    external_breaker: CircuitBreaker,
    external_counters: ExternalCounters,
    counters: Mutex<HashMap<CacheType, CacheTypeStats>>,
    stampede_guard: StampedeGuard,
}

impl CacheManager {
    /// Local-only cache manager
    pub fn new(config: CacheConfig) -> Self {
        Self {
            local: Mutex::new(LocalTier::new(config.max_memory_bytes)),
            external: None,
            external_breaker: CircuitBreaker::new(
                "cache.external",
                CircuitBreakerConfig {
                    half_open_max_calls: 1,
                    ..Default::default()
                },
            ),
            external_counters: ExternalCounters::default(),
            counters: Mutex::new(HashMap::new()),
            stampede_guard: StampedeGuard::new(),
            config,
        }
    }

    /// Attach the shared tier, guarded by `breaker_config`
    pub fn with_external(
        mut self,
        external: Arc<dyn ExternalCache>,
        breaker_config: CircuitBreakerConfig,
    ) -> Self {
        self.external = Some(external);
        self.external_breaker = CircuitBreaker::new("cache.external", breaker_config);
        self
    }

    pub fn has_external(&self) -> bool {
        self.external.is_some()
    }

    fn key(&self, key: &str, cache_type: CacheType) -> String {
        namespaced_key(&self.config.namespace, cache_type, key)
    }

    async fn count<F>(&self, cache_type: CacheType, f: F)
    where
        F: FnOnce(&mut CacheTypeStats),
    {
        let mut counters = self.counters.lock().await;
        f(counters.entry(cache_type).or_default());
    }

    /// Run one external call behind the breaker and the timeout
    async fn guarded<T>(
        &self,
        op: &'static str,
        call: impl Future<Output = CacheResult<T>>,
    ) -> CacheResult<T> {
        if !self.external_breaker.allow_request().await {
            return Err(CacheError::CircuitOpen);
        }

        let timeout = self.config.external_timeout();
        let result = match tokio::time::timeout(timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Timeout(timeout)),
        };

        match &result {
            Ok(_) => self.external_breaker.record_success().await,
            Err(e) => {
                self.external_breaker.record_failure().await;
                self.external_counters.errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("External cache {} failed: {}", op, e);
            }
        }
        result
    }

    pub async fn get_bytes(&self, key: &str, cache_type: CacheType) -> CacheResult<Option<Vec<u8>>> {
        let ns_key = self.key(key, cache_type);

        let lookup = self.local.lock().await.get(&ns_key, Instant::now());
        match lookup {
            LocalLookup::Hit(value) => {
                self.count(cache_type, |s| s.hits += 1).await;
                return Ok(Some(value));
            }
            LocalLookup::Expired => self.count(cache_type, |s| s.expirations += 1).await,
            LocalLookup::Miss => {}
        }

        if let Some(external) = &self.external {
            match self.guarded("get", external.get(&ns_key)).await {
                Ok(Some(value)) => {
                    self.external_counters.hits.fetch_add(1, Ordering::Relaxed);
                    self.count(cache_type, |s| s.hits += 1).await;
                    self.backfill(ns_key, key, cache_type, value.clone()).await;
                    return Ok(Some(value));
                }
                Ok(None) => {
                    self.external_counters.misses.fetch_add(1, Ordering::Relaxed);
                }
                // degraded: serve as a local miss
                Err(_) => {}
            }
        }

        self.count(cache_type, |s| s.misses += 1).await;
        Ok(None)
    }

    async fn backfill(&self, ns_key: String, key: &str, cache_type: CacheType, value: Vec<u8>) {
        let type_config = self.config.type_config(cache_type);
        let entry = CacheEntry::new(key, value, cache_type, type_config.ttl(), HashSet::new());
        let inserted = self.local.lock().await.insert(ns_key, entry, &type_config);
        match inserted {
            Ok(evicted) if !evicted.is_empty() => {
                let n = evicted.len() as u64;
                self.count(cache_type, |s| s.evictions += n).await;
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("Skipping local backfill for '{}': {}", key, e),
        }
    }

    pub async fn get<V>(&self, key: &str, cache_type: CacheType) -> CacheResult<Option<V>>
    where
        V: DeserializeOwned,
    {
        match self.get_bytes(key, cache_type).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Write to both tiers. TTL and tags default to the cache type config.
    pub async fn set_bytes(
        &self,
        key: &str,
        cache_type: CacheType,
        value: Vec<u8>,
        options: SetOptions,
    ) -> CacheResult<()> {
        let ns_key = self.key(key, cache_type);
        let type_config = self.config.type_config(cache_type);
        let ttl = options.ttl.or_else(|| type_config.ttl());

        let mut external_written = false;
        if let Some(external) = &self.external {
            let written = self
                .guarded("set", external.set(&ns_key, &value, ttl))
                .await
                .is_ok();
            if written && !options.tags.is_empty() {
                let _ = self
                    .guarded("tag", external.tag(&ns_key, &options.tags, ttl))
                    .await;
            }
            external_written = written;
        }

        let tags: HashSet<String> = options.tags.into_iter().collect();
        let entry = CacheEntry::new(key, value, cache_type, ttl, tags);
        let inserted = self.local.lock().await.insert(ns_key, entry, &type_config);

        match inserted {
            Ok(evicted) => {
                let n = evicted.len() as u64;
                if n > 0 {
                    tracing::debug!("Evicted {} {} cache entries", n, cache_type);
                }
                self.count(cache_type, |s| {
                    s.sets += 1;
                    s.evictions += n;
                })
                .await;
                Ok(())
            }
            Err(e) if external_written => {
                tracing::warn!("Cached '{}' in external tier only: {}", key, e);
                self.count(cache_type, |s| s.sets += 1).await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub async fn set<V>(
        &self,
        key: &str,
        value: &V,
        cache_type: CacheType,
        options: SetOptions,
    ) -> CacheResult<()>
    where
        V: Serialize + ?Sized,
    {
        let bytes = serde_json::to_vec(value)?;
        self.set_bytes(key, cache_type, bytes, options).await
    }

    /// Remove from both tiers. Returns whether the key was present anywhere.
    pub async fn delete(&self, key: &str, cache_type: CacheType) -> CacheResult<bool> {
        let ns_key = self.key(key, cache_type);
        let local_removed = self.local.lock().await.remove(&ns_key).is_some();

        let mut external_removed = false;
        if let Some(external) = &self.external {
            if let Ok(n) = self
                .guarded("delete", external.delete(std::slice::from_ref(&ns_key)))
                .await
            {
                external_removed = n > 0;
            }
        }

        if local_removed || external_removed {
            self.count(cache_type, |s| s.deletes += 1).await;
        }
        Ok(local_removed || external_removed)
    }

    /// Remove every entry carrying any of `tags`
    pub async fn delete_by_tags(&self, tags: &[String]) -> CacheResult<Invalidated> {
        let removed: Vec<CacheEntry> = {
            let mut local = self.local.lock().await;
            let keys = local.keys_with_any_tag(tags);
            keys.iter().filter_map(|k| local.remove(k)).collect()
        };
        for entry in &removed {
            self.count(entry.cache_type, |s| s.deletes += 1).await;
        }

        let mut external_count = 0;
        if let Some(external) = &self.external {
            if let Ok(keys) = self.guarded("take_tagged", external.take_tagged(tags)).await {
                if let Ok(n) = self.guarded("delete", external.delete(&keys)).await {
                    external_count = n;
                }
            }
        }

        tracing::debug!(
            "Invalidated tags {:?}: {} local, {} external",
            tags,
            removed.len(),
            external_count
        );
        Ok(Invalidated {
            local: removed.len(),
            external: external_count,
        })
    }

    /// Remove entries whose key matches a glob pattern (`*`, `?`), optionally
    /// within one cache type
    pub async fn invalidate_pattern(
        &self,
        pattern: &str,
        cache_type: Option<CacheType>,
    ) -> CacheResult<Invalidated> {
        let regex = glob_to_regex(pattern)?;
        let removed: Vec<CacheEntry> = {
            let mut local = self.local.lock().await;
            let keys = local.keys_matching(&regex, cache_type);
            keys.iter().filter_map(|k| local.remove(k)).collect()
        };
        for entry in &removed {
            self.count(entry.cache_type, |s| s.deletes += 1).await;
        }

        let mut external_count = 0;
        if let Some(external) = &self.external {
            let type_segment = cache_type.map(|t| t.as_str()).unwrap_or("*");
            let ns_pattern = format!("{}:{}:{}", self.config.namespace, type_segment, pattern);
            if let Ok(n) = self
                .guarded("delete_pattern", external.delete_pattern(&ns_pattern))
                .await
            {
                external_count = n;
            }
        }

        Ok(Invalidated {
            local: removed.len(),
            external: external_count,
        })
    }

    /// Return the cached value or compute and cache it.
    ///
    /// With `single_flight` enabled, concurrent misses for the same key run
    /// the factory once; the others wait and read the stored value.
    pub async fn get_or_set<V, F, Fut>(
        &self,
        key: &str,
        cache_type: CacheType,
        options: SetOptions,
        factory: F,
    ) -> AppResult<V>
    where
        V: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = AppResult<V>>,
    {
        if let Some(value) = self.get::<V>(key, cache_type).await? {
            return Ok(value);
        }

        if !self.config.single_flight {
            let value = factory().await?;
            self.store_computed(key, &value, cache_type, options).await;
            return Ok(value);
        }

        let ns_key = self.key(key, cache_type);
        self.stampede_guard
            .execute(&ns_key, move || async move {
                if let Some(value) = self.get::<V>(key, cache_type).await? {
                    return Ok(value);
                }
                let value = factory().await?;
                self.store_computed(key, &value, cache_type, options).await;
                Ok(value)
            })
            .await
    }

    async fn store_computed<V: Serialize>(
        &self,
        key: &str,
        value: &V,
        cache_type: CacheType,
        options: SetOptions,
    ) {
        if let Err(e) = self.set(key, value, cache_type, options).await {
            tracing::warn!("Computed value for '{}' was not cached: {}", key, e);
        }
    }

    /// Purge TTL-expired local entries
    pub async fn cleanup_expired(&self) -> usize {
        let purged = self.local.lock().await.purge_expired(Instant::now());
        for entry in &purged {
            self.count(entry.cache_type, |s| s.expirations += 1).await;
        }
        purged.len()
    }

    /// Start background cleanup task
    pub fn start_cleanup_task(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let period = cache.config.cleanup_interval();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let cleaned = cache.cleanup_expired().await;
                        if cleaned > 0 {
                            tracing::info!("Cleaned up {} expired cache entries", cleaned);
                        }
                    }
                }
            }
            tracing::debug!("Cache cleanup task stopped");
        })
    }

    /// Clear the local tier and every key of this namespace in the external tier
    pub async fn clear(&self) -> CacheResult<Invalidated> {
        let local = self.local.lock().await.clear();
        let mut external_count = 0;
        if let Some(external) = &self.external {
            let pattern = format!("{}:*", self.config.namespace);
            if let Ok(n) = self
                .guarded("clear", external.delete_pattern(&pattern))
                .await
            {
                external_count = n;
            }
        }
        tracing::info!("Cleared cache ({} local entries)", local);
        Ok(Invalidated {
            local,
            external: external_count,
        })
    }

    pub async fn stats(&self) -> CacheStats {
        let (entries, memory_bytes, per_type_counts) = {
            let local = self.local.lock().await;
            let counts: Vec<(CacheType, usize)> = CacheType::ALL
                .iter()
                .map(|t| (*t, local.count(*t)))
                .collect();
            (local.len(), local.memory_bytes(), counts)
        };

        let counters = self.counters.lock().await;
        let per_type: BTreeMap<CacheType, CacheTypeStats> = per_type_counts
            .into_iter()
            .map(|(t, n)| {
                let mut stats = counters.get(&t).cloned().unwrap_or_default();
                stats.entries = n;
                (t, stats)
            })
            .collect();

        let (hits, misses) = per_type
            .values()
            .fold((0, 0), |(h, m), s| (h + s.hits, m + s.misses));
        let hit_rate = if hits + misses == 0 {
            0.0
        } else {
            hits as f64 / (hits + misses) as f64
        };

        CacheStats {
            per_type,
            entries,
            memory_bytes,
            max_memory_bytes: self.config.max_memory_bytes,
            hit_rate,
            external: ExternalTierStats {
                enabled: self.external.is_some(),
                hits: self.external_counters.hits.load(Ordering::Relaxed),
                misses: self.external_counters.misses.load(Ordering::Relaxed),
                errors: self.external_counters.errors.load(Ordering::Relaxed),
                circuit: self.external_breaker.state().await,
            },
        }
    }

    pub async fn health(&self) -> ComponentHealth {
        let stats = self.stats().await;
        let memory_ratio = stats.memory_bytes as f64 / stats.max_memory_bytes.max(1) as f64;

        let health = if stats.external.enabled && stats.external.circuit == CircuitState::Open {
            ComponentHealth::degraded("external cache tier unavailable, serving local tier only")
        } else if memory_ratio > 0.95 {
            ComponentHealth::degraded(format!(
                "local cache at {:.0}% of memory budget",
                memory_ratio * 100.0
            ))
        } else {
            ComponentHealth::healthy()
        };

        health
            .with_metric("entries", stats.entries)
            .with_metric("memory_bytes", stats.memory_bytes)
            .with_metric("hit_rate", stats.hit_rate)
            .with_metric("external_errors", stats.external.errors)
    }
}
