use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::time::Instant;

use super::{CacheEntry, CacheError, CacheResult, CacheType, EvictionPolicy};
use crate::config::CacheTypeConfig;

pub(crate) enum LocalLookup {
    Hit(Vec<u8>),
    Expired,
    Miss,
}

/// Bounded in-process tier.
///
/// Entries are keyed by their namespaced key. Recency is tracked per cache
/// type as a `BTreeMap<stamp, key>`, so the least recently accessed entry of
/// a type is its first element and the global LRU entry is the smallest first
/// element across types. Callers hold the manager's lock around every call.
pub(crate) struct LocalTier {
    entries: HashMap<String, CacheEntry>,
    recency: HashMap<CacheType, BTreeMap<u64, String>>,
    tags: HashMap<String, HashSet<String>>,
    memory_bytes: usize,
    max_memory_bytes: usize,
    clock: u64,
}

impl LocalTier {
    pub(crate) fn new(max_memory_bytes: usize) -> Self {
        Self {
            entries: HashMap::new(),
            recency: HashMap::new(),
            tags: HashMap::new(),
            memory_bytes: 0,
            max_memory_bytes,
            clock: 0,
        }
    }

    fn next_stamp(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    pub(crate) fn get(&mut self, key: &str, now: Instant) -> LocalLookup {
        let (expired, old_stamp, cache_type) = match self.entries.get(key) {
            Some(entry) => (entry.is_expired(now), entry.recency, entry.cache_type),
            None => return LocalLookup::Miss,
        };

        if expired {
            self.remove(key);
            return LocalLookup::Expired;
        }

        let stamp = self.next_stamp();
        if let Some(order) = self.recency.get_mut(&cache_type) {
            order.remove(&old_stamp);
            order.insert(stamp, key.to_string());
        }

        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.touch(now);
                entry.recency = stamp;
                LocalLookup::Hit(entry.value.clone())
            }
            None => LocalLookup::Miss,
        }
    }

    /// Insert or replace an entry, evicting as needed. Returns the evicted
    /// entries.
    pub(crate) fn insert(
        &mut self,
        key: String,
        mut entry: CacheEntry,
        type_config: &CacheTypeConfig,
    ) -> CacheResult<Vec<CacheEntry>> {
        if entry.size_bytes > self.max_memory_bytes {
            return Err(CacheError::EntryTooLarge {
                size: entry.size_bytes,
                budget: self.max_memory_bytes,
            });
        }

        self.remove(&key);

        let mut evicted = Vec::new();
        let cache_type = entry.cache_type;

        while self.count(cache_type) >= type_config.max_size {
            match self.victim_for_type(cache_type, type_config.eviction_policy) {
                Some(victim) => evicted.extend(self.remove(&victim)),
                None => break,
            }
        }

        while self.memory_bytes + entry.size_bytes > self.max_memory_bytes {
            match self.global_lru_victim() {
                Some(victim) => evicted.extend(self.remove(&victim)),
                None => break,
            }
        }

        entry.recency = self.next_stamp();
        self.recency
            .entry(cache_type)
            .or_default()
            .insert(entry.recency, key.clone());
        for tag in &entry.tags {
            self.tags.entry(tag.clone()).or_default().insert(key.clone());
        }
        self.memory_bytes += entry.size_bytes;
        self.entries.insert(key, entry);

        Ok(evicted)
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;

        if let Some(order) = self.recency.get_mut(&entry.cache_type) {
            order.remove(&entry.recency);
        }
        for tag in &entry.tags {
            if let Some(keys) = self.tags.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tags.remove(tag);
                }
            }
        }
        self.memory_bytes = self.memory_bytes.saturating_sub(entry.size_bytes);

        Some(entry)
    }

    fn victim_for_type(&self, cache_type: CacheType, policy: EvictionPolicy) -> Option<String> {
        let order = self.recency.get(&cache_type)?;
        // iteration follows recency, so ties fall back to LRU
        let mut in_order = order
            .values()
            .filter_map(|k| self.entries.get(k).map(|e| (k, e)));

        let victim = match policy {
            EvictionPolicy::Lru => in_order.next(),
            EvictionPolicy::Lfu => in_order.min_by_key(|(_, e)| e.access_count),
            EvictionPolicy::Ttl => in_order
                .filter(|(_, e)| e.ttl.is_some())
                .min_by_key(|(_, e)| e.expires_at()),
        };

        victim
            .map(|(k, _)| k.clone())
            .or_else(|| order.values().next().cloned())
    }

    fn global_lru_victim(&self) -> Option<String> {
        self.recency
            .values()
            .filter_map(|order| order.iter().next())
            .min_by_key(|(stamp, _)| **stamp)
            .map(|(_, key)| key.clone())
    }

    pub(crate) fn count(&self, cache_type: CacheType) -> usize {
        self.recency.get(&cache_type).map(|o| o.len()).unwrap_or(0)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn memory_bytes(&self) -> usize {
        self.memory_bytes
    }

    pub(crate) fn keys_with_any_tag(&self, tags: &[String]) -> Vec<String> {
        let mut keys: HashSet<&String> = HashSet::new();
        for tag in tags {
            if let Some(tagged) = self.tags.get(tag) {
                keys.extend(tagged.iter());
            }
        }
        keys.into_iter().cloned().collect()
    }

    /// Namespaced keys whose user key matches `pattern`
    pub(crate) fn keys_matching(&self, pattern: &Regex, cache_type: Option<CacheType>) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, e)| cache_type.map(|t| t == e.cache_type).unwrap_or(true))
            .filter(|(_, e)| pattern.is_match(&e.key))
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub(crate) fn purge_expired(&mut self, now: Instant) -> Vec<CacheEntry> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();

        expired.iter().filter_map(|k| self.remove(k)).collect()
    }

    pub(crate) fn clear(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        self.recency.clear();
        self.tags.clear();
        self.memory_bytes = 0;
        count
    }
}

/// Translate a glob (`*`, `?`) into an anchored regex.
pub(crate) fn glob_to_regex(pattern: &str) -> CacheResult<Regex> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            c => expr.push_str(&regex::escape(&c.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|e| CacheError::InvalidPattern(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn entry(key: &str, cache_type: CacheType, bytes: usize) -> CacheEntry {
        CacheEntry::new(key, vec![0u8; bytes], cache_type, None, HashSet::new())
    }

    fn insert(tier: &mut LocalTier, key: &str, cfg: &CacheTypeConfig) -> Vec<CacheEntry> {
        tier.insert(
            format!("t:general:{}", key),
            entry(key, CacheType::General, 8),
            cfg,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_lru_evicts_least_recently_accessed() {
        let cfg = CacheTypeConfig::new(60.0, 3);
        let mut tier = LocalTier::new(1 << 20);
        insert(&mut tier, "a", &cfg);
        insert(&mut tier, "b", &cfg);
        insert(&mut tier, "c", &cfg);

        // "a" becomes most recent, "b" is now the LRU entry
        assert!(matches!(tier.get("t:general:a", Instant::now()), LocalLookup::Hit(_)));

        let evicted = insert(&mut tier, "d", &cfg);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].key, "b");
        assert_eq!(tier.count(CacheType::General), 3);
        assert!(matches!(tier.get("t:general:b", Instant::now()), LocalLookup::Miss));
    }

    #[tokio::test]
    async fn test_lfu_policy() {
        let mut cfg = CacheTypeConfig::new(60.0, 2);
        cfg.eviction_policy = EvictionPolicy::Lfu;
        let mut tier = LocalTier::new(1 << 20);
        insert(&mut tier, "hot", &cfg);
        insert(&mut tier, "cold", &cfg);
        for _ in 0..3 {
            tier.get("t:general:hot", Instant::now());
        }
        tier.get("t:general:cold", Instant::now());

        let evicted = insert(&mut tier, "new", &cfg);
        assert_eq!(evicted[0].key, "cold");
    }

    #[tokio::test]
    async fn test_memory_budget_evicts_globally() {
        let cfg = CacheTypeConfig::new(60.0, 100);
        // each entry is key (1 byte) + 8 bytes
        let mut tier = LocalTier::new(27);
        insert(&mut tier, "a", &cfg);
        tier.insert(
            "t:session:b".into(),
            entry("b", CacheType::Session, 8),
            &cfg,
        )
        .unwrap();
        insert(&mut tier, "c", &cfg);
        assert_eq!(tier.memory_bytes(), 27);

        let evicted = insert(&mut tier, "d", &cfg);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].key, "a");
        assert_eq!(tier.memory_bytes(), 27);

        let too_big = tier.insert(
            "t:general:huge".into(),
            entry("huge", CacheType::General, 64),
            &cfg,
        );
        assert!(matches!(too_big, Err(CacheError::EntryTooLarge { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_purged() {
        let cfg = CacheTypeConfig::new(60.0, 10);
        let mut tier = LocalTier::new(1 << 20);
        let mut short = entry("short", CacheType::General, 4);
        short.ttl = Some(Duration::from_secs(1));
        tier.insert("t:general:short".into(), short, &cfg).unwrap();
        insert(&mut tier, "long", &cfg);

        tokio::time::advance(Duration::from_secs(2)).await;
        let purged = tier.purge_expired(Instant::now());
        assert_eq!(purged.len(), 1);
        assert_eq!(tier.len(), 1);
    }

    #[tokio::test]
    async fn test_tag_index_follows_removal() {
        let cfg = CacheTypeConfig::new(60.0, 10);
        let mut tier = LocalTier::new(1 << 20);
        let tags: HashSet<String> = ["user:1".to_string()].into_iter().collect();
        tier.insert(
            "t:user:x".into(),
            CacheEntry::new("x", vec![1], CacheType::User, None, tags),
            &cfg,
        )
        .unwrap();

        assert_eq!(tier.keys_with_any_tag(&["user:1".into()]), vec!["t:user:x"]);
        tier.remove("t:user:x");
        assert!(tier.keys_with_any_tag(&["user:1".into()]).is_empty());
    }

    #[test]
    fn test_glob_to_regex() {
        let re = glob_to_regex("session:*:meta?").unwrap();
        assert!(re.is_match("session:abc:meta1"));
        assert!(!re.is_match("session:abc:meta"));
        assert!(!re.is_match("xsession:abc:meta1"));

        let literal = glob_to_regex("a.b").unwrap();
        assert!(!literal.is_match("axb"));
    }
}
