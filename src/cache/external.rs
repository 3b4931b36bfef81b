use async_trait::async_trait;
use deadpool_redis::{Connection, Pool as RedisPool};
use redis::AsyncCommands;
use std::time::Duration;

use super::CacheResult;

/// Shared, network-accessed cache tier. Keys arrive fully namespaced.
#[async_trait]
pub trait ExternalCache: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Store with a server-side TTL when one is given
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CacheResult<()>;

    async fn delete(&self, keys: &[String]) -> CacheResult<usize>;

    /// Delete every key matching a glob pattern
    async fn delete_pattern(&self, pattern: &str) -> CacheResult<usize>;

    async fn tag(&self, key: &str, tags: &[String], ttl: Option<Duration>) -> CacheResult<()>;

    /// Keys recorded under any of `tags`; the tag sets are dropped
    async fn take_tagged(&self, tags: &[String]) -> CacheResult<Vec<String>>;

    async fn ping(&self) -> CacheResult<()>;
}

/// Redis-backed external tier
pub struct RedisCache {
    pool: RedisPool,
    domain: String,
}

impl RedisCache {
    pub fn new(pool: RedisPool, domain: impl Into<String>) -> Self {
        Self {
            pool,
            domain: domain.into(),
        }
    }

    fn tag_key(&self, tag: &str) -> String {
        format!("{}:tag:{}", self.domain, tag)
    }

    async fn get_connection(&self) -> CacheResult<Connection> {
        self.pool.get().await.map_err(|e| e.into())
    }
}

/// Millisecond expiry, rounded up so Redis never drops a key before the
/// local entry expires. Redis rejects a zero expiry.
fn ttl_millis(ttl: Duration) -> u64 {
    let millis = ttl.as_nanos().div_ceil(1_000_000);
    u64::try_from(millis).unwrap_or(u64::MAX).max(1)
}

#[async_trait]
impl ExternalCache for RedisCache {
    async fn get(&self, key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut conn = self.get_connection().await?;
        let data: Option<Vec<u8>> = conn.get(key).await?;
        Ok(data)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> CacheResult<()> {
        let mut conn = self.get_connection().await?;
        match ttl {
            Some(ttl) => conn.pset_ex::<_, _, ()>(key, value, ttl_millis(ttl)).await?,
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> CacheResult<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.get_connection().await?;
        let deleted: usize = conn.del(keys).await?;
        Ok(deleted)
    }

    async fn delete_pattern(&self, pattern: &str) -> CacheResult<usize> {
        let mut conn = self.get_connection().await?;
        let mut cursor: u64 = 0;
        let mut deleted = 0;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(500)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                let removed: usize = conn.del(&keys).await?;
                deleted += removed;
            }

            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(deleted)
    }

    async fn tag(&self, key: &str, tags: &[String], ttl: Option<Duration>) -> CacheResult<()> {
        if tags.is_empty() {
            return Ok(());
        }
        let mut conn = self.get_connection().await?;
        for tag in tags {
            let tag_key = self.tag_key(tag);
            conn.sadd::<_, _, ()>(&tag_key, key).await?;
            if let Some(ttl) = ttl {
                let millis = i64::try_from(ttl_millis(ttl)).unwrap_or(i64::MAX);
                conn.pexpire::<_, ()>(&tag_key, millis).await?;
            }
        }
        Ok(())
    }

    async fn take_tagged(&self, tags: &[String]) -> CacheResult<Vec<String>> {
        let mut conn = self.get_connection().await?;
        let mut keys = Vec::new();
        for tag in tags {
            let tag_key = self.tag_key(tag);
            let members: Vec<String> = conn.smembers(&tag_key).await?;
            keys.extend(members);
            conn.del::<_, ()>(&tag_key).await?;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn ping(&self) -> CacheResult<()> {
        let mut conn = self.get_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_keeps_fractional_seconds() {
        assert_eq!(ttl_millis(Duration::from_millis(1900)), 1900);
        assert_eq!(ttl_millis(Duration::from_secs(300)), 300_000);
        assert_eq!(ttl_millis(Duration::from_micros(1500)), 2);
        assert_eq!(ttl_millis(Duration::ZERO), 1);
    }
}
