use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};

use super::CacheError;

/// Per-key single-flight guard.
///
/// Concurrent callers for the same key queue on one permit; the caller that
/// gets it first computes, the rest re-check the cache once admitted.
pub struct StampedeGuard {
    locks: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl StampedeGuard {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` while holding the key's permit
    pub async fn execute<F, Fut, T, E>(&self, key: &str, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: From<CacheError>,
    {
        let semaphore = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };

        let result = {
            let _permit = semaphore
                .acquire()
                .await
                .map_err(|e| CacheError::Internal(format!("stampede guard closed: {}", e)))?;
            f().await
        };

        // Only the map and this scope still hold the semaphore
        let mut locks = self.locks.lock().await;
        if Arc::strong_count(&semaphore) == 2 {
            locks.remove(key);
        }

        result
    }

    pub async fn in_flight(&self) -> usize {
        self.locks.lock().await.len()
    }
}

impl Default for StampedeGuard {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_serializes_same_key() {
        let guard = Arc::new(StampedeGuard::new());
        let running = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..5 {
            let guard = guard.clone();
            let running = running.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                guard
                    .execute("key", || async {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, CacheError>(())
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(guard.in_flight().await, 0);
    }
}
