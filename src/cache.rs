//! Read-through cache with time-based expiry.
//!
//! Each entry lives for a fixed TTL after it was inserted. A miss runs the
//! fetch closure once and stores its result; callers inside the window all
//! get the same `Arc`. Two callers missing at the same time both fetch and
//! the last insert wins. Failed fetches are not cached.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

/// Source of the current time, injectable for tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<Instant>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

struct CacheEntry<V> {
    value: Arc<V>,
    inserted_at: Instant,
}

#[derive(Debug, Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
}

pub struct TtlCache<V> {
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    stats: CacheStats,
}

impl<V> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            clock,
            stats: CacheStats::default(),
        }
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Cached value for `key` if it has not expired.
    pub async fn get(&self, key: &str) -> Option<Arc<V>> {
        let now = self.clock.now();
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|entry| now.saturating_duration_since(entry.inserted_at) < self.ttl)
            .map(|entry| Arc::clone(&entry.value))
    }

    pub async fn insert(&self, key: &str, value: V) -> Arc<V> {
        let value = Arc::new(value);
        let entry = CacheEntry {
            value: Arc::clone(&value),
            inserted_at: self.clock.now(),
        };
        self.entries.write().await.insert(key.to_string(), entry);
        value
    }

    pub async fn get_or_try_insert_with<F, Fut, E>(&self, key: &str, fetch: F) -> Result<Arc<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(key).await {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key, "cache hit");
            return Ok(value);
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        debug!(key, "cache miss");
        let value = fetch().await?;
        Ok(self.insert(key, value).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_cache(ttl_secs: u64) -> (TtlCache<Vec<u8>>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let cache = TtlCache::with_clock(Duration::from_secs(ttl_secs), clock.clone());
        (cache, clock)
    }

    #[tokio::test]
    async fn same_value_within_ttl() {
        let (cache, clock) = counting_cache(600);
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let fetch = || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ()>(vec![1, 2, 3])
        };

        let first = cache.get_or_try_insert_with("prices", fetch).await.unwrap();
        clock.advance(Duration::from_secs(599));
        let second = cache.get_or_try_insert_with("prices", fetch).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().hits.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn refetches_after_expiry() {
        let (cache, clock) = counting_cache(600);
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let fetch = || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ()>(vec![n as u8])
        };

        let first = cache.get_or_try_insert_with("prices", fetch).await.unwrap();
        clock.advance(Duration::from_secs(600));
        let second = cache.get_or_try_insert_with("prices", fetch).await.unwrap();

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(*second, vec![1]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let (cache, _clock) = counting_cache(600);

        let failed = cache
            .get_or_try_insert_with("prices", || async { Err::<Vec<u8>, _>("boom") })
            .await;
        assert!(failed.is_err());
        assert!(cache.get("prices").await.is_none());

        let ok = cache
            .get_or_try_insert_with("prices", || async { Ok::<_, &str>(vec![7]) })
            .await
            .unwrap();
        assert_eq!(*ok, vec![7]);
    }

    #[tokio::test]
    async fn keys_expire_independently() {
        let (cache, clock) = counting_cache(10);
        cache.insert("a", vec![1]).await;
        clock.advance(Duration::from_secs(6));
        cache.insert("b", vec![2]).await;
        clock.advance(Duration::from_secs(6));

        assert!(cache.get("a").await.is_none());
        assert_eq!(*cache.get("b").await.unwrap(), vec![2]);
    }
}
