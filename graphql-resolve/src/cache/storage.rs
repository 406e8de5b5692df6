use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use tokio::time::Instant;
use tower::BoxError;

use super::CacheEntry;
use super::LoaderCache;

#[derive(Clone, Debug)]
struct StoredValue {
    value: Bytes,
    expires_at: Option<Instant>,
}

/// In-process [`LoaderCache`] bounded by entry count, with per-entry expiry.
#[derive(Clone)]
pub struct InMemoryLoaderCache {
    inner: Arc<Mutex<LruCache<String, StoredValue>>>,
    default_ttl: Option<Duration>,
}

impl InMemoryLoaderCache {
    pub fn new(max_capacity: NonZeroUsize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(LruCache::new(max_capacity))),
            default_ttl: None,
        }
    }

    /// Used for entries stored with a zero TTL.
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

#[async_trait]
impl LoaderCache for InMemoryLoaderCache {
    async fn get(&self, keys: &[String]) -> Result<Vec<Option<CacheEntry>>, BoxError> {
        let now = Instant::now();
        let mut guard = self.inner.lock();
        Ok(keys
            .iter()
            .map(|key| {
                let stored = guard.get(key)?.clone();
                if stored.expires_at.is_some_and(|expires_at| expires_at <= now) {
                    guard.pop(key);
                    return None;
                }
                Some(CacheEntry {
                    key: key.clone(),
                    value: stored.value,
                })
            })
            .collect())
    }

    async fn set(&self, entries: Vec<CacheEntry>, ttl: Duration) -> Result<(), BoxError> {
        let ttl = Some(ttl)
            .filter(|ttl| !ttl.is_zero())
            .or(self.default_ttl);
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        let mut guard = self.inner.lock();
        for entry in entries {
            guard.put(
                entry.key,
                StoredValue {
                    value: entry.value,
                    expires_at,
                },
            );
        }
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), BoxError> {
        let mut guard = self.inner.lock();
        for key in keys {
            guard.pop(key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, value: &'static str) -> CacheEntry {
        CacheEntry {
            key: key.to_string(),
            value: Bytes::from_static(value.as_bytes()),
        }
    }

    fn keys(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|key| key.to_string()).collect()
    }

    #[tokio::test]
    async fn returns_hits_in_key_order() {
        let cache = InMemoryLoaderCache::new(NonZeroUsize::new(8).unwrap());
        cache
            .set(vec![entry("a", "1"), entry("c", "3")], Duration::ZERO)
            .await
            .unwrap();
        let hits = cache.get(&keys(&["a", "b", "c"])).await.unwrap();
        assert_eq!(hits, vec![Some(entry("a", "1")), None, Some(entry("c", "3"))]);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire() {
        let cache = InMemoryLoaderCache::new(NonZeroUsize::new(8).unwrap())
            .with_default_ttl(Duration::from_secs(60));
        cache
            .set(vec![entry("short", "1")], Duration::from_secs(1))
            .await
            .unwrap();
        cache
            .set(vec![entry("default", "2")], Duration::ZERO)
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        let hits = cache.get(&keys(&["short", "default"])).await.unwrap();
        assert_eq!(hits, vec![None, Some(entry("default", "2"))]);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn evicts_least_recently_used() {
        let cache = InMemoryLoaderCache::new(NonZeroUsize::new(2).unwrap());
        cache
            .set(vec![entry("a", "1"), entry("b", "2")], Duration::ZERO)
            .await
            .unwrap();
        cache.get(&keys(&["a"])).await.unwrap();
        cache.set(vec![entry("c", "3")], Duration::ZERO).await.unwrap();
        let hits = cache.get(&keys(&["a", "b", "c"])).await.unwrap();
        assert_eq!(hits, vec![Some(entry("a", "1")), None, Some(entry("c", "3"))]);

        cache.delete(&keys(&["a"])).await.unwrap();
        assert_eq!(cache.len(), 1);
    }
}
