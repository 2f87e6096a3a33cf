//! Response caches for tileset documents and tile content.
//!
//! Entries are keyed by the request URL with the API key removed, so the
//! same tile fetched under a different key still hits.
//!
//! # Implementations
//!
//! - [`MemoryCache`]: In-memory cache with an optional byte budget
//! - [`NoCache`]: Passthrough implementation that caches nothing

use crate::error::Result;
use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    pin::Pin,
    sync::{Arc, RwLock},
};

/// Future type for cache lookups.
pub type GetFuture<'a> = Pin<Box<dyn Future<Output = Result<Option<Vec<u8>>>> + Send + 'a>>;

/// Future type for cache writes.
pub type CacheFuture<'a> = Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

/// A byte cache keyed by redacted request URL.
pub trait Cache: Send + Sync {
    /// Look up a response body.
    ///
    /// Returns `Ok(None)` on a miss.
    fn get(&self, key: &str) -> GetFuture<'_>;

    /// Store a response body.
    fn put(&self, key: &str, data: Vec<u8>) -> CacheFuture<'_>;
}

/// A cache that stores nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCache;

impl Cache for NoCache {
    fn get(&self, _key: &str) -> GetFuture<'_> {
        Box::pin(async { Ok(None) })
    }

    fn put(&self, _key: &str, _data: Vec<u8>) -> CacheFuture<'_> {
        Box::pin(async { Ok(()) })
    }
}

/// An in-memory cache shared between clones.
///
/// With a byte budget, the oldest inserted entries are evicted first once
/// the budget would be exceeded.
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    inner: Arc<RwLock<MemoryCacheInner>>,
    max_bytes: Option<usize>,
}

#[derive(Debug, Default)]
struct MemoryCacheInner {
    entries: HashMap<String, Vec<u8>>,
    /// Insertion order, oldest first.
    order: VecDeque<String>,
    bytes: usize,
}

impl MemoryCacheInner {
    fn evict(&mut self, key: &str) {
        if let Some(old) = self.entries.remove(key) {
            self.bytes -= old.len();
            self.order.retain(|k| k != key);
        }
    }
}

impl MemoryCache {
    /// Create an unbounded memory cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a memory cache holding at most `max_bytes` of response data.
    #[must_use]
    pub fn with_max_bytes(max_bytes: usize) -> Self {
        Self {
            inner: Arc::default(),
            max_bytes: Some(max_bytes),
        }
    }

    /// Total size of cached bodies in bytes.
    #[must_use]
    pub fn bytes(&self) -> usize {
        self.inner.read().unwrap().bytes
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert synchronously; used to seed a cache with known responses.
    pub fn insert(&self, key: impl Into<String>, data: Vec<u8>) {
        let key = key.into();
        let mut inner = self.inner.write().unwrap();
        inner.evict(&key);

        if let Some(max_bytes) = self.max_bytes {
            while inner.bytes + data.len() > max_bytes {
                let Some(oldest) = inner.order.pop_front() else {
                    break;
                };
                if let Some(old) = inner.entries.remove(&oldest) {
                    inner.bytes -= old.len();
                }
            }
        }

        inner.bytes += data.len();
        inner.order.push_back(key.clone());
        inner.entries.insert(key, data);
    }
}

impl Cache for MemoryCache {
    fn get(&self, key: &str) -> GetFuture<'_> {
        let hit = self.inner.read().unwrap().entries.get(key).cloned();
        Box::pin(async move { Ok(hit) })
    }

    fn put(&self, key: &str, data: Vec<u8>) -> CacheFuture<'_> {
        self.insert(key, data);
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_cache_never_hits() {
        let cache = NoCache;
        cache.put("https://a", vec![1, 2, 3]).await.unwrap();
        assert!(cache.get("https://a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_cache_roundtrip() {
        let cache = MemoryCache::new();
        assert!(cache.is_empty());

        cache.put("https://a", vec![1, 2, 3]).await.unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.bytes(), 3);
        assert_eq!(cache.get("https://a").await.unwrap(), Some(vec![1, 2, 3]));
        assert_eq!(cache.get("https://b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_memory_cache_evicts_oldest() {
        let cache = MemoryCache::with_max_bytes(10);
        cache.insert("https://a", vec![0; 5]);
        cache.insert("https://b", vec![0; 5]);
        assert_eq!(cache.bytes(), 10);

        cache.insert("https://c", vec![0; 3]);
        assert_eq!(cache.bytes(), 8);
        assert!(cache.get("https://a").await.unwrap().is_none());
        assert!(cache.get("https://b").await.unwrap().is_some());
        assert!(cache.get("https://c").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_memory_cache_replace_and_share() {
        let cache = MemoryCache::new();
        cache.insert("https://a", vec![1]);
        cache.insert("https://a", vec![1, 2, 3, 4]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.bytes(), 4);

        assert_eq!(cache.get("https://a").await.unwrap(), Some(vec![1, 2, 3, 4]));

        // Clones share storage.
        let other = cache.clone();
        other.put("https://b", vec![5]).await.unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.bytes(), 5);
    }
}
