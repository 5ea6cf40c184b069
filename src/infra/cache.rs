//! Cache backend port and the in-memory implementation.
//!
//! The engine treats the cache as a plain byte store with per-entry TTLs:
//! `get`/`set`/`del`, no compare-and-swap. Lost updates are tolerated by
//! design; coherence comes from deleting entries after confirmed database
//! mutations, never from cache-side transactions.

use std::num::NonZeroUsize;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use time::OffsetDateTime;

use super::lock::{rw_read, rw_write};

const SOURCE: &str = "infra::cache";
const DEFAULT_CAPACITY: usize = 4096;

#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Fetch a value; `None` is a miss (absent or expired).
    async fn get(&self, key: &str) -> Option<Bytes>;

    /// Store a value with a TTL.
    async fn set(&self, key: &str, value: Bytes, ttl: Duration);

    /// Delete entries by exact key.
    async fn del(&self, keys: &[String]);
}

struct Entry {
    value: Bytes,
    expires_at: OffsetDateTime,
}

/// LRU-bounded, TTL-aware in-memory [`CacheBackend`].
///
/// Capacity-evicted and expired entries both read as misses; expiry is
/// checked lazily on access.
pub struct MemoryCache {
    entries: RwLock<LruCache<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: RwLock::new(LruCache::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        rw_write(&self.entries, SOURCE, "clear").clear();
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for MemoryCache {
    async fn get(&self, key: &str) -> Option<Bytes> {
        let mut entries = rw_write(&self.entries, SOURCE, "get");
        match entries.get(key) {
            Some(entry) if entry.expires_at > OffsetDateTime::now_utc() => {
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.pop(key);
                None
            }
            None => None,
        }
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Duration) {
        let entry = Entry {
            value,
            expires_at: OffsetDateTime::now_utc() + ttl,
        };
        rw_write(&self.entries, SOURCE, "set").put(key.to_string(), entry);
    }

    async fn del(&self, keys: &[String]) {
        let mut entries = rw_write(&self.entries, SOURCE, "del");
        for key in keys {
            entries.pop(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_del_roundtrip() {
        let cache = MemoryCache::new();
        let ttl = Duration::from_secs(60);

        assert!(cache.get("k").await.is_none());

        cache.set("k", Bytes::from_static(b"v"), ttl).await;
        assert_eq!(cache.get("k").await, Some(Bytes::from_static(b"v")));

        cache.del(&["k".to_string()]).await;
        assert!(cache.get("k").await.is_none());
    }

    #[tokio::test]
    async fn expired_entry_reads_as_miss() {
        let cache = MemoryCache::new();
        cache
            .set("k", Bytes::from_static(b"v"), Duration::ZERO)
            .await;
        assert!(cache.get("k").await.is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn capacity_evicts_least_recently_used() {
        let cache = MemoryCache::with_capacity(2);
        let ttl = Duration::from_secs(60);

        cache.set("a", Bytes::from_static(b"1"), ttl).await;
        cache.set("b", Bytes::from_static(b"2"), ttl).await;
        cache.get("a").await;
        cache.set("c", Bytes::from_static(b"3"), ttl).await;

        assert!(cache.get("a").await.is_some());
        assert!(cache.get("b").await.is_none());
        assert!(cache.get("c").await.is_some());
    }

    #[tokio::test]
    async fn del_ignores_absent_keys() {
        let cache = MemoryCache::new();
        cache.del(&["missing".to_string()]).await;
        assert!(cache.is_empty());
    }
}
