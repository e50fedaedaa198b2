//! Cache storage.
//!
//! [`Storage`] is the narrow interface the advisor needs from a backing store.
//! [`MemoryStorage`] is the in-process implementation: LRU-bounded, with an
//! optional per-entry expiry checked lazily on access.

use std::num::NonZeroUsize;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use lru::LruCache;
use metrics::counter;

use super::error::StorageError;
use super::lock::{read_guard, write_guard};

const SOURCE: &str = "cache::store";

pub(crate) const METRIC_STORAGE_EVICT: &str = "declcache_storage_evict_total";

/// Key-value backend holding cached entries.
///
/// Values are opaque bytes. A TTL of `None` means the entry does not expire.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError>;

    async fn put(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError>;

    /// Delete every listed key that exists and return how many were removed.
    async fn delete(&self, keys: &[String]) -> Result<usize, StorageError>;

    /// Keys currently stored that start with `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
}

struct StoredEntry {
    value: Bytes,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory [`Storage`] with LRU eviction.
pub struct MemoryStorage {
    entries: RwLock<LruCache<String, StoredEntry>>,
}

impl MemoryStorage {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: RwLock::new(LruCache::new(capacity)),
        }
    }

    /// Number of entries held, including ones that expired but were not yet
    /// touched.
    pub fn len(&self) -> usize {
        read_guard(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        read_guard(&self.entries, SOURCE, "contains")
            .peek(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    pub fn clear(&self) {
        write_guard(&self.entries, SOURCE, "clear").clear();
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError> {
        let now = Instant::now();
        let mut entries = write_guard(&self.entries, SOURCE, "get");
        let expired = match entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            entries.pop(key);
        }
        Ok(None)
    }

    async fn put(
        &self,
        key: &str,
        value: Bytes,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        let entry = StoredEntry {
            value,
            expires_at: ttl.and_then(|ttl| Instant::now().checked_add(ttl)),
        };
        let mut entries = write_guard(&self.entries, SOURCE, "put");
        // `push` also hands back the old entry when the key is replaced
        let displaced = entries.push(key.to_string(), entry);
        if displaced.is_some_and(|(evicted, _)| evicted != key) {
            counter!(METRIC_STORAGE_EVICT).increment(1);
        }
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, StorageError> {
        let mut entries = write_guard(&self.entries, SOURCE, "delete");
        Ok(keys.iter().filter(|key| entries.pop(*key).is_some()).count())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let now = Instant::now();
        let entries = read_guard(&self.entries, SOURCE, "scan_prefix");
        Ok(entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && !entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;

    fn storage(capacity: usize) -> MemoryStorage {
        MemoryStorage::new(NonZeroUsize::new(capacity).expect("non-zero capacity"))
    }

    #[tokio::test]
    async fn put_then_get_returns_value() {
        let store = storage(4);
        store
            .put("k", Bytes::from_static(b"v"), None)
            .await
            .expect("put");
        assert_eq!(
            store.get("k").await.expect("get"),
            Some(Bytes::from_static(b"v"))
        );
        assert!(store.get("missing").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn delete_counts_only_present_keys() {
        let store = storage(4);
        store.put("a", Bytes::new(), None).await.expect("put");
        store.put("b", Bytes::new(), None).await.expect("put");

        let removed = store
            .delete(&["a".into(), "b".into(), "c".into()])
            .await
            .expect("delete");
        assert_eq!(removed, 2);
        assert_eq!(store.delete(&["a".into()]).await.expect("delete"), 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn expired_entries_are_misses() {
        let store = storage(4);
        store
            .put("short", Bytes::from_static(b"x"), Some(Duration::from_millis(10)))
            .await
            .expect("put");
        store
            .put("long", Bytes::from_static(b"y"), Some(Duration::from_secs(60)))
            .await
            .expect("put");

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(store.get("short").await.expect("get").is_none());
        assert!(!store.contains("short"));
        assert!(store.contains("long"));
        assert_eq!(store.len(), 1, "expired entry is dropped on read");
    }

    #[tokio::test]
    async fn scan_prefix_lists_matching_live_keys() {
        let store = storage(8);
        for key in ["report:a", "report:b", "summary:a"] {
            store.put(key, Bytes::new(), None).await.expect("put");
        }
        store
            .put("report:old", Bytes::new(), Some(Duration::ZERO))
            .await
            .expect("put");

        let mut keys = store.scan_prefix("report:").await.expect("scan");
        keys.sort();
        assert_eq!(keys, vec!["report:a", "report:b"]);
    }

    #[tokio::test]
    async fn capacity_evicts_least_recently_used() {
        let store = storage(2);
        store.put("a", Bytes::new(), None).await.expect("put");
        store.put("b", Bytes::new(), None).await.expect("put");
        store.get("a").await.expect("get");
        store.put("c", Bytes::new(), None).await.expect("put");

        assert!(store.contains("a"));
        assert!(!store.contains("b"));
        assert!(store.contains("c"));
    }

    #[tokio::test]
    async fn recovers_from_poisoned_lock() {
        let store = storage(2);
        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = store.entries.write().expect("lock should be acquired");
            panic!("poison");
        }));

        store.put("k", Bytes::new(), None).await.expect("put");
        assert!(store.contains("k"));
    }
}
