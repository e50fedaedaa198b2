//! Cache advisor.
//!
//! Wraps calls to advised methods. The read path serves stored results and
//! populates misses under a per-key lock; the evict path deletes rendered keys
//! and cascades through the dependency index.

use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use metrics::{counter, histogram};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{Instrument, Span, debug, field, info, instrument, warn};

use super::config::{Backend, CacheConfig, StorageFailurePolicy};
use super::declare::{CacheEvict, Cacheable, ResolvedEviction};
use super::error::{AdviceError, CacheError};
use super::invocation::Invocation;
use super::population::{PopulationGuard, PopulationLocks};
use super::registry::DependencyIndex;
use super::store::{MemoryStorage, Storage};
use super::watch::{EvictionWatch, WatchTicket};

pub(crate) const METRIC_HIT: &str = "declcache_hit_total";
pub(crate) const METRIC_MISS: &str = "declcache_miss_total";
pub(crate) const METRIC_POPULATE: &str = "declcache_populate_total";
pub(crate) const METRIC_POPULATE_ERROR: &str = "declcache_populate_error_total";
pub(crate) const METRIC_EVICT: &str = "declcache_evict_total";
pub(crate) const METRIC_CASCADE: &str = "declcache_cascade_total";
pub(crate) const METRIC_STALE_DISCARD: &str = "declcache_stale_discard_total";
pub(crate) const METRIC_STORAGE_ERROR: &str = "declcache_storage_error_total";
pub(crate) const METRIC_POPULATE_MS: &str = "declcache_populate_ms";

/// What an eviction removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Names rendered from the declaration, including prefix matches.
    pub evicted: BTreeSet<String>,
    /// Keys reached only through dependency tags.
    pub cascaded: BTreeSet<String>,
    /// Entries storage actually deleted.
    pub deleted: usize,
}

impl EvictionReport {
    /// Every name the eviction touched.
    pub fn all(&self) -> impl Iterator<Item = &str> {
        self.evicted.iter().chain(&self.cascaded).map(String::as_str)
    }
}

/// Builder for [`CacheAdvisor`].
pub struct CacheAdvisorBuilder {
    config: CacheConfig,
    storage: Option<Arc<dyn Storage>>,
    default_ttl: Option<Duration>,
    populate_timeout: Option<Duration>,
}

impl Default for CacheAdvisorBuilder {
    fn default() -> Self {
        let config = CacheConfig::default();
        Self {
            default_ttl: config.default_ttl(),
            populate_timeout: config.populate_timeout(),
            config,
            storage: None,
        }
    }
}

impl CacheAdvisorBuilder {
    /// Take every setting from `config`, replacing earlier builder calls.
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.default_ttl = config.default_ttl();
        self.populate_timeout = config.populate_timeout();
        self.config = config;
        self
    }

    /// Use `storage` instead of the configured memory backend.
    pub fn storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn populate_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.populate_timeout = timeout;
        self
    }

    pub fn storage_failure(mut self, policy: StorageFailurePolicy) -> Self {
        self.config.storage_failure = policy;
        self
    }

    pub fn build(self) -> Result<CacheAdvisor, CacheError> {
        let storage = match (self.storage, self.config.backend) {
            (Some(storage), _) => storage,
            (None, Backend::Memory) => Arc::new(MemoryStorage::new(
                self.config.memory_capacity_non_zero(),
            )) as Arc<dyn Storage>,
            (None, Backend::External) => return Err(CacheError::MissingStorage),
        };

        Ok(CacheAdvisor {
            storage,
            index: Arc::new(DependencyIndex::new()),
            locks: PopulationLocks::new(),
            watch: EvictionWatch::new(),
            default_ttl: self.default_ttl,
            populate_timeout: self.populate_timeout,
            failure_policy: self.config.storage_failure,
        })
    }
}

/// Interception entry point for cached and evicting calls.
///
/// Safe to share across tasks; wrap in an [`Arc`] to do so.
pub struct CacheAdvisor {
    storage: Arc<dyn Storage>,
    index: Arc<DependencyIndex>,
    locks: PopulationLocks,
    watch: EvictionWatch,
    default_ttl: Option<Duration>,
    populate_timeout: Option<Duration>,
    failure_policy: StorageFailurePolicy,
}

impl CacheAdvisor {
    pub fn builder() -> CacheAdvisorBuilder {
        CacheAdvisorBuilder::default()
    }

    /// Build an advisor from configuration alone. Fails for the `external`
    /// backend, which needs a storage supplied through [`Self::builder`].
    pub fn from_config(config: &CacheConfig) -> Result<Self, CacheError> {
        Self::builder().config(config.clone()).build()
    }

    pub fn dependencies(&self) -> &DependencyIndex {
        &self.index
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Serve the call from storage, or run `proceed` and store its result.
    ///
    /// Concurrent misses on the same key run `proceed` once; the others wait
    /// and read the stored value. Errors from `proceed` are returned untouched
    /// and nothing is stored.
    #[instrument(skip_all, fields(method = invocation.method(), key = field::Empty))]
    pub async fn cacheable<T, E, F, Fut>(
        &self,
        decl: &Cacheable,
        invocation: &Invocation,
        proceed: F,
    ) -> Result<T, AdviceError<E>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let key = decl.render_key(invocation).map_err(CacheError::from)?;
        let tags = decl.render_tags(invocation).map_err(CacheError::from)?;
        Span::current().record("key", key.as_str());

        match self.lookup::<T>(&key).await {
            Ok(Some(value)) => {
                counter!(METRIC_HIT).increment(1);
                debug!(cache = "declcache", outcome = "hit", "serving cached value");
                return Ok(value);
            }
            Ok(None) => {}
            Err(err) => {
                self.storage_failed(err)?;
                return self.call(&key, proceed()).await;
            }
        }

        counter!(METRIC_MISS).increment(1);
        debug!(cache = "declcache", outcome = "miss", "waiting for population lock");

        let population = self.locks.acquire(&key).await;

        // Another caller may have populated the key while we waited.
        match self.lookup::<T>(&key).await {
            Ok(Some(value)) => {
                counter!(METRIC_HIT).increment(1);
                debug!(
                    cache = "declcache",
                    outcome = "hit_after_wait",
                    "serving value populated concurrently"
                );
                return Ok(value);
            }
            Ok(None) => {}
            Err(err) => {
                self.storage_failed(err)?;
                return self.call(&key, proceed()).await;
            }
        }

        let ticket = self
            .watch
            .register(std::iter::once(key.clone()).chain(tags.iter().cloned()));

        let value = self.call(&key, proceed()).await?;

        let encoded = serde_json::to_vec(&value).map_err(|source| CacheError::Encode {
            key: key.clone(),
            source,
        })?;
        let write = PendingWrite {
            storage: Arc::clone(&self.storage),
            index: Arc::clone(&self.index),
            ttl: decl.ttl_override().or(self.default_ttl),
            key,
            tags,
            value: Bytes::from(encoded),
            ticket,
            _population: population,
        };

        // Detached: the put, tag recording and stale check finish even if this
        // caller is dropped.
        let key = write.key.clone();
        let written = tokio::spawn(write.commit().instrument(Span::current()))
            .await
            .unwrap_or_else(|err| {
                Err(CacheError::WriteAborted {
                    key,
                    reason: err.to_string(),
                })
            });
        if let Err(err) = written {
            self.storage_failed(err)?;
        }

        Ok(value)
    }

    /// Run `proceed`, then evict everything `decl` names.
    ///
    /// With [`CacheEvict::before_invocation`] the eviction runs first and
    /// happens even if `proceed` fails; otherwise a failed call evicts
    /// nothing.
    #[instrument(skip_all, fields(method = invocation.method()))]
    pub async fn evict<T, E, F, Fut>(
        &self,
        decl: &CacheEvict,
        invocation: &Invocation,
        proceed: F,
    ) -> Result<T, AdviceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let resolved = decl.resolve(invocation).map_err(CacheError::from)?;

        if decl.runs_before_invocation() {
            self.apply(&resolved).await?;
            return proceed().await.map_err(AdviceError::Call);
        }

        let value = proceed().await.map_err(AdviceError::Call)?;
        self.apply(&resolved).await?;
        Ok(value)
    }

    /// Evict everything `decl` names without a wrapped call.
    #[instrument(skip_all, fields(method = invocation.method()))]
    pub async fn evict_only(
        &self,
        decl: &CacheEvict,
        invocation: &Invocation,
    ) -> Result<EvictionReport, CacheError> {
        let resolved = decl.resolve(invocation)?;
        self.apply(&resolved).await
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, CacheError> {
        let Some(bytes) = self
            .storage
            .get(key)
            .await
            .map_err(|err| CacheError::storage("get", err))?
        else {
            return Ok(None);
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                warn!(
                    cache = "declcache",
                    key,
                    error = %err,
                    "discarding undecodable cached value"
                );
                Ok(None)
            }
        }
    }

    async fn call<T, E, Fut>(&self, key: &str, fut: Fut) -> Result<T, AdviceError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        let started_at = Instant::now();
        let outcome = match self.populate_timeout {
            Some(after) => match tokio::time::timeout(after, fut).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    counter!(METRIC_POPULATE_ERROR, "reason" => "timeout").increment(1);
                    warn!(cache = "declcache", key, ?after, "wrapped call timed out");
                    return Err(CacheError::Timeout {
                        key: key.to_string(),
                        after,
                    }
                    .into());
                }
            },
            None => fut.await,
        };
        histogram!(METRIC_POPULATE_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);

        match outcome {
            Ok(value) => {
                counter!(METRIC_POPULATE).increment(1);
                Ok(value)
            }
            Err(err) => {
                counter!(METRIC_POPULATE_ERROR, "reason" => "call").increment(1);
                debug!(cache = "declcache", key, "wrapped call failed, nothing stored");
                Err(AdviceError::Call(err))
            }
        }
    }

    /// Apply the failure policy to a read-path storage error. `Ok` means the
    /// caller should continue without the cache.
    fn storage_failed(&self, err: CacheError) -> Result<(), CacheError> {
        if !matches!(err, CacheError::StorageUnavailable { .. }) {
            return Err(err);
        }
        counter!(METRIC_STORAGE_ERROR).increment(1);
        match self.failure_policy {
            StorageFailurePolicy::Fail => Err(err),
            StorageFailurePolicy::Bypass => {
                warn!(
                    cache = "declcache",
                    error = %err,
                    "storage unavailable, bypassing cache"
                );
                Ok(())
            }
        }
    }

    async fn apply(&self, resolved: &ResolvedEviction) -> Result<EvictionReport, CacheError> {
        let mut report = EvictionReport::default();
        report.evicted.extend(resolved.names.iter().cloned());

        for prefix in &resolved.prefixes {
            self.watch.notify_prefix(prefix);
            let matched = self
                .storage
                .scan_prefix(prefix)
                .await
                .map_err(|err| CacheError::storage("scan_prefix", err))?;
            report.evicted.extend(matched);
        }

        let mut visited: HashSet<String> = HashSet::new();
        let mut level: Vec<String> = report.evicted.iter().cloned().collect();

        while !level.is_empty() {
            level.retain(|name| visited.insert(name.clone()));
            if level.is_empty() {
                break;
            }

            for name in &level {
                self.watch.notify(name);
            }
            report.deleted += self
                .storage
                .delete(&level)
                .await
                .map_err(|err| CacheError::storage("delete", err))?;

            let mut next = Vec::new();
            for name in &level {
                self.index.forget(name);
                for dependent in self.index.evict(name) {
                    if !visited.contains(&dependent) {
                        next.push(dependent);
                    }
                }
            }
            for dependent in &next {
                if !report.evicted.contains(dependent) {
                    report.cascaded.insert(dependent.clone());
                }
            }
            level = next;
        }

        counter!(METRIC_EVICT).increment(report.evicted.len() as u64);
        counter!(METRIC_CASCADE).increment(report.cascaded.len() as u64);
        info!(
            cache = "declcache",
            evicted = report.evicted.len(),
            cascaded = report.cascaded.len(),
            deleted = report.deleted,
            "eviction complete"
        );

        Ok(report)
    }
}

/// A populated value on its way into storage, together with everything
/// needed to keep the dependency index and the evict-wins check consistent.
struct PendingWrite {
    storage: Arc<dyn Storage>,
    index: Arc<DependencyIndex>,
    key: String,
    tags: Vec<String>,
    value: Bytes,
    ttl: Option<Duration>,
    ticket: WatchTicket,
    _population: PopulationGuard,
}

impl PendingWrite {
    async fn commit(self) -> Result<(), CacheError> {
        // Tags first: a stored value must be reachable from its tags.
        for tag in &self.tags {
            self.index.record(tag, &self.key);
        }

        if let Err(err) = self.storage.put(&self.key, self.value, self.ttl).await {
            self.index.forget(&self.key);
            return Err(CacheError::storage("put", err));
        }
        debug!(
            cache = "declcache",
            deps_count = self.tags.len(),
            "stored populated value"
        );

        if self.ticket.is_stale() {
            discard_stale(self.storage.as_ref(), &self.index, &self.key).await;
        }
        Ok(())
    }
}

/// Remove an entry whose key or tags were evicted while it was computed.
async fn discard_stale(storage: &dyn Storage, index: &DependencyIndex, key: &str) {
    counter!(METRIC_STALE_DISCARD).increment(1);
    index.forget(key);
    match storage.delete(&[key.to_string()]).await {
        Ok(_) => debug!(
            cache = "declcache",
            outcome = "stale_discard",
            "evicted during population, entry discarded"
        ),
        Err(err) => {
            counter!(METRIC_STORAGE_ERROR).increment(1);
            warn!(
                cache = "declcache",
                key,
                error = %err,
                "failed to discard entry evicted during population"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::num::NonZeroUsize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::cache::error::StorageError;

    fn advisor() -> (CacheAdvisor, Arc<MemoryStorage>) {
        let store = Arc::new(MemoryStorage::new(NonZeroUsize::new(64).expect("non-zero")));
        let advisor = CacheAdvisor::builder()
            .storage(store.clone())
            .build()
            .expect("advisor builds");
        (advisor, store)
    }

    fn call(args: Vec<serde_json::Value>) -> Invocation {
        Invocation::with_values("svc::method", args)
    }

    #[tokio::test]
    async fn miss_then_hit() {
        let (advisor, store) = advisor();
        let decl = Cacheable::new("k:${args[0]}").expect("valid");
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value: u32 = advisor
                .cacheable(&decl, &call(vec![json!(1)]), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, std::io::Error>(7)
                })
                .await
                .expect("cached call");
            assert_eq!(value, 7);
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(store.contains("k:1"));
    }

    #[tokio::test]
    async fn cascade_tolerates_cycles() {
        let (advisor, store) = advisor();
        let a = Cacheable::new("a")
            .and_then(|d| d.depends_on("b"))
            .expect("valid");
        let b = Cacheable::new("b")
            .and_then(|d| d.depends_on("a"))
            .expect("valid");
        let args = call(vec![]);

        let _: u8 = advisor
            .cacheable(&a, &args, || async { Ok::<_, std::io::Error>(1) })
            .await
            .expect("populate a");
        let _: u8 = advisor
            .cacheable(&b, &args, || async { Ok::<_, std::io::Error>(2) })
            .await
            .expect("populate b");

        let report = advisor
            .evict_only(&CacheEvict::new().key("a").expect("valid"), &args)
            .await
            .expect("eviction");

        assert_eq!(report.deleted, 2);
        assert!(report.cascaded.contains("b"));
        assert!(store.is_empty());
        assert_eq!(advisor.dependencies().tag_count(), 0);
    }

    #[tokio::test]
    async fn undecodable_value_is_repopulated() {
        let (advisor, store) = advisor();
        store
            .put("k", Bytes::from_static(b"not json"), None)
            .await
            .expect("put");

        let decl = Cacheable::new("k").expect("valid");
        let value: String = advisor
            .cacheable(&decl, &call(vec![]), || async {
                Ok::<_, std::io::Error>("fresh".to_string())
            })
            .await
            .expect("repopulated");

        assert_eq!(value, "fresh");
        assert_eq!(
            store.get("k").await.expect("get"),
            Some(Bytes::from_static(b"\"fresh\""))
        );
    }

    struct ReadOnlyStorage(MemoryStorage);

    #[async_trait::async_trait]
    impl Storage for ReadOnlyStorage {
        async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError> {
            self.0.get(key).await
        }

        async fn put(
            &self,
            _key: &str,
            _value: Bytes,
            _ttl: Option<Duration>,
        ) -> Result<(), StorageError> {
            Err(StorageError::rejected("put", "read-only replica"))
        }

        async fn delete(&self, keys: &[String]) -> Result<usize, StorageError> {
            self.0.delete(keys).await
        }

        async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
            self.0.scan_prefix(prefix).await
        }
    }

    #[tokio::test]
    async fn rejected_put_leaves_no_index_entry() {
        let store = ReadOnlyStorage(MemoryStorage::new(NonZeroUsize::MIN));
        let advisor = CacheAdvisor::builder()
            .storage(Arc::new(store))
            .build()
            .expect("advisor builds");
        let decl = Cacheable::new("k:${args[0]}")
            .and_then(|d| d.depends_on("t:${args[0]}"))
            .expect("valid");

        let err = advisor
            .cacheable(&decl, &call(vec![json!(1)]), || async {
                Ok::<_, std::io::Error>(1u8)
            })
            .await
            .expect_err("put is rejected");

        assert!(matches!(
            err.as_cache(),
            Some(CacheError::StorageUnavailable { op: "put", .. })
        ));
        assert!(err.to_string().contains("read-only replica"));
        assert_eq!(advisor.dependencies().key_count(), 0);
        assert_eq!(advisor.dependencies().tag_count(), 0);
    }

    #[tokio::test]
    async fn unencodable_result_is_an_error_even_when_bypassing() {
        let store = Arc::new(MemoryStorage::new(NonZeroUsize::MIN));
        let advisor = CacheAdvisor::builder()
            .storage(store.clone())
            .storage_failure(StorageFailurePolicy::Bypass)
            .build()
            .expect("advisor builds");
        let decl = Cacheable::new("grid").expect("valid");

        // JSON object keys must be strings.
        let err = advisor
            .cacheable(&decl, &call(vec![]), || async {
                Ok::<_, std::io::Error>(BTreeMap::from([((0u8, 0u8), 1u8)]))
            })
            .await
            .expect_err("tuple keys do not encode");

        assert!(matches!(
            err.as_cache(),
            Some(CacheError::Encode { key, .. }) if key == "grid"
        ));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn external_backend_requires_storage() {
        let config = CacheConfig {
            backend: Backend::External,
            ..Default::default()
        };
        assert!(matches!(
            CacheAdvisor::from_config(&config),
            Err(CacheError::MissingStorage)
        ));
        assert!(CacheAdvisor::from_config(&CacheConfig::default()).is_ok());
    }
}
