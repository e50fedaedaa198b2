//! Cache configuration.
//!
//! Controls the storage backend, default entry lifetime and failure handling
//! via the `[cache]` table of `declcache.toml`.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::Deserialize;

// Default values for cache configuration
const DEFAULT_TTL_SECS: u64 = 0;
const DEFAULT_MEMORY_CAPACITY: usize = 10_000;
const DEFAULT_POPULATE_TIMEOUT_MS: u64 = 0;

/// Which storage backend the advisor is built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// In-process [`MemoryStorage`](super::MemoryStorage).
    #[default]
    Memory,
    /// A caller-supplied [`Storage`](super::Storage) implementation.
    External,
}

/// What the read path does when storage cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageFailurePolicy {
    /// Surface [`CacheError::StorageUnavailable`](super::CacheError::StorageUnavailable).
    #[default]
    Fail,
    /// Log the failure and call through without caching.
    Bypass,
}

/// Cache configuration from `declcache.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Lifetime of stored entries in seconds; 0 stores without expiry.
    pub default_ttl_secs: u64,
    /// Storage backend.
    pub backend: Backend,
    /// Maximum entries held by the memory backend.
    pub memory_capacity: usize,
    /// Read-path behaviour on storage failure.
    pub storage_failure: StorageFailurePolicy,
    /// Upper bound on a wrapped call during population (ms); 0 disables it.
    pub populate_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: DEFAULT_TTL_SECS,
            backend: Backend::default(),
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            storage_failure: StorageFailurePolicy::default(),
            populate_timeout_ms: DEFAULT_POPULATE_TIMEOUT_MS,
        }
    }
}

impl CacheConfig {
    /// Default TTL passed to storage, `None` when entries never expire.
    pub fn default_ttl(&self) -> Option<Duration> {
        (self.default_ttl_secs > 0).then(|| Duration::from_secs(self.default_ttl_secs))
    }

    pub fn populate_timeout(&self) -> Option<Duration> {
        (self.populate_timeout_ms > 0).then(|| Duration::from_millis(self.populate_timeout_ms))
    }

    /// Returns the memory capacity as NonZeroUsize, clamping to 1 if zero.
    pub fn memory_capacity_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.memory_capacity).unwrap_or(NonZeroUsize::MIN)
    }
}
