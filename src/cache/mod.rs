//! Declarative cache layer.
//!
//! Calls are described by an [`Invocation`] and advised through a
//! [`CacheAdvisor`]:
//!
//! - **Read path** ([`Cacheable`]): the key template is rendered from the
//!   call's arguments, stored values are served directly, and misses are
//!   populated once per key even under concurrent callers.
//! - **Evict path** ([`CacheEvict`]): rendered keys, list expansions and
//!   prefixes are deleted, and every evicted name cascades to the keys that
//!   declared it as a dependency.
//!
//! ## Key templates
//!
//! ```text
//! department:id:${args[0]}      positional argument
//! employees:query:${sign(args)} digest of all arguments
//! employee:${it}                element of an iterated collection argument
//! ```
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! default_ttl_secs = 0
//! backend = "memory"
//! memory_capacity = 10000
//! storage_failure = "fail"
//! populate_timeout_ms = 0
//! ```

mod advisor;
mod config;
mod declare;
mod error;
mod invocation;
mod lock;
mod population;
mod registry;
mod signature;
mod store;
mod template;
mod watch;

pub use advisor::{CacheAdvisor, CacheAdvisorBuilder, EvictionReport};
pub use config::{Backend, CacheConfig, StorageFailurePolicy};
pub use declare::{CacheEvict, Cacheable, EvictTarget};
pub use error::{AdviceError, CacheError, SignatureError, StorageError, TemplateError};
pub use invocation::Invocation;
pub use registry::DependencyIndex;
pub use signature::ArgumentSignature;
pub use store::{MemoryStorage, Storage};
pub use template::KeyTemplate;

pub(crate) mod metric {
    pub(crate) use super::advisor::{
        METRIC_CASCADE, METRIC_EVICT, METRIC_HIT, METRIC_MISS, METRIC_POPULATE,
        METRIC_POPULATE_ERROR, METRIC_POPULATE_MS, METRIC_STALE_DISCARD, METRIC_STORAGE_ERROR,
    };
    pub(crate) use super::store::METRIC_STORAGE_EVICT;
}
