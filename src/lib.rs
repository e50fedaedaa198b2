//! Declarative caching for async calls.
//!
//! Describe a call with an [`cache::Invocation`], declare how it is cached
//! with [`cache::Cacheable`] or [`cache::CacheEvict`], and route it through a
//! [`cache::CacheAdvisor`]. Settings come from [`config::load`] and logging is
//! installed with [`infra::telemetry::init`].

pub mod cache;
pub mod config;
pub mod infra;
