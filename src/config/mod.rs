//! Configuration layer: typed settings with layered precedence (file → env).

use std::{path::Path, str::FromStr};

use config::{Config, Environment, File};
use serde::Deserialize;
use serde::de::{DeserializeOwned, IntoDeserializer};
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{Backend, CacheConfig, StorageFailurePolicy};

const LOCAL_CONFIG_BASENAME: &str = "declcache";
const ENV_PREFIX: &str = "DECLCACHE";

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub cache: CacheConfig,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            format: LogFormat::Compact,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence: `declcache.toml` in the
/// working directory, then `config_file` when given, then `DECLCACHE__*`
/// environment variables (e.g. `DECLCACHE__CACHE__DEFAULT_TTL_SECS=60`).
pub fn load(config_file: Option<&Path>) -> Result<Settings, LoadError> {
    let mut builder =
        Config::builder().add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = config_file {
        builder = builder.add_source(File::from(path).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let raw: RawSettings = builder.build()?.try_deserialize()?;
    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    cache: RawCacheSettings,
    logging: RawLoggingSettings,
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings { cache, logging } = raw;

        let cache = build_cache_settings(cache)?;
        let logging = build_logging_settings(logging)?;

        Ok(Self { cache, logging })
    }
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheConfig, LoadError> {
    let defaults = CacheConfig::default();

    let backend: Backend = parse_choice("cache.backend", cache.backend)?.unwrap_or_default();
    let storage_failure: StorageFailurePolicy =
        parse_choice("cache.storage_failure", cache.storage_failure)?.unwrap_or_default();

    let memory_capacity = cache.memory_capacity.unwrap_or(defaults.memory_capacity);
    if memory_capacity == 0 {
        return Err(LoadError::invalid(
            "cache.memory_capacity",
            "must be greater than zero",
        ));
    }

    Ok(CacheConfig {
        default_ttl_secs: cache.default_ttl_secs.unwrap_or(defaults.default_ttl_secs),
        backend,
        memory_capacity,
        storage_failure,
        populate_timeout_ms: cache
            .populate_timeout_ms
            .unwrap_or(defaults.populate_timeout_ms),
    })
}

/// Parse a lowercase enum value through its own `Deserialize` impl.
fn parse_choice<T: DeserializeOwned>(
    key: &'static str,
    value: Option<String>,
) -> Result<Option<T>, LoadError> {
    value
        .map(|raw| {
            T::deserialize(raw.into_deserializer())
                .map_err(|err: serde::de::value::Error| LoadError::invalid(key, err.to_string()))
        })
        .transpose()
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    default_ttl_secs: Option<u64>,
    backend: Option<String>,
    memory_capacity: Option<usize>,
    storage_failure: Option<String>,
    populate_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}
