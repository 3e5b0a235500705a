//! Cache configuration with layered loading.
//!
//! This module provides configuration management using figment for layered
//! configuration loading from multiple sources:
//!
//! 1. Environment variables (SQLSTASH_*)
//! 2. TOML config file (if SQLSTASH_CONFIG_FILE set)
//! 3. Built-in defaults

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

mod validation;

pub use validation::ConfigError;

/// Path marker selecting a private in-memory store.
pub const IN_MEMORY: &str = ":memory:";

/// Cache configuration.
///
/// Loading precedence (highest wins):
/// 1. Environment variables (SQLSTASH_*)
/// 2. TOML config file (if SQLSTASH_CONFIG_FILE set)
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Path to the SQLite file, or `:memory:`.
    ///
    /// Set via SQLSTASH_PATH environment variable.
    #[serde(default = "default_path")]
    pub path: PathBuf,

    /// TTL applied when an operation omits one (or passes zero).
    ///
    /// Set via SQLSTASH_DEFAULT_TTL_SECS environment variable.
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,

    /// Maximum store size in bytes.
    ///
    /// Set via SQLSTASH_MAX_SIZE_BYTES environment variable.
    #[serde(default = "default_max_size_bytes")]
    pub max_size_bytes: u64,

    /// Bytes of the store to keep memory-mapped.
    ///
    /// Set via SQLSTASH_MMAP_SIZE_BYTES environment variable.
    #[serde(default = "default_mmap_size_bytes")]
    pub mmap_size_bytes: u64,

    /// Floor for `max_size_bytes`.
    ///
    /// Set via SQLSTASH_MIN_SIZE_BYTES environment variable.
    #[serde(default = "default_min_size_bytes")]
    pub min_size_bytes: u64,

    /// Whether `lookup` returns whole entries instead of bare payloads.
    ///
    /// Set via SQLSTASH_RETURN_FULL_RECORD environment variable.
    #[serde(default)]
    pub return_full_record: bool,

    /// Milliseconds between maintenance cycles.
    ///
    /// Set via SQLSTASH_MAINTENANCE_INTERVAL_MS environment variable.
    #[serde(default = "default_maintenance_interval_ms")]
    pub maintenance_interval_ms: u64,

    /// Number of pooled connections.
    ///
    /// Set via SQLSTASH_POOL_SIZE environment variable.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// How long SQLite waits on a held lock before reporting SQLITE_BUSY.
    ///
    /// Set via SQLSTASH_BUSY_TIMEOUT_MS environment variable.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Upper bound for a single foreground operation, pool wait included.
    ///
    /// Set via SQLSTASH_OPERATION_TIMEOUT_MS environment variable.
    #[serde(default)]
    pub operation_timeout_ms: Option<u64>,

    /// Retries after lock contention before giving up.
    ///
    /// Set via SQLSTASH_MAX_LOCK_RETRIES environment variable.
    #[serde(default = "default_max_lock_retries")]
    pub max_lock_retries: u32,

    /// Initial backoff between lock-contention retries, doubled per attempt.
    ///
    /// Set via SQLSTASH_LOCK_RETRY_BACKOFF_MS environment variable.
    #[serde(default = "default_lock_retry_backoff_ms")]
    pub lock_retry_backoff_ms: u64,

    /// Fraction of rows evicted (oldest-used first) when the store is full.
    ///
    /// Set via SQLSTASH_PRUNE_FRACTION environment variable.
    #[serde(default = "default_prune_fraction")]
    pub prune_fraction: f64,
}

fn default_path() -> PathBuf {
    PathBuf::from("./cache.db")
}

fn default_ttl_secs() -> u64 {
    30 * 24 * 60 * 60
}

fn default_max_size_bytes() -> u64 {
    128 * 1024 * 1024
}

fn default_mmap_size_bytes() -> u64 {
    128 * 1024 * 1024
}

fn default_min_size_bytes() -> u64 {
    32 * 1024
}

fn default_maintenance_interval_ms() -> u64 {
    1_000
}

fn default_pool_size() -> usize {
    1
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_max_lock_retries() -> u32 {
    10
}

fn default_lock_retry_backoff_ms() -> u64 {
    10
}

fn default_prune_fraction() -> f64 {
    0.2
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            default_ttl_secs: default_ttl_secs(),
            max_size_bytes: default_max_size_bytes(),
            mmap_size_bytes: default_mmap_size_bytes(),
            min_size_bytes: default_min_size_bytes(),
            return_full_record: false,
            maintenance_interval_ms: default_maintenance_interval_ms(),
            pool_size: default_pool_size(),
            busy_timeout_ms: default_busy_timeout_ms(),
            operation_timeout_ms: None,
            max_lock_retries: default_max_lock_retries(),
            lock_retry_backoff_ms: default_lock_retry_backoff_ms(),
            prune_fraction: default_prune_fraction(),
        }
    }
}

impl CacheConfig {
    /// Configuration for a private in-memory store, otherwise default.
    pub fn in_memory() -> Self {
        Self { path: PathBuf::from(IN_MEMORY), ..Default::default() }
    }

    /// Configuration for a file-backed store at `path`, otherwise default.
    pub fn at(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf(), ..Default::default() }
    }

    pub fn is_in_memory(&self) -> bool {
        self.path.as_os_str() == IN_MEMORY
    }

    /// Default TTL as Duration.
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    /// Maintenance interval as Duration for use with tokio timers.
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_ms.map(Duration::from_millis)
    }

    pub fn lock_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.lock_retry_backoff_ms)
    }

    /// Pool size actually used: in-memory stores are private per connection,
    /// so they always get a single handle.
    pub fn effective_pool_size(&self) -> usize {
        if self.is_in_memory() { 1 } else { self.pool_size }
    }

    /// Load configuration from all sources with layered precedence.
    ///
    /// Priority (highest wins):
    /// 1. Environment variables prefixed with `SQLSTASH_`
    /// 2. TOML file from `SQLSTASH_CONFIG_FILE` (if set)
    /// 3. Built-in defaults via `Default::default()`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Configuration file cannot be read
    /// - Environment variables cannot be parsed
    /// - Validation fails after loading
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Ok(config_path) = std::env::var("SQLSTASH_CONFIG_FILE") {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment = figment.merge(
            Env::prefixed("SQLSTASH_")
                .ignore(&["CONFIG_FILE"])
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        );

        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }
}
