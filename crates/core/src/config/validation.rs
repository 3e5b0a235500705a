//! Configuration validation rules.
//!
//! This module provides validation logic for `CacheConfig` values
//! after they have been loaded from environment, files, or defaults.

use crate::config::CacheConfig;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },

    #[error("missing required configuration: {field} ({hint})")]
    Missing { field: String, hint: String },
}

impl CacheConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Missing` if `path` is empty, and
    /// `ConfigError::Invalid` if:
    /// - `max_size_bytes` is below `min_size_bytes`
    /// - `default_ttl_secs`, `pool_size` or `maintenance_interval_ms` is 0
    /// - `prune_fraction` is outside (0, 1]
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.path.as_os_str().is_empty() {
            return Err(ConfigError::Missing {
                field: "path".into(),
                hint: "Set SQLSTASH_PATH to a file path or \":memory:\"".into(),
            });
        }

        if self.max_size_bytes < self.min_size_bytes {
            return Err(ConfigError::Invalid {
                field: "max_size_bytes".into(),
                reason: format!("must be at least {} bytes", self.min_size_bytes),
            });
        }

        if self.default_ttl_secs == 0 {
            return Err(ConfigError::Invalid { field: "default_ttl_secs".into(), reason: "must be greater than 0".into() });
        }

        if self.pool_size == 0 {
            return Err(ConfigError::Invalid { field: "pool_size".into(), reason: "must be greater than 0".into() });
        }

        if self.maintenance_interval_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "maintenance_interval_ms".into(),
                reason: "must be greater than 0".into(),
            });
        }

        if !(self.prune_fraction > 0.0 && self.prune_fraction <= 1.0) {
            return Err(ConfigError::Invalid {
                field: "prune_fraction".into(),
                reason: "must be in the range (0, 1]".into(),
            });
        }

        if self.is_in_memory() && self.pool_size > 1 {
            tracing::warn!(
                pool_size = self.pool_size,
                "In-memory stores cannot share data across connections; using a single handle"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_validate_default_config() {
        let config = CacheConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_empty_path() {
        let config = CacheConfig { path: PathBuf::new(), ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Missing { field, .. }) if field == "path"));
    }

    #[test]
    fn test_validate_ceiling_below_floor() {
        let config = CacheConfig { max_size_bytes: 16 * 1024, ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "max_size_bytes"));
    }

    #[test]
    fn test_validate_ceiling_at_floor() {
        let config = CacheConfig { max_size_bytes: 32 * 1024, ..Default::default() };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_zero_ttl() {
        let config = CacheConfig { default_ttl_secs: 0, ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "default_ttl_secs"));
    }

    #[test]
    fn test_validate_zero_pool() {
        let config = CacheConfig { pool_size: 0, ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "pool_size"));
    }

    #[test]
    fn test_validate_zero_interval() {
        let config = CacheConfig { maintenance_interval_ms: 0, ..Default::default() };
        let result = config.validate();
        assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "maintenance_interval_ms"));
    }

    #[test]
    fn test_validate_prune_fraction_bounds() {
        for fraction in [0.0, -0.5, 1.5, f64::NAN] {
            let config = CacheConfig { prune_fraction: fraction, ..Default::default() };
            let result = config.validate();
            assert!(matches!(result, Err(ConfigError::Invalid { field, .. }) if field == "prune_fraction"));
        }

        let config = CacheConfig { prune_fraction: 1.0, ..Default::default() };
        assert!(config.validate().is_ok());
    }
}
