//! `GigaVector` configuration module.
//!
//! Provides configuration file support via `gigavector.toml`, environment
//! variables, and runtime overrides.
//!
//! # Priority (highest to lowest)
//!
//! 1. Runtime overrides (library callers constructing `GigaConfig` directly)
//! 2. Environment variables (`GIGAVECTOR_*`)
//! 3. Configuration file (`gigavector.toml`)
//! 4. Default values

use crate::cache::EvictionPolicy;
use crate::distance::DistanceMetric;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to parse configuration file.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Invalid configuration value.
    #[error("Invalid configuration value for '{key}': {message}")]
    InvalidValue {
        /// Configuration key that failed validation.
        key: String,
        /// Validation error message.
        message: String,
    },

    /// IO error.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<ConfigError> for crate::error::Error {
    fn from(e: ConfigError) -> Self {
        crate::error::Error::Config(e.to_string())
    }
}

fn default_metric() -> DistanceMetric {
    DistanceMetric::Euclidean
}

/// Query execution configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Default `k` when a query does not specify one.
    pub default_k: usize,
    /// Default distance metric for new collections.
    #[serde(default = "default_metric")]
    pub default_metric: DistanceMetric,
    /// Hard ceiling on results returned by a single query.
    pub max_results: usize,
    /// Query timeout in milliseconds.
    pub query_timeout_ms: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_k: 10,
            default_metric: DistanceMetric::Euclidean,
            max_results: 1000,
            query_timeout_ms: 30_000,
        }
    }
}

/// HNSW index configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HnswConfig {
    /// Number of bidirectional connections per node (M parameter).
    pub m: usize,
    /// Candidate pool size during construction.
    pub ef_construction: usize,
    /// Candidate pool size during search, absent a per-query override.
    pub ef_search: usize,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self { m: 16, ef_construction: 200, ef_search: 64 }
    }
}

/// IVF+PQ index configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IvfPqConfig {
    /// Number of coarse (inverted-list) clusters.
    pub nlist: usize,
    /// Number of coarse lists probed per query.
    pub nprobe: usize,
    /// Number of PQ subspaces.
    pub m: usize,
    /// Bits per PQ code (codebook size is `2^nbits`).
    pub nbits: u8,
    /// Lloyd's-iteration count for coarse and subspace k-means.
    pub kmeans_iters: usize,
}

impl Default for IvfPqConfig {
    fn default() -> Self {
        Self { nlist: 100, nprobe: 8, m: 8, nbits: 8, kmeans_iters: 10 }
    }
}

/// Result cache configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of cached query results.
    pub max_entries: usize,
    /// Maximum total memory budget for cached results, in bytes.
    pub max_memory_bytes: usize,
    /// Entry time-to-live in seconds (0 = never expires by age).
    pub ttl_seconds: u64,
    /// Invalidate the whole cache after this many mutations (0 = never).
    pub invalidate_after_mutations: u64,
    /// Eviction policy once a capacity bound is hit.
    pub eviction_policy: EvictionPolicy,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_memory_bytes: 256 * 1024 * 1024,
            ttl_seconds: 60,
            invalidate_after_mutations: 1000,
            eviction_policy: EvictionPolicy::Lru,
        }
    }
}

/// Server configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_address: String,
    /// Port number.
    pub port: u16,
    /// Maximum concurrent client connections.
    pub max_connections: usize,
    /// Maximum wire-protocol frame size, in bytes.
    pub max_message_bytes: usize,
    /// Size of the bounded worker-thread pool.
    pub thread_pool_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 50051,
            max_connections: 256,
            max_message_bytes: 16 * 1024 * 1024,
            thread_pool_size: 4,
        }
    }
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: error, warn, info, debug, trace.
    pub level: String,
    /// Log format: text or json.
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: "text".to_string() }
    }
}

/// Top-level `GigaVector` configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GigaConfig {
    /// Query execution configuration.
    pub search: SearchConfig,
    /// HNSW index configuration.
    pub hnsw: HnswConfig,
    /// IVF+PQ index configuration.
    pub ivfpq: IvfPqConfig,
    /// Result cache configuration.
    pub cache: CacheConfig,
    /// Server configuration.
    pub server: ServerConfig,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl GigaConfig {
    /// Loads configuration from `gigavector.toml` in the current directory,
    /// layered with `GIGAVECTOR_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ParseError` if the file or environment overrides don't
    /// deserialize into `GigaConfig`.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("gigavector.toml")
    }

    /// Loads configuration from a specific file path, layered with
    /// `GIGAVECTOR_*` environment variables. Missing files simply fall back
    /// to defaults — only a malformed file is an error.
    ///
    /// # Errors
    ///
    /// Returns `ParseError` if the file or environment overrides don't
    /// deserialize into `GigaConfig`.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("GIGAVECTOR_").split("_").lowercase(false));

        figment.extract().map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Builds a configuration from a TOML string, skipping the filesystem
    /// and environment layers. Mainly for tests.
    ///
    /// # Errors
    ///
    /// Returns `ParseError` if `toml_str` doesn't deserialize into
    /// `GigaConfig`.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::string(toml_str));

        figment.extract().map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Validates cross-field and range invariants that `serde` alone can't
    /// express.
    ///
    /// # Errors
    ///
    /// Returns `InvalidValue` naming the offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.search.max_results == 0 || self.search.max_results > 10_000 {
            return Err(ConfigError::InvalidValue {
                key: "search.max_results".to_string(),
                message: format!("value {} is out of range [1, 10000]", self.search.max_results),
            });
        }

        if !(4..=128).contains(&self.hnsw.m) {
            return Err(ConfigError::InvalidValue {
                key: "hnsw.m".to_string(),
                message: format!("value {} is out of range [4, 128]", self.hnsw.m),
            });
        }
        if !(16..=2000).contains(&self.hnsw.ef_construction) {
            return Err(ConfigError::InvalidValue {
                key: "hnsw.ef_construction".to_string(),
                message: format!(
                    "value {} is out of range [16, 2000]",
                    self.hnsw.ef_construction
                ),
            });
        }
        if self.hnsw.ef_search == 0 {
            return Err(ConfigError::InvalidValue {
                key: "hnsw.ef_search".to_string(),
                message: "must be non-zero".to_string(),
            });
        }

        if self.ivfpq.nlist == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ivfpq.nlist".to_string(),
                message: "must be non-zero".to_string(),
            });
        }
        if self.ivfpq.nprobe == 0 || self.ivfpq.nprobe > self.ivfpq.nlist {
            return Err(ConfigError::InvalidValue {
                key: "ivfpq.nprobe".to_string(),
                message: format!(
                    "value {} must be in [1, nlist={}]",
                    self.ivfpq.nprobe, self.ivfpq.nlist
                ),
            });
        }
        if self.ivfpq.nbits == 0 || self.ivfpq.nbits > 16 {
            return Err(ConfigError::InvalidValue {
                key: "ivfpq.nbits".to_string(),
                message: format!("value {} is out of range [1, 16]", self.ivfpq.nbits),
            });
        }

        if self.server.port < 1024 {
            return Err(ConfigError::InvalidValue {
                key: "server.port".to_string(),
                message: format!("value {} must be >= 1024", self.server.port),
            });
        }
        if self.server.max_connections == 0 {
            return Err(ConfigError::InvalidValue {
                key: "server.max_connections".to_string(),
                message: "must be non-zero".to_string(),
            });
        }

        let valid_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::InvalidValue {
                key: "logging.level".to_string(),
                message: format!(
                    "value '{}' is invalid, expected one of: {:?}",
                    self.logging.level, valid_levels
                ),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(GigaConfig::default().validate().is_ok());
    }

    #[test]
    fn from_toml_overrides_defaults() {
        let cfg = GigaConfig::from_toml(
            r#"
            [hnsw]
            m = 32
            ef_construction = 400

            [server]
            port = 9000
            "#,
        )
        .unwrap();
        assert_eq!(cfg.hnsw.m, 32);
        assert_eq!(cfg.hnsw.ef_construction, 400);
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.hnsw.ef_search, 64); // untouched section keeps default
    }

    #[test]
    fn rejects_out_of_range_hnsw_m() {
        let cfg = GigaConfig::from_toml("[hnsw]\nm = 1").unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn rejects_nprobe_exceeding_nlist() {
        let cfg = GigaConfig::from_toml("[ivfpq]\nnlist = 10\nnprobe = 20").unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn rejects_unprivileged_port() {
        let cfg = GigaConfig::from_toml("[server]\nport = 80").unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn rejects_unknown_log_level() {
        let cfg = GigaConfig::from_toml("[logging]\nlevel = \"verbose\"").unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidValue { .. })));
    }
}
