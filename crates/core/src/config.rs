//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::path::PathBuf;

/// Engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Bytes per chunk for new uploads. Fixed per deployment; existing
    /// files keep the chunk size they were written with.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// Download bandwidth limit.
    #[serde(default)]
    pub throttle: ThrottleConfig,
    /// Maximum number of files deleted concurrently when destroying a container.
    #[serde(default = "default_destroy_concurrency")]
    pub destroy_concurrency: usize,
}

fn default_chunk_size() -> u64 {
    crate::DEFAULT_CHUNK_SIZE
}

fn default_destroy_concurrency() -> usize {
    8
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            throttle: ThrottleConfig::default(),
            destroy_concurrency: default_destroy_concurrency(),
        }
    }
}

impl EngineConfig {
    /// Validate engine configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if !(crate::MIN_CHUNK_SIZE..=crate::MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(crate::Error::InvalidChunkSize {
                size: self.chunk_size,
                min: crate::MIN_CHUNK_SIZE,
                max: crate::MAX_CHUNK_SIZE,
            }
            .to_string());
        }
        if self.destroy_concurrency == 0 {
            return Err("engine.destroy_concurrency must be at least 1".to_string());
        }
        self.throttle.validate()
    }
}

/// Download throttling configuration (token bucket over outgoing bytes).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Sustained bytes per second per download. `None` disables throttling.
    #[serde(default)]
    pub bytes_per_second: Option<NonZeroU32>,
    /// Bucket capacity in bytes. Defaults to one second's worth of bytes.
    #[serde(default)]
    pub burst_bytes: Option<NonZeroU32>,
}

impl ThrottleConfig {
    /// A limit of `bytes_per_second` with the default burst.
    pub fn per_second(bytes_per_second: NonZeroU32) -> Self {
        Self {
            bytes_per_second: Some(bytes_per_second),
            burst_bytes: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.bytes_per_second.is_some()
    }

    /// Effective burst size when throttling is enabled.
    pub fn burst(&self) -> Option<NonZeroU32> {
        self.bytes_per_second.map(|rate| self.burst_bytes.unwrap_or(rate))
    }

    /// Validate throttle configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.burst_bytes.is_some() && self.bytes_per_second.is_none() {
            return Err(
                "engine.throttle.burst_bytes requires engine.throttle.bytes_per_second".to_string(),
            );
        }
        Ok(())
    }
}

/// Chunk store backend configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for chunk files.
        path: PathBuf,
    },
    /// Process-local memory (tests and throwaway deployments).
    Memory,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self::Filesystem {
            path: PathBuf::from("./data/chunks"),
        }
    }
}

impl StorageConfig {
    /// Validate storage configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            StorageConfig::Filesystem { path } if path.as_os_str().is_empty() => {
                Err("storage.path must not be empty".to_string())
            }
            _ => Ok(()),
        }
    }
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database.
    Sqlite {
        /// Database file path (`:memory:` for an in-process database).
        path: PathBuf,
        /// Per-query timeout in seconds.
        #[serde(default = "default_sqlite_query_timeout_secs")]
        query_timeout_secs: Option<u64>,
        /// Enforce at most one committed file per (container, length, content hash).
        #[serde(default = "default_unique_content")]
        unique_content: bool,
    },
}

fn default_sqlite_query_timeout_secs() -> Option<u64> {
    Some(600) // 10 minutes (advisory only)
}

fn default_unique_content() -> bool {
    true
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
            query_timeout_secs: default_sqlite_query_timeout_secs(),
            unique_content: default_unique_content(),
        }
    }
}

impl MetadataConfig {
    /// Validate metadata configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { path, .. } if path.as_os_str().is_empty() => {
                Err("metadata.path must not be empty".to_string())
            }
            MetadataConfig::Sqlite { .. } => Ok(()),
        }
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,
    /// Chunk store configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Metadata store configuration.
    #[serde(default)]
    pub metadata: MetadataConfig,
}

impl AppConfig {
    /// Create a test configuration rooted in `dir`.
    ///
    /// **For testing only.** Uses filesystem chunks and a SQLite file.
    pub fn for_testing(dir: &std::path::Path) -> Self {
        Self {
            engine: EngineConfig::default(),
            storage: StorageConfig::Filesystem {
                path: dir.join("chunks"),
            },
            metadata: MetadataConfig::Sqlite {
                path: dir.join("metadata.db"),
                query_timeout_secs: None,
                unique_content: true,
            },
        }
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.engine.validate()?;
        self.storage.validate()?;
        self.metadata.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.chunk_size, 256 * 1024);
        assert!(!config.throttle.is_enabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_engine_config_rejects_bad_chunk_size() {
        let config = EngineConfig {
            chunk_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = EngineConfig {
            chunk_size: crate::MAX_CHUNK_SIZE + 1,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_throttle_burst_defaults_to_rate() {
        let rate = NonZeroU32::new(4096).unwrap();
        let throttle = ThrottleConfig::per_second(rate);
        assert_eq!(throttle.burst(), Some(rate));

        let orphan_burst = ThrottleConfig {
            bytes_per_second: None,
            burst_bytes: NonZeroU32::new(10),
        };
        assert!(orphan_burst.validate().is_err());
    }

    #[test]
    fn test_app_config_deserialize_partial() {
        let json = r#"{
            "engine": {"chunk_size": 1024, "throttle": {"bytes_per_second": 2048}},
            "storage": {"type": "memory"}
        }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.engine.chunk_size, 1024);
        assert_eq!(config.engine.destroy_concurrency, 8);
        assert_eq!(config.engine.throttle.burst().map(|b| b.get()), Some(2048));
        assert!(matches!(config.storage, StorageConfig::Memory));
        match config.metadata {
            MetadataConfig::Sqlite { unique_content, .. } => assert!(unique_content),
        }
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_storage_config_rejects_empty_path() {
        let config = StorageConfig::Filesystem {
            path: PathBuf::new(),
        };
        assert!(config.validate().is_err());
    }
}
