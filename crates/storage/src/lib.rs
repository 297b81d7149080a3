//! Chunk storage abstraction and backends for coffer.
//!
//! This crate provides:
//! - The [`ChunkStore`] trait: chunks keyed by (file id, sequence number)
//! - Lazy, ordered chunk streams for range reads
//! - Backends: local filesystem (atomic writes) and in-memory

pub mod backends;
pub mod error;
pub mod traits;

pub use backends::{filesystem::FilesystemChunkStore, memory::MemoryChunkStore};
pub use error::{StorageError, StorageResult};
pub use traits::{ChunkStore, ChunkStream};

use coffer_core::config::StorageConfig;
use std::sync::Arc;

/// Create a chunk store from configuration.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<dyn ChunkStore>> {
    config.validate().map_err(StorageError::Config)?;

    match config {
        StorageConfig::Filesystem { path } => {
            let backend = FilesystemChunkStore::new(path).await?;
            Ok(Arc::new(backend))
        }
        StorageConfig::Memory => Ok(Arc::new(MemoryChunkStore::new())),
    }
}
