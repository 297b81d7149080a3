//! Upload, download and container pipelines for coffer.
//!
//! An [`Engine`] owns explicit handles to a chunk store and a metadata store.
//! Every pipeline runs against those handles; nothing is process-global except
//! the metrics registry.
//!
//! - [`Engine::upload`] chunks, hashes and commits an inbound byte stream and
//!   resolves identical content in the same container to the existing file.
//! - [`Engine::download`] streams a whole file or a byte range, optionally
//!   rate limited.
//! - [`Engine::destroy_container`] and the per-file operations remove chunks
//!   before the records that own them.

pub mod container;
pub mod download;
pub mod error;
pub mod files;
pub mod metrics;
pub mod throttle;
pub mod upload;

pub use container::{Container, DestroyReport};
pub use download::{ByteStream, Download, DownloadTarget};
pub use error::{DestroyFailure, EngineError, EngineResult, ErrorKind};
pub use throttle::Throttle;
pub use upload::UploadRequest;

use coffer_core::config::{AppConfig, EngineConfig};
use coffer_metadata::MetadataStore;
use coffer_storage::ChunkStore;
use std::sync::Arc;

/// Storage engine handle.
///
/// Cheap to clone; clones share the same stores.
#[derive(Clone)]
pub struct Engine {
    chunks: Arc<dyn ChunkStore>,
    metadata: Arc<dyn MetadataStore>,
    config: EngineConfig,
}

impl Engine {
    /// Open the stores described by `config` and build an engine over them.
    pub async fn open(config: &AppConfig) -> EngineResult<Self> {
        config.validate().map_err(EngineError::Config)?;

        let chunks = coffer_storage::from_config(&config.storage).await?;
        let metadata = coffer_metadata::from_config(&config.metadata).await?;

        tracing::info!(
            storage = chunks.backend_name(),
            chunk_size = config.engine.chunk_size,
            throttled = config.engine.throttle.is_enabled(),
            "Engine opened"
        );

        Self::new(chunks, metadata, config.engine.clone())
    }

    /// Build an engine over existing stores.
    pub fn new(
        chunks: Arc<dyn ChunkStore>,
        metadata: Arc<dyn MetadataStore>,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        config.validate().map_err(EngineError::Config)?;
        metrics::register_metrics();
        Ok(Self {
            chunks,
            metadata,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn chunk_store(&self) -> &Arc<dyn ChunkStore> {
        &self.chunks
    }

    pub fn metadata_store(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    /// Check both stores.
    pub async fn health_check(&self) -> EngineResult<()> {
        self.chunks.health_check().await?;
        self.metadata.health_check().await?;
        Ok(())
    }

    /// Release the metadata connection pool.
    ///
    /// Clones of this engine stop working once it is closed.
    pub async fn close(&self) {
        self.metadata.close().await;
        tracing::debug!("Engine closed");
    }
}
