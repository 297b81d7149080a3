//! Shared engine test utilities.

#![allow(dead_code)]

pub mod mocks;

use bytes::Bytes;
use coffer_core::config::EngineConfig;
use coffer_engine::{Download, Engine, EngineResult};
use coffer_metadata::SqliteStore;
use coffer_storage::{ChunkStore, MemoryChunkStore};
use futures::{Stream, TryStreamExt};
use std::sync::Arc;
use tempfile::TempDir;

/// An engine over an in-memory chunk store and a temporary SQLite database.
pub struct TestEngine {
    pub engine: Engine,
    pub chunks: Arc<dyn ChunkStore>,
    pub metadata: Arc<SqliteStore>,
    _temp_dir: TempDir,
}

impl TestEngine {
    /// Memory chunks with the given chunk size.
    pub async fn new(chunk_size: u64) -> Self {
        Self::with_store(Arc::new(MemoryChunkStore::new()), config(chunk_size), true).await
    }

    pub async fn with_store(
        chunks: Arc<dyn ChunkStore>,
        config: EngineConfig,
        unique_content: bool,
    ) -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let metadata = Arc::new(
            SqliteStore::new(temp_dir.path().join("metadata.db"), None, unique_content)
                .await
                .expect("Failed to create metadata store"),
        );
        let engine =
            Engine::new(chunks.clone(), metadata.clone(), config).expect("Failed to build engine");
        Self {
            engine,
            chunks,
            metadata,
            _temp_dir: temp_dir,
        }
    }
}

pub fn config(chunk_size: u64) -> EngineConfig {
    EngineConfig {
        chunk_size,
        ..Default::default()
    }
}

/// Deterministic, non-repeating-looking test content.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| ((i as u64).wrapping_mul(2654435761) >> 13) as u8)
        .collect()
}

/// A body stream delivering `data` in pieces of `piece` bytes.
pub fn body(data: &[u8], piece: usize) -> impl Stream<Item = std::io::Result<Bytes>> + Send + use<> {
    let pieces: Vec<std::io::Result<Bytes>> = data
        .chunks(piece.max(1))
        .map(|p| Ok(Bytes::copy_from_slice(p)))
        .collect();
    futures::stream::iter(pieces)
}

/// Drain a download into memory.
pub async fn read_all(download: Download) -> EngineResult<Vec<u8>> {
    let pieces: Vec<Bytes> = download.into_stream().try_collect().await?;
    Ok(pieces.concat())
}

/// Wait until `check` holds, polling for up to two seconds.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    false
}
