//! In-memory chunk store.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ChunkStore, ChunkStream};
use async_trait::async_trait;
use bytes::Bytes;
use coffer_core::chunk::chunk_object_key;
use coffer_core::{Chunk, FileId};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::instrument;

type ChunkMap = DashMap<FileId, BTreeMap<u32, Bytes>>;

/// Chunk store held entirely in process memory.
///
/// Cheap to clone; clones share the same chunks.
#[derive(Clone, Default)]
pub struct MemoryChunkStore {
    files: Arc<ChunkMap>,
}

impl MemoryChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of chunks across all files.
    pub fn total_chunks(&self) -> usize {
        self.files.iter().map(|entry| entry.value().len()).sum()
    }
}

#[async_trait]
impl ChunkStore for MemoryChunkStore {
    #[instrument(skip(self, data), fields(backend = "memory", size = data.len()))]
    async fn write_chunk(&self, file_id: FileId, sequence: u32, data: Bytes) -> StorageResult<()> {
        let mut chunks = self.files.entry(file_id).or_default();
        if let Some(existing) = chunks.get(&sequence)
            && *existing != data
        {
            return Err(StorageError::Conflict(format!(
                "{} already holds different bytes",
                chunk_object_key(file_id, sequence)
            )));
        }
        chunks.insert(sequence, data);
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "memory"))]
    async fn read_chunks(
        &self,
        file_id: FileId,
        from: u32,
        to: u32,
    ) -> StorageResult<ChunkStream> {
        let has_chunks = self
            .files
            .get(&file_id)
            .is_some_and(|chunks| !chunks.is_empty());
        if !has_chunks {
            return Err(StorageError::NotFound(format!("no chunks for file {file_id}")));
        }

        let files = self.files.clone();
        let stream = async_stream::try_stream! {
            for sequence in from..=to {
                // Look up at poll time so deletes racing the reader are observed.
                let data = files
                    .get(&file_id)
                    .and_then(|chunks| chunks.get(&sequence).cloned())
                    .ok_or_else(|| StorageError::NotFound(chunk_object_key(file_id, sequence)))?;
                yield Chunk::new(file_id, sequence, data);
            }
        };

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self), fields(backend = "memory"))]
    async fn delete_chunks(&self, file_id: FileId) -> StorageResult<u64> {
        Ok(self
            .files
            .remove(&file_id)
            .map(|(_, chunks)| chunks.len() as u64)
            .unwrap_or(0))
    }

    async fn chunk_count(&self, file_id: FileId) -> StorageResult<u64> {
        Ok(self
            .files
            .get(&file_id)
            .map(|chunks| chunks.len() as u64)
            .unwrap_or(0))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
