//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use coffer_core::{Chunk, FileId};
use futures::Stream;
use std::pin::Pin;

/// A boxed stream of chunks in ascending sequence order.
pub type ChunkStream = Pin<Box<dyn Stream<Item = StorageResult<Chunk>> + Send>>;

/// Chunk store abstraction.
///
/// Chunks are keyed by `(file_id, sequence)`. Writes to different files never
/// interfere; writes of the same triple are idempotent.
#[async_trait]
pub trait ChunkStore: Send + Sync + 'static {
    /// Persist one chunk durably.
    ///
    /// Retrying with the same `(file_id, sequence, data)` is a no-op in effect.
    async fn write_chunk(&self, file_id: FileId, sequence: u32, data: Bytes) -> StorageResult<()>;

    /// Read chunks `from..=to` of a file, lazily and in ascending order.
    ///
    /// Each call starts a fresh read of the window. Fails with `NotFound`
    /// before yielding anything if the file has no chunks at all; a chunk
    /// missing inside the window is yielded as an `Err(NotFound)` item.
    async fn read_chunks(&self, file_id: FileId, from: u32, to: u32)
    -> StorageResult<ChunkStream>;

    /// Delete every chunk of a file and return how many were removed.
    ///
    /// Deleting a file with no chunks returns 0.
    async fn delete_chunks(&self, file_id: FileId) -> StorageResult<u64>;

    /// Number of chunks currently stored for a file.
    async fn chunk_count(&self, file_id: FileId) -> StorageResult<u64>;

    /// Get the name of this storage backend.
    ///
    /// Used for metrics and logging.
    fn backend_name(&self) -> &'static str;

    /// Verify storage backend connectivity.
    ///
    /// The default implementation returns Ok(()), suitable for backends that
    /// don't require connectivity verification.
    async fn health_check(&self) -> StorageResult<()> {
        Ok(())
    }
}
