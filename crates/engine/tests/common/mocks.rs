//! Chunk store wrappers for fault injection.

use async_trait::async_trait;
use bytes::Bytes;
use coffer_core::FileId;
use coffer_storage::{ChunkStore, ChunkStream, MemoryChunkStore, StorageError, StorageResult};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

/// Memory store that can fail writes or deletes and hold writes behind a gate.
#[derive(Clone, Default)]
pub struct FaultyChunkStore {
    pub inner: MemoryChunkStore,
    fail_write_at: Option<u32>,
    fail_delete_for: Arc<Mutex<HashSet<FileId>>>,
    gate: Option<Arc<Semaphore>>,
    pub writes: Arc<AtomicUsize>,
}

impl FaultyChunkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every write of the given sequence number.
    pub fn failing_write_at(mut self, sequence: u32) -> Self {
        self.fail_write_at = Some(sequence);
        self
    }

    /// Hold each write until a permit is added to `gate`.
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn fail_delete_for(&self, file_id: FileId) {
        self.fail_delete_for.lock().unwrap().insert(file_id);
    }
}

#[async_trait]
impl ChunkStore for FaultyChunkStore {
    async fn write_chunk(&self, file_id: FileId, sequence: u32, data: Bytes) -> StorageResult<()> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate closed").forget();
        }
        if self.fail_write_at == Some(sequence) {
            return Err(StorageError::Io(std::io::Error::other("injected write failure")));
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write_chunk(file_id, sequence, data).await
    }

    async fn read_chunks(&self, file_id: FileId, from: u32, to: u32) -> StorageResult<ChunkStream> {
        self.inner.read_chunks(file_id, from, to).await
    }

    async fn delete_chunks(&self, file_id: FileId) -> StorageResult<u64> {
        if self.fail_delete_for.lock().unwrap().contains(&file_id) {
            return Err(StorageError::Io(std::io::Error::other("injected delete failure")));
        }
        self.inner.delete_chunks(file_id).await
    }

    async fn chunk_count(&self, file_id: FileId) -> StorageResult<u64> {
        self.inner.chunk_count(file_id).await
    }

    fn backend_name(&self) -> &'static str {
        "faulty-memory"
    }
}
