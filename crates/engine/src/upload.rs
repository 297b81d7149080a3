//! Upload pipeline.
//!
//! An upload runs as two cooperating halves joined on the caller's task:
//! the chunker reads the inbound stream, cuts it into `chunk_size` windows and
//! feeds the hash and length, while the writer persists each window. The
//! channel between them holds a single window, so a slow chunk store slows
//! the reader instead of letting chunks pile up in memory.

use crate::error::{EngineError, EngineResult};
use crate::files::discard;
use crate::{Engine, metrics};
use bytes::{Bytes, BytesMut};
use coffer_core::file::MIMETYPE_KEY;
use coffer_core::{ContentHash, ContentHasher, FileId, FileRecord, UserMetadata};
use coffer_metadata::{FileRepo, FileRow, MetadataError, MetadataStore};
use coffer_storage::ChunkStore;
use futures::{Stream, StreamExt};
use std::io;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;

/// Read buffer size when uploading from an `AsyncRead`.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Target location and user metadata for one upload.
#[derive(Clone, Debug)]
pub struct UploadRequest {
    pub container: String,
    pub filename: String,
    pub metadata: UserMetadata,
}

impl UploadRequest {
    pub fn new(container: impl Into<String>, filename: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            filename: filename.into(),
            metadata: UserMetadata::new(),
        }
    }

    /// Attach an opaque metadata value.
    pub fn with_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_mimetype(self, mimetype: impl Into<String>) -> Self {
        self.with_metadata(MIMETYPE_KEY, mimetype.into())
    }

    fn validate(&self) -> EngineResult<()> {
        if self.container.is_empty() {
            return Err(EngineError::InvalidRequest(
                "container must not be empty".to_string(),
            ));
        }
        if self.filename.is_empty() {
            return Err(EngineError::InvalidRequest(
                "filename must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// What the chunker saw of the inbound stream.
#[derive(Debug)]
struct Digest {
    length: u64,
    content_hash: ContentHash,
    chunks: u32,
}

impl Engine {
    /// Store an inbound byte stream as a new file.
    ///
    /// Returns the committed record, or, when the container already holds a
    /// file with the same length and content hash, that earlier record with
    /// `duplicate_of` set; the new chunks and record are rolled back.
    ///
    /// Any failure removes the chunks and pending record written so far and
    /// is reported as `EngineError::UploadFailed`. Dropping the returned
    /// future before it completes schedules the same cleanup on the runtime.
    pub async fn upload<S>(&self, request: UploadRequest, body: S) -> EngineResult<FileRecord>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        request.validate()?;
        let started = Instant::now();

        let record = FileRecord::pending(
            request.container,
            request.filename,
            self.config.chunk_size,
            request.metadata,
        );
        let row = FileRow::from_record(&record)?;
        let file_id = self.metadata.create_pending(&row).await.map_err(|e| {
            metrics::UPLOADS_FAILED.inc();
            EngineError::UploadFailed {
                file_id: record.id,
                source: Box::new(e.into()),
            }
        })?;

        let mut guard = CleanupGuard::arm(self.chunks.clone(), self.metadata.clone(), file_id);
        let result = self.store_and_commit(&record, body).await;

        match result {
            Ok(outcome) => {
                guard.disarm();
                metrics::UPLOAD_DURATION.observe(started.elapsed().as_secs_f64());
                Ok(outcome)
            }
            Err(err) => {
                metrics::UPLOADS_FAILED.inc();
                if let Err(cleanup_err) =
                    discard(self.chunks.as_ref(), self.metadata.as_ref(), file_id).await
                {
                    tracing::warn!(
                        file_id = %file_id,
                        error = %cleanup_err,
                        "Cleanup after failed upload incomplete"
                    );
                }
                guard.disarm();
                tracing::warn!(
                    file_id = %file_id,
                    container = %record.container,
                    error = %err,
                    "Upload failed"
                );
                Err(EngineError::UploadFailed {
                    file_id,
                    source: Box::new(err),
                })
            }
        }
    }

    /// Store everything readable from `reader` as a new file.
    pub async fn upload_reader<R>(&self, request: UploadRequest, reader: R) -> EngineResult<FileRecord>
    where
        R: AsyncRead + Send,
    {
        self.upload(request, ReaderStream::with_capacity(reader, READ_BUFFER_SIZE))
            .await
    }

    async fn store_and_commit<S>(&self, record: &FileRecord, body: S) -> EngineResult<FileRecord>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let digest = self.store_chunks(record.id, body).await?;

        let finalized = self
            .metadata
            .finalize(
                record.id,
                digest.length,
                &digest.content_hash,
                OffsetDateTime::now_utc(),
            )
            .await;

        let earlier = match finalized {
            Ok(row) => {
                let candidate = self
                    .metadata
                    .find_by_identity(
                        digest.length,
                        &digest.content_hash,
                        &record.container,
                        Some(record.id),
                    )
                    .await?;
                // Of two identical commits only the later one yields.
                match candidate {
                    Some(existing) if existing.commit_seq < row.commit_seq => existing,
                    _ => return committed(row, &digest),
                }
            }
            Err(MetadataError::Constraint(reason)) => self
                .metadata
                .find_by_identity(digest.length, &digest.content_hash, &record.container, None)
                .await?
                .ok_or(EngineError::Metadata(MetadataError::Constraint(reason)))?,
            Err(e) => return Err(e.into()),
        };

        let removed = discard(self.chunks.as_ref(), self.metadata.as_ref(), record.id).await?;
        let existing = earlier.into_record()?.into_duplicate_reference();
        metrics::UPLOADS_DEDUPLICATED.inc();
        tracing::info!(
            file_id = %record.id,
            duplicate_of = %existing.id,
            container = %existing.container,
            chunks_removed = removed,
            "Upload resolved to existing file"
        );
        Ok(existing)
    }

    /// Run the chunker and the writer to completion.
    async fn store_chunks<S>(&self, file_id: FileId, body: S) -> EngineResult<Digest>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let chunk_size = usize::try_from(self.config.chunk_size).map_err(|_| {
            EngineError::Config(format!("chunk size {} exceeds usize", self.config.chunk_size))
        })?;
        let (tx, rx) = mpsc::channel(1);

        let (produced, written) = tokio::join!(
            chunk_stream(body, chunk_size, tx),
            write_chunks(self.chunks.as_ref(), file_id, rx),
        );

        // A writer failure closes the channel, so its error explains the chunker's.
        let written = written?;
        let digest = produced?;
        if written != digest.chunks {
            return Err(EngineError::Internal(format!(
                "wrote {written} of {} chunks",
                digest.chunks
            )));
        }
        Ok(digest)
    }
}

fn committed(row: FileRow, digest: &Digest) -> EngineResult<FileRecord> {
    let record = row.into_record()?;
    metrics::UPLOADS_COMMITTED.inc();
    tracing::info!(
        file_id = %record.id,
        container = %record.container,
        filename = %record.filename,
        length = digest.length,
        chunks = digest.chunks,
        "Upload committed"
    );
    Ok(record)
}

/// Cuts an inbound stream into fixed-size windows and hands them to the writer.
struct Chunker {
    chunk_size: usize,
    buffer: BytesMut,
    hasher: ContentHasher,
    length: u64,
    next_sequence: u32,
    tx: mpsc::Sender<(u32, Bytes)>,
}

impl Chunker {
    fn new(chunk_size: usize, tx: mpsc::Sender<(u32, Bytes)>) -> Self {
        Self {
            chunk_size,
            buffer: BytesMut::with_capacity(chunk_size),
            hasher: ContentHash::hasher(),
            length: 0,
            next_sequence: 0,
            tx,
        }
    }

    async fn push(&mut self, mut piece: Bytes) -> EngineResult<()> {
        while !piece.is_empty() {
            if self.buffer.is_empty() && piece.len() >= self.chunk_size {
                // Whole windows pass through without copying.
                let window = piece.split_to(self.chunk_size);
                self.emit(window).await?;
                continue;
            }

            let take = (self.chunk_size - self.buffer.len()).min(piece.len());
            self.buffer.extend_from_slice(&piece.split_to(take));
            if self.buffer.len() == self.chunk_size {
                let window = self.buffer.split().freeze();
                self.emit(window).await?;
            }
        }
        Ok(())
    }

    async fn emit(&mut self, window: Bytes) -> EngineResult<()> {
        let sequence = self.next_sequence;
        self.next_sequence = sequence
            .checked_add(1)
            .ok_or_else(|| EngineError::InvalidRequest("file has too many chunks".to_string()))?;

        self.hasher.update(&window);
        self.length += window.len() as u64;
        metrics::BYTES_UPLOADED.inc_by(window.len() as u64);

        self.tx
            .send((sequence, window))
            .await
            .map_err(|_| EngineError::Internal("chunk writer stopped".to_string()))
    }

    async fn finish(mut self) -> EngineResult<Digest> {
        if !self.buffer.is_empty() {
            let window = self.buffer.split().freeze();
            self.emit(window).await?;
        }
        Ok(Digest {
            length: self.length,
            content_hash: self.hasher.finalize(),
            chunks: self.next_sequence,
        })
    }
}

async fn chunk_stream<S>(
    body: S,
    chunk_size: usize,
    tx: mpsc::Sender<(u32, Bytes)>,
) -> EngineResult<Digest>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    let mut body = std::pin::pin!(body);
    let mut chunker = Chunker::new(chunk_size, tx);

    loop {
        let next = tokio::select! {
            next = body.next() => next,
            // Stop reading as soon as the writer gives up.
            _ = chunker.tx.closed() => {
                return Err(EngineError::Internal("chunk writer stopped".to_string()));
            }
        };
        match next {
            Some(piece) => chunker.push(piece?).await?,
            None => break,
        }
    }

    chunker.finish().await
}

async fn write_chunks(
    store: &dyn ChunkStore,
    file_id: FileId,
    mut rx: mpsc::Receiver<(u32, Bytes)>,
) -> EngineResult<u32> {
    let mut written = 0;
    while let Some((sequence, data)) = rx.recv().await {
        store.write_chunk(file_id, sequence, data).await?;
        metrics::CHUNKS_WRITTEN.inc();
        written += 1;
    }
    Ok(written)
}

/// Removes a pending upload's chunks and record if the upload future is
/// dropped before it finishes.
struct CleanupGuard {
    chunks: Arc<dyn ChunkStore>,
    metadata: Arc<dyn MetadataStore>,
    file_id: FileId,
    armed: bool,
}

impl CleanupGuard {
    fn arm(chunks: Arc<dyn ChunkStore>, metadata: Arc<dyn MetadataStore>, file_id: FileId) -> Self {
        Self {
            chunks,
            metadata,
            file_id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let file_id = self.file_id;
        metrics::UPLOADS_FAILED.inc();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(file_id = %file_id, "Upload abandoned, cleaning up");
                let chunks = self.chunks.clone();
                let metadata = self.metadata.clone();
                handle.spawn(async move {
                    if let Err(e) = discard(chunks.as_ref(), metadata.as_ref(), file_id).await {
                        tracing::warn!(
                            file_id = %file_id,
                            error = %e,
                            "Cleanup of abandoned upload failed"
                        );
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    file_id = %file_id,
                    "Upload abandoned outside a runtime, left for purge_stale_uploads"
                );
            }
        }
    }
}
