//! Per-file operations.

use crate::error::{EngineError, EngineResult};
use crate::{Engine, metrics};
use coffer_core::{FileId, FileRecord};
use coffer_metadata::{FileRepo, FileRow, MetadataError, MetadataStore};
use coffer_storage::ChunkStore;
use time::OffsetDateTime;

impl Engine {
    /// Most recently committed file with this name in the container.
    pub async fn get_file(&self, container: &str, filename: &str) -> EngineResult<FileRecord> {
        let row = self
            .metadata
            .find_by_container_and_name(container, filename)
            .await?;
        Ok(row.into_record()?)
    }

    /// A file by id, pending or committed.
    pub async fn get_file_by_id(&self, id: FileId) -> EngineResult<FileRecord> {
        Ok(self.metadata.find_by_id(id).await?.into_record()?)
    }

    /// Committed files in a container, in commit order.
    pub async fn list_files(&self, container: &str) -> EngineResult<Vec<FileRecord>> {
        self.metadata
            .list_files(container)
            .await?
            .into_iter()
            .map(|row| row.into_record().map_err(EngineError::from))
            .collect()
    }

    /// Delete the file currently resolved by name, chunks first.
    pub async fn remove_file(&self, container: &str, filename: &str) -> EngineResult<FileRecord> {
        let record = self.get_file(container, filename).await?;
        self.remove_record(record).await
    }

    /// Delete a file by id, chunks first.
    pub async fn remove_file_by_id(&self, id: FileId) -> EngineResult<FileRecord> {
        let record = self.get_file_by_id(id).await?;
        self.remove_record(record).await
    }

    async fn remove_record(&self, record: FileRecord) -> EngineResult<FileRecord> {
        let chunks = discard(self.chunks.as_ref(), self.metadata.as_ref(), record.id).await?;
        tracing::info!(
            file_id = %record.id,
            container = %record.container,
            filename = %record.filename,
            chunks,
            "File removed"
        );
        Ok(record)
    }

    /// Remove pending records (and their chunks) older than `max_age`.
    ///
    /// Pending records outlive their upload only when the process died
    /// mid-upload. Returns the number of records removed.
    pub async fn purge_stale_uploads(&self, max_age: time::Duration) -> EngineResult<u64> {
        let cutoff = OffsetDateTime::now_utc() - max_age;
        let stale: Vec<FileRow> = self.metadata.list_stale_pending(cutoff).await?;

        let mut purged = 0;
        for row in stale {
            let id = row.id();
            match discard(self.chunks.as_ref(), self.metadata.as_ref(), id).await {
                Ok(chunks) => {
                    tracing::info!(file_id = %id, chunks, "Purged stale upload");
                    purged += 1;
                }
                Err(e) => tracing::warn!(file_id = %id, error = %e, "Failed to purge stale upload"),
            }
        }
        Ok(purged)
    }
}

/// Delete a file's chunks and then its record.
///
/// A record that is already gone counts as deleted. Returns the number of
/// chunks removed.
pub(crate) async fn discard(
    chunks: &dyn ChunkStore,
    metadata: &dyn MetadataStore,
    file_id: FileId,
) -> EngineResult<u64> {
    let removed = chunks.delete_chunks(file_id).await?;
    match metadata.delete(file_id).await {
        Ok(()) => metrics::FILES_DELETED.inc(),
        Err(MetadataError::NotFound(_)) => {}
        Err(e) => return Err(e.into()),
    }
    Ok(removed)
}
