//! Database models mapping to the metadata schema.

use crate::error::{MetadataError, MetadataResult};
use coffer_core::{ContentHash, FileId, FileRecord, FileState, UserMetadata};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// File record row.
///
/// `commit_seq` is assigned when the row is finalized and grows monotonically
/// across the whole table, so it orders commits even when timestamps collide.
#[derive(Debug, Clone, FromRow)]
pub struct FileRow {
    pub file_id: Uuid,
    pub container: String,
    pub filename: String,
    pub length: Option<i64>,
    pub content_hash: Option<String>,
    pub chunk_size: i64,
    /// User metadata as a JSON object.
    pub metadata: String,
    pub state: String,
    pub created_at: OffsetDateTime,
    pub committed_at: Option<OffsetDateTime>,
    pub commit_seq: Option<i64>,
}

impl FileRow {
    /// Build a row from a domain record.
    pub fn from_record(record: &FileRecord) -> MetadataResult<Self> {
        let metadata = serde_json::to_string(&record.metadata)
            .map_err(|e| MetadataError::Internal(format!("metadata encode: {e}")))?;
        Ok(Self {
            file_id: *record.id.as_uuid(),
            container: record.container.clone(),
            filename: record.filename.clone(),
            length: record.length.map(to_i64).transpose()?,
            content_hash: record.content_hash.map(|h| h.to_hex()),
            chunk_size: to_i64(record.chunk_size)?,
            metadata,
            state: record.state.as_str().to_string(),
            created_at: record.created_at,
            committed_at: record.committed_at,
            commit_seq: None,
        })
    }

    pub fn id(&self) -> FileId {
        FileId::from_uuid(self.file_id)
    }

    /// Convert back into a domain record.
    pub fn into_record(self) -> MetadataResult<FileRecord> {
        let metadata: UserMetadata = serde_json::from_str(&self.metadata)
            .map_err(|e| MetadataError::Internal(format!("metadata decode: {e}")))?;
        Ok(FileRecord {
            id: FileId::from_uuid(self.file_id),
            container: self.container,
            filename: self.filename,
            length: self.length.map(to_u64).transpose()?,
            content_hash: self
                .content_hash
                .as_deref()
                .map(ContentHash::from_hex)
                .transpose()?,
            chunk_size: to_u64(self.chunk_size)?,
            metadata,
            state: self.state.parse::<FileState>()?,
            created_at: self.created_at,
            committed_at: self.committed_at,
            duplicate_of: None,
        })
    }
}

fn to_i64(value: u64) -> MetadataResult<i64> {
    i64::try_from(value).map_err(|_| MetadataError::Internal(format!("{value} exceeds i64")))
}

fn to_u64(value: i64) -> MetadataResult<u64> {
    u64::try_from(value).map_err(|_| MetadataError::Internal(format!("negative column value {value}")))
}
