//! File record repository trait.

use crate::error::MetadataResult;
use crate::models::FileRow;
use async_trait::async_trait;
use coffer_core::{ContentHash, FileId};
use time::OffsetDateTime;

/// Repository for file records.
///
/// Lookups other than `find_by_id` only ever see committed records.
#[async_trait]
pub trait FileRepo: Send + Sync {
    /// Insert a pending record.
    ///
    /// Fails with `AlreadyExists` if the id is taken.
    async fn create_pending(&self, row: &FileRow) -> MetadataResult<FileId>;

    /// Commit a pending record with its computed identity fields.
    ///
    /// Returns the committed row, including its `commit_seq`. Fails with
    /// `NotFound` for an unknown id, `InvalidStateTransition` if the record is
    /// already committed, and `Constraint` if the identity uniqueness index
    /// already holds an equal `(container, length, content_hash)`.
    async fn finalize(
        &self,
        id: FileId,
        length: u64,
        content_hash: &ContentHash,
        committed_at: OffsetDateTime,
    ) -> MetadataResult<FileRow>;

    /// Get a record (pending or committed) by id.
    async fn find_by_id(&self, id: FileId) -> MetadataResult<FileRow>;

    /// Get the most recently committed record with this name.
    async fn find_by_container_and_name(
        &self,
        container: &str,
        filename: &str,
    ) -> MetadataResult<FileRow>;

    /// Get the earliest committed record with this identity, if any.
    async fn find_by_identity(
        &self,
        length: u64,
        content_hash: &ContentHash,
        container: &str,
        exclude: Option<FileId>,
    ) -> MetadataResult<Option<FileRow>>;

    /// Distinct container names with at least one committed record, sorted.
    async fn list_containers(&self) -> MetadataResult<Vec<String>>;

    /// Committed records in a container, in commit order.
    async fn list_files(&self, container: &str) -> MetadataResult<Vec<FileRow>>;

    /// Pending records created before `cutoff`, oldest first.
    async fn list_stale_pending(&self, cutoff: OffsetDateTime) -> MetadataResult<Vec<FileRow>>;

    /// Delete a record. Fails with `NotFound` if it does not exist.
    async fn delete(&self, id: FileId) -> MetadataResult<()>;

    /// Delete every record (pending or committed) in a container.
    async fn delete_all_in_container(&self, container: &str) -> MetadataResult<u64>;
}
