//! Metadata store test utilities.

use coffer_core::{ContentHash, FileRecord, UserMetadata};
use coffer_metadata::{FileRepo, FileRow, MetadataResult, MetadataStore, SqliteStore};
use std::sync::Arc;
use tempfile::TempDir;
use time::OffsetDateTime;

/// A test metadata store wrapper that cleans up on drop.
pub struct TestMetadata {
    pub store: Arc<SqliteStore>,
    _temp_dir: TempDir,
}

impl TestMetadata {
    /// Create a file-backed SQLite store with the identity constraint enforced.
    pub async fn new() -> MetadataResult<Self> {
        Self::with_unique_content(true).await
    }

    pub async fn with_unique_content(unique_content: bool) -> MetadataResult<Self> {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let db_path = temp_dir.path().join("test.db");
        let store = SqliteStore::new(&db_path, None, unique_content).await?;

        Ok(Self {
            store: Arc::new(store),
            _temp_dir: temp_dir,
        })
    }

    /// Get the store as a trait object.
    #[allow(dead_code)]
    pub fn dyn_store(&self) -> Arc<dyn MetadataStore> {
        self.store.clone()
    }

    /// Insert a pending row for a fresh record.
    pub async fn pending(&self, container: &str, filename: &str) -> FileRow {
        let record = FileRecord::pending(container, filename, 256, UserMetadata::new());
        let row = FileRow::from_record(&record).expect("row");
        self.store.create_pending(&row).await.expect("create_pending");
        row
    }

    /// Insert and commit a record holding `content`.
    pub async fn committed(&self, container: &str, filename: &str, content: &[u8]) -> FileRow {
        let row = self.pending(container, filename).await;
        self.store
            .finalize(
                row.id(),
                content.len() as u64,
                &ContentHash::compute(content),
                OffsetDateTime::now_utc(),
            )
            .await
            .expect("finalize")
    }
}
