//! Container directory.
//!
//! Containers are not stored anywhere; a container exists while at least one
//! committed file names it.

use crate::error::{DestroyFailure, EngineError, EngineResult};
use crate::files::discard;
use crate::Engine;
use coffer_core::FileRecord;
use coffer_metadata::FileRepo;
use futures::StreamExt;
use serde::Serialize;

/// A container and its committed files.
#[derive(Clone, Debug, Serialize)]
pub struct Container {
    pub name: String,
    pub files: Vec<FileRecord>,
}

impl Container {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Sum of committed file lengths.
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().filter_map(|f| f.length).sum()
    }
}

/// Outcome of a successful container destruction.
#[derive(Clone, Debug, Default, Serialize)]
pub struct DestroyReport {
    pub container: String,
    pub files_deleted: usize,
    pub chunks_deleted: u64,
}

impl Engine {
    /// Names of all containers holding committed files, sorted.
    pub async fn list_containers(&self) -> EngineResult<Vec<String>> {
        Ok(self.metadata.list_containers().await?)
    }

    /// A container with its files. Unknown containers come back empty.
    pub async fn get_container(&self, name: &str) -> EngineResult<Container> {
        Ok(Container {
            name: name.to_string(),
            files: self.list_files(name).await?,
        })
    }

    /// Delete every committed file in a container, chunks before records.
    ///
    /// All files are attempted even when some fail; failures are collected
    /// into `EngineError::ContainerDestroy`.
    ///
    /// Pending records are left alone, since they may belong to an upload
    /// that is still running. Once they age out, `purge_stale_uploads`
    /// removes them together with their chunks.
    pub async fn destroy_container(&self, name: &str) -> EngineResult<DestroyReport> {
        let files = self.list_files(name).await?;
        let attempted = files.len();
        let chunks = self.chunks.as_ref();
        let metadata = self.metadata.as_ref();

        let results: Vec<_> = futures::stream::iter(files)
            .map(|file| async move { (file.id, discard(chunks, metadata, file.id).await) })
            .buffer_unordered(self.config.destroy_concurrency)
            .collect()
            .await;

        let mut report = DestroyReport {
            container: name.to_string(),
            ..Default::default()
        };
        let mut failures = Vec::new();
        for (file_id, result) in results {
            match result {
                Ok(removed) => {
                    report.files_deleted += 1;
                    report.chunks_deleted += removed;
                }
                Err(error) => {
                    tracing::warn!(
                        container = %name,
                        file_id = %file_id,
                        error = %error,
                        "Failed to delete file"
                    );
                    failures.push(DestroyFailure { file_id, error });
                }
            }
        }

        if !failures.is_empty() {
            return Err(EngineError::ContainerDestroy {
                container: name.to_string(),
                attempted,
                failures,
            });
        }

        tracing::info!(
            container = %name,
            files = report.files_deleted,
            chunks = report.chunks_deleted,
            "Container destroyed"
        );
        Ok(report)
    }
}
