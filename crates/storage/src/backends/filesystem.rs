//! Local filesystem chunk store.

use crate::error::{StorageError, StorageResult};
use crate::traits::{ChunkStore, ChunkStream};
use async_trait::async_trait;
use bytes::Bytes;
use coffer_core::chunk::{chunk_object_key, file_chunk_prefix, parse_sequence};
use coffer_core::{Chunk, FileId};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;
use uuid::Uuid;

/// Filesystem chunk store.
///
/// Layout: `<root>/chunks/<id[0..2]>/<id>/<sequence:010>`, one file per chunk.
pub struct FilesystemChunkStore {
    root: PathBuf,
}

impl FilesystemChunkStore {
    /// Create a new filesystem chunk store.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Resolve a chunk key under the root.
    ///
    /// Keys are built from `FileId`s, so only a symlinked ancestor directory
    /// can move the path outside the root. The check stats and canonicalizes
    /// paths, so it runs on the blocking pool.
    async fn resolve(&self, key: String) -> StorageResult<PathBuf> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || Self::resolve_sync(&root, &key))
            .await
            .map_err(|e| {
                StorageError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}")))
            })?
    }

    fn resolve_sync(root: &Path, key: &str) -> StorageResult<PathBuf> {
        let path = root.join(key);
        let root_canonical = root.canonicalize().map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("failed to canonicalize root: {e}"),
            ))
        })?;

        // Nearest existing ancestor (or the path itself) must resolve inside the root.
        let mut candidate = Some(path.as_path());
        while let Some(current) = candidate {
            match std::fs::symlink_metadata(current) {
                Ok(meta) => {
                    let canonical = current.canonicalize().map_err(|e| {
                        if meta.file_type().is_symlink() {
                            StorageError::InvalidKey(format!(
                                "symlink target missing or invalid: {key}"
                            ))
                        } else {
                            StorageError::Io(std::io::Error::new(
                                e.kind(),
                                format!("failed to canonicalize path: {e}"),
                            ))
                        }
                    })?;
                    if !canonical.starts_with(&root_canonical) {
                        return Err(StorageError::InvalidKey(format!(
                            "resolved path escapes storage root: {key}"
                        )));
                    }
                    break;
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(StorageError::Io(std::io::Error::new(
                        err.kind(),
                        format!("failed to stat path: {err}"),
                    )));
                }
            }
            candidate = current.parent();
        }

        Ok(path)
    }

    /// Ensure parent directory exists.
    async fn ensure_parent(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Count chunk files in a file's directory. A missing directory counts as zero.
    async fn count_in_dir(dir: &Path) -> StorageResult<u64> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StorageError::Io(e)),
        };

        let mut count = 0;
        while let Some(entry) = entries.next_entry().await? {
            // Use file_type() instead of path.is_file() to avoid following symlinks.
            if entry.file_type().await?.is_file()
                && entry
                    .file_name()
                    .to_str()
                    .and_then(parse_sequence)
                    .is_some()
            {
                count += 1;
            }
        }
        Ok(count)
    }
}

#[async_trait]
impl ChunkStore for FilesystemChunkStore {
    #[instrument(skip(self, data), fields(backend = "filesystem", size = data.len()))]
    async fn write_chunk(&self, file_id: FileId, sequence: u32, data: Bytes) -> StorageResult<()> {
        let key = chunk_object_key(file_id, sequence);
        let path = self.resolve(key.clone()).await?;
        self.ensure_parent(&path).await?;

        // Write a uniquely named temp file, fsync it, then link it into place.
        // Linking never replaces an existing chunk.
        let temp_path = path.with_file_name(format!(
            "{:010}.tmp.{}",
            sequence,
            Uuid::new_v4().simple()
        ));
        let published = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            drop(file);
            fs::hard_link(&temp_path, &path).await
        }
        .await;
        let _ = fs::remove_file(&temp_path).await;

        match published {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                // A retry with the same bytes is fine; anything else would mutate the chunk.
                let existing = fs::read(&path).await?;
                if data == existing {
                    Ok(())
                } else {
                    Err(StorageError::Conflict(format!(
                        "{key} already holds different bytes"
                    )))
                }
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn read_chunks(
        &self,
        file_id: FileId,
        from: u32,
        to: u32,
    ) -> StorageResult<ChunkStream> {
        let dir = self.resolve(file_chunk_prefix(file_id)).await?;
        if Self::count_in_dir(&dir).await? == 0 {
            return Err(StorageError::NotFound(format!("no chunks for file {file_id}")));
        }

        // Chunks are read one at a time as the consumer polls.
        let stream = async_stream::try_stream! {
            for sequence in from..=to {
                let path = dir.join(format!("{sequence:010}"));
                let data = fs::read(&path).await.map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        StorageError::NotFound(chunk_object_key(file_id, sequence))
                    } else {
                        StorageError::Io(e)
                    }
                })?;
                yield Chunk::new(file_id, sequence, Bytes::from(data));
            }
        };

        Ok(Box::pin(stream))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete_chunks(&self, file_id: FileId) -> StorageResult<u64> {
        let dir = self.resolve(file_chunk_prefix(file_id)).await?;
        let count = Self::count_in_dir(&dir).await?;

        match fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::Io(e)),
        }
        Ok(count)
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn chunk_count(&self, file_id: FileId) -> StorageResult<u64> {
        let dir = self.resolve(file_chunk_prefix(file_id)).await?;
        Self::count_in_dir(&dir).await
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn health_check(&self) -> StorageResult<()> {
        let metadata = fs::metadata(&self.root).await.map_err(|e| {
            StorageError::Io(std::io::Error::new(
                e.kind(),
                format!("storage root not accessible: {e}"),
            ))
        })?;

        if !metadata.is_dir() {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotADirectory,
                format!("storage root is not a directory: {:?}", self.root),
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    async fn store() -> (tempfile::TempDir, FilesystemChunkStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemChunkStore::new(dir.path()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_write_read_roundtrip() {
        let (_dir, store) = store().await;
        let id = FileId::new();

        for (seq, data) in [(0, "aaa"), (1, "bbb"), (2, "c")] {
            store.write_chunk(id, seq, Bytes::from(data)).await.unwrap();
        }

        let chunks: Vec<Chunk> = store
            .read_chunks(id, 0, 2)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        let seqs: Vec<_> = chunks.iter().map(|c| c.sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert_eq!(chunks[2].data, Bytes::from("c"));

        // Restartable: a fresh call reads the window again.
        let window: Vec<Chunk> = store
            .read_chunks(id, 1, 1)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].data, Bytes::from("bbb"));
    }

    #[tokio::test]
    async fn test_write_is_idempotent() {
        let (_dir, store) = store().await;
        let id = FileId::new();

        store.write_chunk(id, 0, Bytes::from("same")).await.unwrap();
        store.write_chunk(id, 0, Bytes::from("same")).await.unwrap();

        assert_eq!(store.chunk_count(id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_read_missing_file_is_not_found() {
        let (_dir, store) = store().await;
        match store.read_chunks(FileId::new(), 0, 0).await {
            Err(StorageError::NotFound(_)) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
            Ok(_) => panic!("expected NotFound"),
        }
    }

    #[tokio::test]
    async fn test_gap_in_window_yields_error_item() {
        let (_dir, store) = store().await;
        let id = FileId::new();
        store.write_chunk(id, 0, Bytes::from("a")).await.unwrap();
        store.write_chunk(id, 2, Bytes::from("c")).await.unwrap();

        let result: StorageResult<Vec<Chunk>> =
            store.read_chunks(id, 0, 2).await.unwrap().try_collect().await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_chunks_counts_and_is_safe_when_empty() {
        let (_dir, store) = store().await;
        let id = FileId::new();
        for seq in 0..4 {
            store.write_chunk(id, seq, Bytes::from("x")).await.unwrap();
        }

        assert_eq!(store.delete_chunks(id).await.unwrap(), 4);
        assert_eq!(store.chunk_count(id).await.unwrap(), 0);
        assert_eq!(store.delete_chunks(id).await.unwrap(), 0);
        assert!(store.read_chunks(id, 0, 3).await.is_err());
    }

    #[tokio::test]
    async fn test_files_do_not_interfere() {
        let (_dir, store) = store().await;
        let (a, b) = (FileId::new(), FileId::new());
        store.write_chunk(a, 0, Bytes::from("a")).await.unwrap();
        store.write_chunk(b, 0, Bytes::from("b")).await.unwrap();

        store.delete_chunks(a).await.unwrap();
        assert_eq!(store.chunk_count(b).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_rewrite_with_different_bytes_conflicts() {
        let (_dir, store) = store().await;
        let id = FileId::new();
        store.write_chunk(id, 0, Bytes::from("original")).await.unwrap();

        let err = store
            .write_chunk(id, 0, Bytes::from("TAMPERED"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)), "{err:?}");

        let chunks: Vec<Chunk> = store
            .read_chunks(id, 0, 0)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(chunks[0].data, Bytes::from("original"));

        // No temp files are left next to the chunk.
        let dir = dir_of(&store, id);
        assert_eq!(std::fs::read_dir(dir).unwrap().count(), 1);
    }

    fn dir_of(store: &FilesystemChunkStore, id: FileId) -> PathBuf {
        store.root.join(file_chunk_prefix(id))
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_symlinked_ancestor_rejected() {
        use std::os::unix::fs::symlink;

        let (dir, store) = store().await;
        let outside = tempfile::tempdir().unwrap();
        let id = FileId::new();

        // root/chunks -> outside directory
        symlink(outside.path(), dir.path().join("chunks")).unwrap();

        let result = store.write_chunk(id, 0, Bytes::from("data")).await;
        match result {
            Err(StorageError::InvalidKey(msg)) => assert!(msg.contains("escapes storage root")),
            other => panic!("expected InvalidKey error, got: {other:?}"),
        }
        assert!(std::fs::read_dir(outside.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_health_check() {
        let (_dir, store) = store().await;
        store.health_check().await.unwrap();
    }
}
