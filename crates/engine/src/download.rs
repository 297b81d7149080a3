//! Download pipeline.

use crate::error::{EngineError, EngineResult};
use crate::{Engine, metrics, throttle};
use bytes::Bytes;
use coffer_core::{ChunkWindow, FileId, FileRecord, RangeSpec, ResolvedRange};
use coffer_metadata::FileRepo;
use coffer_storage::ChunkStream;
use futures::{Stream, StreamExt};
use http::StatusCode;
use std::fmt;
use std::pin::Pin;

/// Outgoing bytes of a download. Errors arrive as items; a stream that ends
/// without one delivered every requested byte.
pub type ByteStream = Pin<Box<dyn Stream<Item = EngineResult<Bytes>> + Send>>;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// How the file to download is identified.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DownloadTarget {
    Id(FileId),
    /// The most recently committed file with this name.
    Name { container: String, filename: String },
}

impl DownloadTarget {
    pub fn name(container: impl Into<String>, filename: impl Into<String>) -> Self {
        Self::Name {
            container: container.into(),
            filename: filename.into(),
        }
    }
}

impl From<FileId> for DownloadTarget {
    fn from(id: FileId) -> Self {
        Self::Id(id)
    }
}

impl fmt::Display for DownloadTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Name {
                container,
                filename,
            } => write!(f, "{container}/{filename}"),
        }
    }
}

/// A resolved download: the record, the byte window, and the bytes themselves.
pub struct Download {
    pub record: FileRecord,
    pub range: ResolvedRange,
    pub stream: ByteStream,
}

impl Download {
    /// Number of bytes the stream will yield.
    pub fn content_length(&self) -> u64 {
        self.range.len
    }

    /// `Content-Range` value for partial responses.
    pub fn content_range(&self) -> Option<String> {
        self.range.is_partial().then(|| self.range.content_range())
    }

    pub fn content_type(&self) -> &str {
        self.record.mimetype().unwrap_or(DEFAULT_CONTENT_TYPE)
    }

    pub fn content_disposition(&self) -> String {
        let filename = self.record.filename.replace(['"', '\\'], "_");
        format!("attachment; filename=\"{filename}\"")
    }

    /// 206 for a partial range, 200 otherwise.
    pub fn status_code(&self) -> StatusCode {
        if self.range.is_partial() {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        }
    }

    pub fn into_stream(self) -> ByteStream {
        self.stream
    }
}

impl fmt::Debug for Download {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Download")
            .field("record", &self.record)
            .field("range", &self.range)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Resolve a committed file and open a stream over `range` (the whole file
    /// when `None`).
    ///
    /// Everything that can fail before the first byte (missing file, pending
    /// upload, unsatisfiable range, missing chunks) fails here rather than in
    /// the stream.
    pub async fn download(
        &self,
        target: DownloadTarget,
        range: Option<RangeSpec>,
    ) -> EngineResult<Download> {
        let record = self.resolve_committed(&target).await?;
        let length = record.length.ok_or_else(|| {
            EngineError::Internal(format!("committed file {} has no length", record.id))
        })?;

        let range = match range {
            Some(spec) => spec.resolve(length)?,
            None => ResolvedRange::full(length),
        };

        let stream: ByteStream = match range.chunk_window(record.chunk_size) {
            None => Box::pin(futures::stream::empty()),
            Some(window) => {
                let chunks = self
                    .chunks
                    .read_chunks(record.id, window.first, window.last)
                    .await?;
                assemble(chunks, window, record.id, range.len)
            }
        };

        tracing::debug!(
            file_id = %record.id,
            start = range.start,
            len = range.len,
            total = range.total,
            "Download opened"
        );

        Ok(Download {
            stream: throttle::throttled(stream, &self.config.throttle),
            record,
            range,
        })
    }

    async fn resolve_committed(&self, target: &DownloadTarget) -> EngineResult<FileRecord> {
        let row = match target {
            DownloadTarget::Id(id) => self.metadata.find_by_id(*id).await?,
            DownloadTarget::Name {
                container,
                filename,
            } => {
                self.metadata
                    .find_by_container_and_name(container, filename)
                    .await?
            }
        };
        let record = row.into_record()?;
        if !record.is_committed() {
            return Err(EngineError::NotFound(format!(
                "file {target} is still uploading"
            )));
        }
        Ok(record)
    }
}

/// Trim the window's edge chunks and check nothing went missing on the way.
fn assemble(chunks: ChunkStream, window: ChunkWindow, file_id: FileId, expected: u64) -> ByteStream {
    let stream = async_stream::try_stream! {
        let mut chunks = chunks;
        let mut next_sequence = window.first;
        let mut emitted = 0u64;

        while let Some(chunk) = chunks.next().await {
            let chunk = chunk?;
            if chunk.sequence != next_sequence {
                Err::<(), _>(EngineError::Internal(format!(
                    "file {file_id}: expected chunk {next_sequence}, got {}",
                    chunk.sequence
                )))?;
            }
            next_sequence = next_sequence.saturating_add(1);

            let piece = window.slice(chunk.sequence, &chunk.data);
            if piece.is_empty() {
                continue;
            }
            emitted += piece.len() as u64;
            metrics::BYTES_DOWNLOADED.inc_by(piece.len() as u64);
            yield piece;
        }

        if emitted != expected {
            Err::<(), _>(EngineError::Truncated {
                file_id,
                expected,
                actual: emitted,
            })?;
        }
    };
    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use coffer_core::{Chunk, UserMetadata};
    use coffer_storage::StorageError;
    use futures::TryStreamExt;
    use serde_json::json;

    fn chunk_stream(file_id: FileId, chunks: Vec<(u32, &'static [u8])>) -> ChunkStream {
        let items: Vec<Result<Chunk, StorageError>> = chunks
            .into_iter()
            .map(|(seq, data)| Ok(Chunk::new(file_id, seq, Bytes::from_static(data))))
            .collect();
        Box::pin(futures::stream::iter(items))
    }

    #[tokio::test]
    async fn test_assemble_trims_edges() {
        let id = FileId::new();
        let range = RangeSpec::parse("bytes=2-9").unwrap().resolve(12).unwrap();
        let window = range.chunk_window(4).unwrap();
        let chunks = chunk_stream(id, vec![(0, &b"abcd"[..]), (1, &b"efgh"[..]), (2, &b"ijkl"[..])]);

        let out: Vec<Bytes> = assemble(chunks, window, id, range.len)
            .try_collect()
            .await
            .unwrap();
        assert_eq!(out.concat(), b"cdefghij");
    }

    #[tokio::test]
    async fn test_assemble_short_read_is_an_error_item() {
        let id = FileId::new();
        let window = ResolvedRange::full(12).chunk_window(4).unwrap();
        let chunks = chunk_stream(id, vec![(0, &b"abcd"[..]), (1, &b"efgh"[..])]);

        let mut stream = assemble(chunks, window, id, 12);
        assert!(stream.next().await.unwrap().is_ok());
        assert!(stream.next().await.unwrap().is_ok());
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            EngineError::Truncated {
                expected: 12,
                actual: 8,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_assemble_rejects_out_of_order_chunks() {
        let id = FileId::new();
        let window = ResolvedRange::full(8).chunk_window(4).unwrap();
        let chunks = chunk_stream(id, vec![(1, &b"efgh"[..]), (0, &b"abcd"[..])]);

        let result: EngineResult<Vec<Bytes>> =
            assemble(chunks, window, id, 8).try_collect().await;
        assert!(matches!(result, Err(EngineError::Internal(_))));
    }

    #[test]
    fn test_response_metadata() {
        let mut metadata = UserMetadata::new();
        metadata.insert("mimetype".into(), json!("text/csv"));
        let mut record = FileRecord::pending("c1", "re\"port.csv", 4, metadata);
        record.length = Some(10);

        let partial = Download {
            record: record.clone(),
            range: RangeSpec::parse("bytes=0-3").unwrap().resolve(10).unwrap(),
            stream: Box::pin(futures::stream::empty()),
        };
        assert_eq!(partial.content_length(), 4);
        assert_eq!(partial.content_range().as_deref(), Some("bytes 0-3/10"));
        assert_eq!(partial.content_type(), "text/csv");
        assert_eq!(
            partial.content_disposition(),
            "attachment; filename=\"re_port.csv\""
        );
        assert_eq!(partial.status_code(), StatusCode::PARTIAL_CONTENT);

        record.metadata.clear();
        let full = Download {
            record,
            range: ResolvedRange::full(10),
            stream: Box::pin(futures::stream::empty()),
        };
        assert_eq!(full.content_range(), None);
        assert_eq!(full.content_type(), "application/octet-stream");
        assert_eq!(full.status_code(), StatusCode::OK);
    }

    #[test]
    fn test_target_display() {
        assert_eq!(DownloadTarget::name("c1", "a.txt").to_string(), "c1/a.txt");
        let id = FileId::new();
        assert_eq!(DownloadTarget::from(id).to_string(), id.to_string());
    }
}
