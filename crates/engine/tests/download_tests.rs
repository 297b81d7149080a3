//! Download pipeline integration tests.

mod common;

use bytes::Bytes;
use coffer_core::config::{EngineConfig, ThrottleConfig};
use coffer_core::{FileId, RangeSpec};
use coffer_engine::{DownloadTarget, EngineError, ErrorKind, UploadRequest};
use coffer_storage::{ChunkStore, MemoryChunkStore};
use common::{TestEngine, body, pattern, read_all};
use futures::{StreamExt, TryStreamExt};
use http::StatusCode;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn range(spec: &str) -> Option<RangeSpec> {
    Some(RangeSpec::parse(spec).unwrap())
}

#[tokio::test]
async fn test_range_inside_file_returns_exact_bytes() {
    let t = TestEngine::new(256).await;
    let content = pattern(1000);
    let record = t
        .engine
        .upload(UploadRequest::new("c1", "f"), body(&content, 1000))
        .await
        .unwrap();

    let download = t
        .engine
        .download(record.id.into(), range("bytes=300-699"))
        .await
        .unwrap();
    assert_eq!(download.content_length(), 400);
    assert_eq!(download.content_range().as_deref(), Some("bytes 300-699/1000"));
    assert_eq!(download.status_code(), StatusCode::PARTIAL_CONTENT);

    let bytes = read_all(download).await.unwrap();
    assert_eq!(bytes.len(), 400);
    assert_eq!(bytes, content[300..700]);
}

#[tokio::test]
async fn test_open_range_streams_chunk_aligned_segments() {
    let t = TestEngine::new(256 * 1024).await;
    let content = pattern(1024 * 1024);
    let record = t
        .engine
        .upload(UploadRequest::new("c1", "big"), body(&content, 64 * 1024))
        .await
        .unwrap();

    let download = t
        .engine
        .download(record.id.into(), range("bytes=0-"))
        .await
        .unwrap();
    assert_eq!(download.content_length(), 1024 * 1024);
    assert_eq!(download.content_range(), None);

    let segments: Vec<Bytes> = download.into_stream().try_collect().await.unwrap();
    assert_eq!(segments.len(), 4);
    assert!(segments.iter().all(|s| s.len() == 256 * 1024));
    assert_eq!(segments.concat(), content);
}

#[tokio::test]
async fn test_every_range_matches_source() {
    let t = TestEngine::new(7).await;
    let content = pattern(50);
    let record = t
        .engine
        .upload(UploadRequest::new("c1", "small"), body(&content, 9))
        .await
        .unwrap();

    for start in [0usize, 1, 6, 7, 8, 20, 49] {
        for end in [start, start + 1, 13, 27, 48, 49, 80] {
            if end < start {
                continue;
            }
            let spec = format!("bytes={start}-{end}");
            let download = t
                .engine
                .download(record.id.into(), range(&spec))
                .await
                .unwrap();
            let bytes = read_all(download).await.unwrap();
            let clamped = end.min(49);
            assert_eq!(bytes, content[start..=clamped], "{spec}");
        }
    }
}

#[tokio::test]
async fn test_suffix_range() {
    let t = TestEngine::new(16).await;
    let content = pattern(100);
    let record = t
        .engine
        .upload(UploadRequest::new("c1", "tail"), body(&content, 100))
        .await
        .unwrap();

    let download = t
        .engine
        .download(record.id.into(), range("bytes=-10"))
        .await
        .unwrap();
    assert_eq!(download.content_range().as_deref(), Some("bytes 90-99/100"));
    assert_eq!(read_all(download).await.unwrap(), content[90..]);
}

#[tokio::test]
async fn test_unsatisfiable_range() {
    let t = TestEngine::new(16).await;
    let record = t
        .engine
        .upload(UploadRequest::new("c1", "f"), body(&pattern(10), 10))
        .await
        .unwrap();

    for spec in ["bytes=10-20", "bytes=-0"] {
        let err = t
            .engine
            .download(record.id.into(), range(spec))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRequest, "{spec}");
        assert_eq!(err.status_code(), StatusCode::RANGE_NOT_SATISFIABLE, "{spec}");
    }
}

#[tokio::test]
async fn test_nonexistent_file_is_not_found() {
    let t = TestEngine::new(16).await;

    let err = t
        .engine
        .download(DownloadTarget::Id(FileId::new()), None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(err.status_code(), StatusCode::NOT_FOUND);

    let err = t
        .engine
        .download(DownloadTarget::name("c1", "missing"), None)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_download_by_name_picks_newest_commit() {
    let t = TestEngine::new(16).await;
    t.engine
        .upload(UploadRequest::new("c1", "notes"), body(b"first version", 64))
        .await
        .unwrap();
    t.engine
        .upload(UploadRequest::new("c1", "notes"), body(b"second version", 64))
        .await
        .unwrap();

    let download = t
        .engine
        .download(DownloadTarget::name("c1", "notes"), None)
        .await
        .unwrap();
    assert_eq!(download.content_disposition(), "attachment; filename=\"notes\"");
    assert_eq!(read_all(download).await.unwrap(), b"second version");
}

#[tokio::test]
async fn test_missing_chunks_fail_before_streaming() {
    let memory = MemoryChunkStore::new();
    let t = TestEngine::with_store(Arc::new(memory.clone()), common::config(8), true).await;
    let record = t
        .engine
        .upload(UploadRequest::new("c1", "f"), body(&pattern(40), 40))
        .await
        .unwrap();

    memory.delete_chunks(record.id).await.unwrap();
    let err = t.engine.download(record.id.into(), None).await.unwrap_err();
    assert!(err.is_not_found(), "{err:?}");
}

#[tokio::test]
async fn test_delete_during_read_aborts_stream() {
    let memory = MemoryChunkStore::new();
    let t = TestEngine::with_store(Arc::new(memory.clone()), common::config(8), true).await;
    let record = t
        .engine
        .upload(UploadRequest::new("c1", "f"), body(&pattern(40), 40))
        .await
        .unwrap();

    let mut stream = t
        .engine
        .download(record.id.into(), None)
        .await
        .unwrap()
        .into_stream();
    assert_eq!(stream.next().await.unwrap().unwrap().len(), 8);

    t.engine.remove_file_by_id(record.id).await.unwrap();

    let mut saw_error = false;
    while let Some(item) = stream.next().await {
        if let Err(err) = item {
            assert!(err.is_not_found(), "{err:?}");
            saw_error = true;
            break;
        }
    }
    assert!(saw_error, "a truncated stream must end with an error");
}

#[tokio::test]
async fn test_pending_file_is_not_downloadable() {
    let t = TestEngine::new(8).await;
    let record = coffer_core::FileRecord::pending("c1", "wip", 8, Default::default());
    let row = coffer_metadata::FileRow::from_record(&record).unwrap();
    coffer_metadata::FileRepo::create_pending(t.metadata.as_ref(), &row)
        .await
        .unwrap();

    let err = t
        .engine
        .download(record.id.into(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)), "{err:?}");
}

#[tokio::test]
async fn test_throttled_download_is_delayed_but_complete() {
    let config = EngineConfig {
        chunk_size: 4096,
        throttle: ThrottleConfig {
            bytes_per_second: NonZeroU32::new(16 * 1024),
            burst_bytes: NonZeroU32::new(4096),
        },
        ..Default::default()
    };
    let t = TestEngine::with_store(Arc::new(MemoryChunkStore::new()), config, true).await;
    let content = pattern(12 * 1024);
    let record = t
        .engine
        .upload(UploadRequest::new("c1", "slow"), body(&content, 4096))
        .await
        .unwrap();

    let started = Instant::now();
    let download = t.engine.download(record.id.into(), None).await.unwrap();
    let bytes = read_all(download).await.unwrap();
    let elapsed = started.elapsed();

    // 4 KiB burst is immediate, the other 8 KiB need ~0.5s at 16 KiB/s.
    assert_eq!(bytes, content);
    assert!(elapsed >= Duration::from_millis(400), "elapsed {elapsed:?}");
}

#[tokio::test]
async fn test_dropping_stream_stops_reading() {
    let t = TestEngine::new(4).await;
    let record = t
        .engine
        .upload(UploadRequest::new("c1", "f"), body(&pattern(400), 400))
        .await
        .unwrap();

    let mut stream = t
        .engine
        .download(record.id.into(), None)
        .await
        .unwrap()
        .into_stream();
    assert!(stream.next().await.unwrap().is_ok());
    drop(stream);

    // The file is untouched and can be read again from the start.
    let download = t.engine.download(record.id.into(), None).await.unwrap();
    assert_eq!(read_all(download).await.unwrap(), pattern(400));
}
