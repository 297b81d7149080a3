//! Prometheus metrics for the engine pipelines.
//!
//! Metrics live in a process-wide registry; `register_metrics` is called by
//! `Engine::new` and is idempotent. `gather_text` renders the registry in the
//! Prometheus text exposition format for whatever front end exports it.

use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, Registry, TextEncoder};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Upload metrics
pub static UPLOADS_COMMITTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "coffer_uploads_committed_total",
        "Total number of uploads committed as new files",
    )
    .expect("metric creation failed")
});

pub static UPLOADS_DEDUPLICATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "coffer_uploads_deduplicated_total",
        "Total number of uploads resolved to an existing identical file",
    )
    .expect("metric creation failed")
});

pub static UPLOADS_FAILED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "coffer_uploads_failed_total",
        "Total number of uploads aborted and cleaned up",
    )
    .expect("metric creation failed")
});

pub static BYTES_UPLOADED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "coffer_bytes_uploaded_total",
        "Total bytes consumed from upload streams",
    )
    .expect("metric creation failed")
});

pub static CHUNKS_WRITTEN: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "coffer_chunks_written_total",
        "Total number of chunks persisted",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "coffer_upload_duration_seconds",
            "Time taken from upload start to commit or dedup",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
    )
    .expect("metric creation failed")
});

// Download metrics
pub static BYTES_DOWNLOADED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "coffer_bytes_downloaded_total",
        "Total bytes emitted by download streams",
    )
    .expect("metric creation failed")
});

// Deletion metrics
pub static FILES_DELETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "coffer_files_deleted_total",
        "Total number of file records removed with their chunks",
    )
    .expect("metric creation failed")
});

static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(UPLOADS_COMMITTED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOADS_DEDUPLICATED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOADS_FAILED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BYTES_UPLOADED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CHUNKS_WRITTEN.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(UPLOAD_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BYTES_DOWNLOADED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(FILES_DELETED.clone()))
            .expect("metric registration failed");
    });
}

/// Render all registered metrics in the text exposition format.
pub fn gather_text() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_is_idempotent_and_renders() {
        register_metrics();
        register_metrics();
        UPLOADS_COMMITTED.inc();
        let text = gather_text().unwrap();
        assert!(text.contains("coffer_uploads_committed_total"));
        assert!(text.contains("coffer_upload_duration_seconds"));
    }
}
