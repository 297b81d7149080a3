//! Metadata store abstraction and implementations for coffer.
//!
//! This crate persists file records: a pending row per upload in flight,
//! committed rows with their length and content hash, and the lookups the
//! engine needs by id, by name and by content identity.

pub mod error;
pub mod models;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use models::FileRow;
pub use repos::FileRepo;
pub use store::{MetadataStore, SqliteStore};

use coffer_core::config::MetadataConfig;
use std::sync::Arc;

/// Create a metadata store from configuration.
pub async fn from_config(config: &MetadataConfig) -> MetadataResult<Arc<dyn MetadataStore>> {
    match config {
        MetadataConfig::Sqlite {
            path,
            query_timeout_secs,
            unique_content,
        } => {
            let store = SqliteStore::new(path, *query_timeout_secs, *unique_content).await?;
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
    }
}
