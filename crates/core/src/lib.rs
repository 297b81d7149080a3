//! Core domain types and shared logic for coffer.
//!
//! This crate defines the canonical data model used across all other crates:
//! - File identifiers and file records
//! - Chunk identity and object keys
//! - Content hashing
//! - Byte range parsing and chunk window arithmetic
//! - Configuration shared by the engine and its front ends

pub mod chunk;
pub mod config;
pub mod error;
pub mod file;
pub mod hash;
pub mod range;

pub use chunk::Chunk;
pub use error::{Error, Result};
pub use file::{FileId, FileRecord, FileState, UserMetadata};
pub use hash::{ContentHash, ContentHasher};
pub use range::{ChunkWindow, RangeSpec, ResolvedRange};

/// Default chunk size: 256 KiB
pub const DEFAULT_CHUNK_SIZE: u64 = 256 * 1024;

/// Maximum chunk size: 32 MiB
pub const MAX_CHUNK_SIZE: u64 = 32 * 1024 * 1024;

/// Minimum chunk size: 1 byte
pub const MIN_CHUNK_SIZE: u64 = 1;
