//! Chunk types and object keys.

use crate::file::FileId;
use bytes::Bytes;
use std::fmt;

/// One fragment of a file's byte stream.
#[derive(Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Owning file.
    pub file_id: FileId,
    /// Zero-based position within the file.
    pub sequence: u32,
    /// Raw bytes; at most the file's chunk size (the last chunk may be shorter).
    pub data: Bytes,
}

impl Chunk {
    /// Create a new chunk.
    pub fn new(file_id: FileId, sequence: u32, data: Bytes) -> Self {
        Self {
            file_id,
            sequence,
            data,
        }
    }

    /// Get the chunk size.
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    /// Object store key for this chunk.
    pub fn object_key(&self) -> String {
        chunk_object_key(self.file_id, self.sequence)
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("file_id", &self.file_id)
            .field("sequence", &self.sequence)
            .field("size", &self.data.len())
            .finish()
    }
}

/// Key prefix holding all chunks of one file.
///
/// Files are fanned out by the first two hex characters of their id.
pub fn file_chunk_prefix(file_id: FileId) -> String {
    let id = file_id.to_string();
    format!("chunks/{}/{}", &id[..2], id)
}

/// Object store key for a single chunk. Sequence numbers are zero padded so
/// that lexical order equals sequence order.
pub fn chunk_object_key(file_id: FileId, sequence: u32) -> String {
    format!("{}/{:010}", file_chunk_prefix(file_id), sequence)
}

/// Parse the sequence number back out of a chunk key's final component.
pub fn parse_sequence(name: &str) -> Option<u32> {
    if name.len() != 10 || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}
