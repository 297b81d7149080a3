//! File identifiers and file records.

use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// Caller-supplied metadata attached to a file (mimetype, original filename, ...).
///
/// Values are strings or JSON primitives. The engine never interprets them
/// except for the optional `mimetype` key.
pub type UserMetadata = BTreeMap<String, serde_json::Value>;

/// Metadata key holding the file's media type.
pub const MIMETYPE_KEY: &str = "mimetype";

/// Unique identifier for a stored file.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(Uuid);

impl FileId {
    /// Generate a new random file ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Parse from a string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidFileId(format!("{s}: {e}")))
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for FileId {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", self.0)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a file record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileState {
    /// Upload in progress; length and content hash are unknown.
    Pending,
    /// All chunks written and the identity fields are set.
    Committed,
}

impl FileState {
    /// Database/string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Committed => "committed",
        }
    }
}

impl FromStr for FileState {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "committed" => Ok(Self::Committed),
            other => Err(crate::Error::InvalidState(other.to_string())),
        }
    }
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stored object: the metadata record that owns a sequence of chunks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    pub container: String,
    pub filename: String,
    /// Total byte length, known once the upload stream is consumed.
    pub length: Option<u64>,
    /// Digest of the full byte stream, known once the upload stream is consumed.
    pub content_hash: Option<ContentHash>,
    /// Bytes per chunk, fixed at creation.
    pub chunk_size: u64,
    #[serde(default)]
    pub metadata: UserMetadata,
    pub state: FileState,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub committed_at: Option<OffsetDateTime>,
    /// Set on upload responses that resolved to an existing identical file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duplicate_of: Option<FileId>,
}

impl FileRecord {
    /// Create a pending record with a fresh id.
    pub fn pending(
        container: impl Into<String>,
        filename: impl Into<String>,
        chunk_size: u64,
        metadata: UserMetadata,
    ) -> Self {
        Self {
            id: FileId::new(),
            container: container.into(),
            filename: filename.into(),
            length: None,
            content_hash: None,
            chunk_size,
            metadata,
            state: FileState::Pending,
            created_at: OffsetDateTime::now_utc(),
            committed_at: None,
            duplicate_of: None,
        }
    }

    /// Whether the record has been finalized.
    pub fn is_committed(&self) -> bool {
        self.state == FileState::Committed
    }

    /// Number of chunks a committed record owns (`ceil(length / chunk_size)`).
    pub fn expected_chunk_count(&self) -> Option<u64> {
        self.length.map(|len| len.div_ceil(self.chunk_size))
    }

    /// Media type recorded in user metadata, if any.
    pub fn mimetype(&self) -> Option<&str> {
        self.metadata.get(MIMETYPE_KEY).and_then(|v| v.as_str())
    }

    /// Mark this record as a reference to itself returned in place of a redundant upload.
    pub fn into_duplicate_reference(mut self) -> Self {
        self.duplicate_of = Some(self.id);
        self
    }
}
