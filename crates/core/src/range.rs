//! Byte range requests and chunk window arithmetic.
//!
//! Ranges follow RFC 7233 single-range syntax (`bytes=<start>-<end>`,
//! `bytes=<start>-`, `bytes=-<suffix>`), with inclusive bounds.

use bytes::Bytes;
use std::fmt;
use std::str::FromStr;

const UNIT_PREFIX: &str = "bytes=";

/// A parsed, not yet resolved, range expression.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeSpec {
    /// `bytes=start-end`, both inclusive.
    Bounded { start: u64, end: u64 },
    /// `bytes=start-`, through the end of the file.
    From { start: u64 },
    /// `bytes=-n`, the last `n` bytes.
    Suffix { len: u64 },
}

impl RangeSpec {
    /// Parse a `Range` header value.
    pub fn parse(s: &str) -> crate::Result<Self> {
        let s = s.trim();
        let spec = s
            .strip_prefix(UNIT_PREFIX)
            .ok_or_else(|| crate::Error::InvalidRange(format!("expected bytes unit: {s}")))?
            .trim();

        if spec.contains(',') {
            return Err(crate::Error::InvalidRange(format!(
                "multiple ranges are not supported: {s}"
            )));
        }

        let (start, end) = spec
            .split_once('-')
            .ok_or_else(|| crate::Error::InvalidRange(format!("missing '-': {s}")))?;
        let (start, end) = (start.trim(), end.trim());

        let parse = |v: &str| {
            v.parse::<u64>()
                .map_err(|e| crate::Error::InvalidRange(format!("{v}: {e}")))
        };

        match (start.is_empty(), end.is_empty()) {
            (true, true) => Err(crate::Error::InvalidRange(format!("empty range: {s}"))),
            (true, false) => Ok(Self::Suffix { len: parse(end)? }),
            (false, true) => Ok(Self::From {
                start: parse(start)?,
            }),
            (false, false) => {
                let (start, end) = (parse(start)?, parse(end)?);
                if end < start {
                    return Err(crate::Error::InvalidRange(format!(
                        "end ({end}) < start ({start})"
                    )));
                }
                Ok(Self::Bounded { start, end })
            }
        }
    }

    /// Resolve against a file length, clamping the end to `length - 1`.
    pub fn resolve(&self, length: u64) -> crate::Result<ResolvedRange> {
        let unsatisfiable = || crate::Error::RangeNotSatisfiable { length };
        // An empty suffix selects nothing, whatever the length.
        if length == 0 || matches!(self, Self::Suffix { len: 0 }) {
            return Err(unsatisfiable());
        }
        let last = length - 1;
        let (start, end) = match *self {
            Self::Bounded { start, end } => (start, end.min(last)),
            Self::From { start } => (start, last),
            Self::Suffix { len } => (length.saturating_sub(len), last),
        };
        if start > last {
            return Err(unsatisfiable());
        }
        Ok(ResolvedRange {
            start,
            len: end - start + 1,
            total: length,
        })
    }
}

impl FromStr for RangeSpec {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for RangeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bounded { start, end } => write!(f, "{UNIT_PREFIX}{start}-{end}"),
            Self::From { start } => write!(f, "{UNIT_PREFIX}{start}-"),
            Self::Suffix { len } => write!(f, "{UNIT_PREFIX}-{len}"),
        }
    }
}

/// A concrete byte window `[start, start + len)` of a file of `total` bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedRange {
    pub start: u64,
    pub len: u64,
    pub total: u64,
}

impl ResolvedRange {
    /// The whole file. Empty files resolve to an empty window.
    pub fn full(total: u64) -> Self {
        Self {
            start: 0,
            len: total,
            total,
        }
    }

    /// Inclusive end position, `None` for an empty window.
    pub fn end(&self) -> Option<u64> {
        (self.len > 0).then(|| self.start + self.len - 1)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether this window is a strict subset of the file.
    pub fn is_partial(&self) -> bool {
        self.len != self.total
    }

    /// `Content-Range` value, e.g. `bytes 300-699/1000`.
    pub fn content_range(&self) -> String {
        match self.end() {
            Some(end) => format!("bytes {}-{}/{}", self.start, end, self.total),
            None => format!("bytes */{}", self.total),
        }
    }

    /// Chunks covering this window for the given chunk size.
    pub fn chunk_window(&self, chunk_size: u64) -> Option<ChunkWindow> {
        let end = self.end()?;
        Some(ChunkWindow {
            first: sequence_of(self.start / chunk_size),
            last: sequence_of(end / chunk_size),
            head_skip: (self.start % chunk_size) as usize,
            tail_keep: (end % chunk_size) as usize + 1,
        })
    }
}

fn sequence_of(index: u64) -> u32 {
    u32::try_from(index).unwrap_or(u32::MAX)
}

/// The chunk sequence span of a range plus the trimming applied at its edges.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkWindow {
    /// First chunk sequence, inclusive.
    pub first: u32,
    /// Last chunk sequence, inclusive.
    pub last: u32,
    /// Bytes dropped from the front of the first chunk.
    pub head_skip: usize,
    /// Bytes kept from the front of the last chunk.
    pub tail_keep: usize,
}

impl ChunkWindow {
    /// Trim a chunk's bytes to the part that falls inside the window.
    pub fn slice(&self, sequence: u32, data: &Bytes) -> Bytes {
        let hi = if sequence == self.last {
            self.tail_keep.min(data.len())
        } else {
            data.len()
        };
        let lo = if sequence == self.first {
            self.head_skip.min(hi)
        } else {
            0
        };
        data.slice(lo..hi)
    }

    /// Number of chunks in the window.
    pub fn chunk_count(&self) -> u32 {
        self.last - self.first + 1
    }
}
