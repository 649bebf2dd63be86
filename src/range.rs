//! Byte range arithmetic shared by downloads and chunked uploads.
//!
//! [`parse_range`] handles the `Range` request header used by downloads,
//! [`ChunkRange::parse`] handles the `Content-Range` header a client sends
//! with each upload chunk.

use std::fmt;

use thiserror::Error;

const BYTES_PREFIX: &str = "bytes=";

/// Reasons a range header could not be turned into byte windows.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangeError {
    /// The header is not syntactically a byte range.
    #[error("malformed range: {0}")]
    Malformed(String),
    /// The header is well formed but starts beyond the end of the resource.
    #[error("range not satisfiable: {0}")]
    NotSatisfiable(String),
}

/// An inclusive window of bytes inside a resource of known size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteWindow {
    pub start: u64,
    /// Inclusive.
    pub end: u64,
    pub length: u64,
}

impl ByteWindow {
    fn new(start: u64, end: u64) -> Self {
        ByteWindow { start, end, length: end - start + 1 }
    }

    /// Value for a `Content-Range` response header.
    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, size)
    }
}

/// Parses a `Range` header value against a resource of `size` bytes.
///
/// Windows are returned in the order they appear in the header. Empty
/// range-specs (stray commas) are skipped.
///
/// ```
/// use axum_transfer::range::{parse_range, ByteWindow};
///
/// let windows = parse_range("bytes=50-149", 100).unwrap();
/// assert_eq!(windows[0].start, 50);
/// assert_eq!(windows[0].end, 99);
/// assert_eq!(windows[0].length, 50);
/// ```
pub fn parse_range(header: &str, size: u64) -> Result<Vec<ByteWindow>, RangeError> {
    let specs = header
        .strip_prefix(BYTES_PREFIX)
        .ok_or_else(|| RangeError::Malformed(header.to_string()))?;

    let mut windows = Vec::new();
    for spec in specs.split(',') {
        let spec = spec.trim();
        if spec.is_empty() {
            continue;
        }
        windows.push(parse_spec(spec, size)?);
    }
    Ok(windows)
}

fn parse_spec(spec: &str, size: u64) -> Result<ByteWindow, RangeError> {
    let (first, last) = spec
        .split_once('-')
        .ok_or_else(|| RangeError::Malformed(spec.to_string()))?;
    let (first, last) = (first.trim(), last.trim());

    let (start, end) = if first.is_empty() {
        // suffix form, the last N bytes
        let suffix = parse_offset(last, spec)?.min(size);
        if suffix == 0 {
            return Err(RangeError::Malformed(spec.to_string()));
        }
        (size - suffix, size - 1)
    } else {
        let start = parse_offset(first, spec)?;
        if start >= size {
            return Err(RangeError::NotSatisfiable(spec.to_string()));
        }
        let end = if last.is_empty() {
            size - 1
        } else {
            parse_offset(last, spec)?.min(size - 1)
        };
        (start, end)
    };

    if end < start {
        return Err(RangeError::Malformed(spec.to_string()));
    }
    Ok(ByteWindow::new(start, end))
}

fn parse_offset(token: &str, spec: &str) -> Result<u64, RangeError> {
    token
        .parse::<u64>()
        .map_err(|_| RangeError::Malformed(spec.to_string()))
}

/// Position of one upload chunk, from `Content-Range: bytes start-end/total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRange {
    pub start: u64,
    /// Inclusive.
    pub end: u64,
    pub total: u64,
}

impl ChunkRange {
    /// Parses a request `Content-Range` header.
    ///
    /// Syntax errors yield [`RangeError::Malformed`]; a range that violates
    /// `start <= end < total` yields [`RangeError::NotSatisfiable`].
    pub fn parse(header: &str) -> Result<Self, RangeError> {
        let malformed = || RangeError::Malformed(header.to_string());

        let spec = header.trim().strip_prefix("bytes").ok_or_else(malformed)?;
        if !spec.starts_with(' ') {
            return Err(malformed());
        }
        let (range, total) = spec.trim().split_once('/').ok_or_else(malformed)?;
        let (start, end) = range.split_once('-').ok_or_else(malformed)?;

        let parse = |token: &str| token.trim().parse::<u64>().map_err(|_| malformed());
        let chunk = ChunkRange {
            start: parse(start)?,
            end: parse(end)?,
            total: parse(total)?,
        };

        if chunk.start > chunk.end || chunk.end >= chunk.total {
            return Err(RangeError::NotSatisfiable(header.to_string()));
        }
        Ok(chunk)
    }

    /// Whether this chunk carries the last byte of the file.
    pub fn is_final(&self) -> bool {
        self.end == self.total - 1
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bytes {}-{}/{}", self.start, self.end, self.total)
    }
}
