//! # axum-transfer
//!
//! Chunked uploads and HTTP range downloads for [`axum`][1].
//!
//! Downloads go through the [`Ranged`] responder, which works over any body
//! implementing the [`RangeBody`] trait. Any type implementing both
//! [`AsyncRead`] and [`AsyncSeekStart`] can be used with the [`KnownSize`]
//! adapter struct, with special cased support for [`tokio::fs::File`].
//!
//! Uploads go through [`upload::UploadStore`], which appends
//! `Content-Range` chunks to a temporary file and renames it into place
//! once the last byte has arrived.
//!
//! ```
//! use axum::Router;
//! use axum::routing::get;
//! use axum::http::HeaderMap;
//!
//! use axum_transfer::Ranged;
//! use axum_transfer::KnownSize;
//!
//! async fn file(headers: HeaderMap) -> axum::response::Response {
//!     let range = headers
//!         .get("range")
//!         .and_then(|value| value.to_str().ok())
//!         .map(str::to_string);
//!     let body = KnownSize::open("document.txt").await.unwrap();
//!     axum::response::IntoResponse::into_response(Ranged::new(range, body, "document.txt"))
//! }
//!
//! let _app = Router::<()>::new().route("/", get(file));
//! ```
//!
//! [1]: https://docs.rs/axum

pub mod config;
pub mod error;
mod file;
pub mod lock;
pub mod range;
pub mod server;
mod stream;
pub mod upload;

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum_extra::TypedHeader;
use axum_extra::headers::{AcceptRanges, ContentLength, ContentRange, ContentType, ETag, HeaderMapExt, LastModified};
use tokio::io::{AsyncRead, AsyncSeek};

pub use error::TransferError;
pub use file::{sanitize_filename, KnownSize};
pub use range::{parse_range, ByteWindow, ChunkRange, RangeError};
pub use stream::RangedStream;

/// [`AsyncSeek`] narrowed to only allow seeking from start.
pub trait AsyncSeekStart {
    /// Same semantics as [`AsyncSeek::start_seek`], always passing position as the `SeekFrom::Start` variant.
    fn start_seek(self: Pin<&mut Self>, position: u64) -> io::Result<()>;

    /// Same semantics as [`AsyncSeek::poll_complete`], returning `()` instead of the new stream position.
    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>>;
}

impl<T: AsyncSeek> AsyncSeekStart for T {
    fn start_seek(self: Pin<&mut Self>, position: u64) -> io::Result<()> {
        AsyncSeek::start_seek(self, io::SeekFrom::Start(position))
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncSeek::poll_complete(self, cx).map_ok(|_| ())
    }
}

/// An [`AsyncRead`] and [`AsyncSeekStart`] with a fixed known byte size.
pub trait RangeBody: AsyncRead + AsyncSeekStart {
    /// The total size of the underlying file.
    ///
    /// This should not change for the lifetime of the object once queried.
    /// Behaviour is not guaranteed if it does change.
    fn byte_size(&self) -> u64;

    /// Modification time used for `Last-Modified` and `ETag`, if known.
    fn last_modified(&self) -> Option<SystemTime> { None }
}

/// The main responder type. Implements [`IntoResponse`].
#[derive(Debug)]
pub struct Ranged<B: RangeBody + Send + 'static> {
    range: Option<String>,
    body: B,
    filename: String,
}

impl<B: RangeBody + Send + 'static> Ranged<B> {
    /// Construct a ranged response over any type implementing [`RangeBody`],
    /// the raw value of the request's `Range` header if it had one, and the
    /// name offered to the client in `Content-Disposition`.
    pub fn new(range: Option<String>, body: B, filename: impl Into<String>) -> Self {
        Ranged { range, body, filename: filename.into() }
    }

    /// Responds to the request, returning headers and body as
    /// [`RangedResponse`]. Returns [`RangeNotSatisfiable`] if the header
    /// could not be parsed, was out of bounds, or asked for more than one
    /// window.
    pub fn try_respond(self) -> Result<RangedResponse<B>, RangeNotSatisfiable> {
        let total_bytes = self.body.byte_size();
        let entity = EntityHeaders::new(&self.filename, total_bytes, self.body.last_modified());

        let Some(range) = self.range else {
            let stream = RangedStream::new(self.body, 0, total_bytes);
            return Ok(RangedResponse::Full { entity, total_bytes, stream });
        };

        let windows = parse_range(&range, total_bytes).map_err(|e| {
            tracing::debug!(error = %e, "rejecting range header");
            RangeNotSatisfiable(ContentRange::unsatisfied_bytes(total_bytes))
        })?;

        // multipart/byteranges responses are not supported
        let [window] = windows[..] else {
            tracing::debug!(range = %range, windows = windows.len(), "rejecting range header that is not a single window");
            return Err(RangeNotSatisfiable(ContentRange::unsatisfied_bytes(total_bytes)));
        };

        let stream = RangedStream::new(self.body, window.start, window.length);
        Ok(RangedResponse::Single { entity, window, total_bytes, stream })
    }
}

impl<B: RangeBody + Send + 'static> IntoResponse for Ranged<B> {
    fn into_response(self) -> Response {
        self.try_respond().into_response()
    }
}

/// Error type indicating that the requested range was not satisfiable. Implements [`IntoResponse`].
#[derive(Debug, Clone)]
pub struct RangeNotSatisfiable(pub ContentRange);

impl IntoResponse for RangeNotSatisfiable {
    fn into_response(self) -> Response {
        let status = StatusCode::RANGE_NOT_SATISFIABLE;
        let header = TypedHeader(self.0);
        (status, header, ()).into_response()
    }
}

/// Headers describing the stored file, sent on every download.
#[derive(Debug, Clone)]
pub struct EntityHeaders {
    content_type: ContentType,
    disposition: Option<HeaderValue>,
    last_modified: Option<SystemTime>,
    etag: Option<ETag>,
}

impl EntityHeaders {
    fn new(filename: &str, byte_size: u64, modified: Option<SystemTime>) -> Self {
        let content_type = ContentType::from(mime_guess::from_path(filename).first_or_octet_stream());
        let disposition = HeaderValue::from_str(&format!(
            "attachment; filename=\"{}\"",
            filename.replace(['"', '\\'], "_")
        ))
        .ok();
        let etag = modified.and_then(|modified| weak_etag(modified, byte_size).parse().ok());
        EntityHeaders { content_type, disposition, last_modified: modified, etag }
    }

    fn apply(self, headers: &mut HeaderMap) {
        headers.typed_insert(self.content_type);
        if let Some(disposition) = self.disposition {
            headers.insert(header::CONTENT_DISPOSITION, disposition);
        }
        headers.typed_insert(AcceptRanges::bytes());
        if let Some(modified) = self.last_modified {
            headers.typed_insert(LastModified::from(modified));
        }
        if let Some(etag) = self.etag {
            headers.typed_insert(etag);
        }
    }
}

/// Weak validator built from modification time and size, so it changes
/// whenever either does.
fn weak_etag(modified: SystemTime, byte_size: u64) -> String {
    let secs = modified
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    format!("W/\"{:x}-{:x}\"", secs, byte_size)
}

/// Data type containing computed headers and body for a range response. Implements [`IntoResponse`].
#[derive(Debug)]
pub enum RangedResponse<B> {
    /// Full content response, no range requested.
    Full {
        entity: EntityHeaders,
        total_bytes: u64,
        stream: RangedStream<B>,
    },
    /// A single `206 Partial Content` window.
    Single {
        entity: EntityHeaders,
        window: ByteWindow,
        total_bytes: u64,
        stream: RangedStream<B>,
    },
}

impl<B: RangeBody + Unpin> RangedResponse<B> {
    /// Seeks the body to the first byte it will send.
    pub async fn seek_to_start(&mut self) -> io::Result<()> {
        match self {
            RangedResponse::Full { stream, .. } | RangedResponse::Single { stream, .. } => {
                stream.seek_to_start().await
            }
        }
    }
}

impl<B: RangeBody + Send + 'static> IntoResponse for RangedResponse<B> {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();

        use RangedResponse::*;
        match self {
            Full { entity, total_bytes, stream } => {
                entity.apply(&mut headers);
                headers.typed_insert(ContentLength(total_bytes));
                (StatusCode::OK, headers, stream).into_response()
            }
            Single { entity, window, total_bytes, stream } => {
                entity.apply(&mut headers);
                if let Ok(content_range) = HeaderValue::from_str(&window.content_range(total_bytes)) {
                    headers.insert(header::CONTENT_RANGE, content_range);
                }
                headers.typed_insert(ContentLength(window.length));
                (StatusCode::PARTIAL_CONTENT, headers, stream).into_response()
            }
        }
    }
}
