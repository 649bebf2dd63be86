//! Upload ingestion.
//!
//! An upload either arrives in one request, or as a series of requests each
//! carrying a `Content-Range: bytes start-end/total` header. Bytes land in
//! `<uploads>/temp/<name>.part`; the request carrying byte `total - 1`
//! renames that file to `<uploads>/<name>`. The length of the `.part` file
//! is the only record of progress between requests.

use std::fmt::Display;
use std::io;
use std::path::PathBuf;

use bytes::Bytes;
use futures::{pin_mut, Stream, StreamExt};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};

use crate::config::Config;
use crate::error::TransferError;
use crate::range::ChunkRange;

const PART_SUFFIX: &str = ".part";

/// Outcome of one upload request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadProgress {
    /// The file has been renamed into its final location.
    Complete { written: u64 },
    /// More chunks are expected. `received` counts every byte stored for
    /// this upload so far, including earlier requests.
    Partial { written: u64, received: u64 },
}

impl UploadProgress {
    /// Value for the `Range` header of a `206` reply, `None` when no byte
    /// has been stored yet.
    pub fn range_header(&self) -> Option<String> {
        match *self {
            UploadProgress::Partial { received, .. } if received > 0 => {
                Some(format!("bytes=0-{}", received - 1))
            }
            _ => None,
        }
    }

    pub fn written(&self) -> u64 {
        match *self {
            UploadProgress::Complete { written } | UploadProgress::Partial { written, .. } => written,
        }
    }
}

/// What the server has on disk for an unfinished upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub filename: String,
    pub bytes_received: u64,
}

/// Writes uploads below the configured uploads root.
#[derive(Debug, Clone)]
pub struct UploadStore {
    uploads_root: PathBuf,
    temp_root: PathBuf,
    max_upload_bytes: u64,
    strict_chunk_order: bool,
}

struct Copied {
    written: u64,
    /// Set when the body stream failed before its end.
    interrupted: Option<String>,
}

impl UploadStore {
    pub fn new(config: &Config) -> Self {
        UploadStore {
            uploads_root: config.uploads_root.clone(),
            temp_root: config.temp_root(),
            max_upload_bytes: config.max_upload_bytes,
            strict_chunk_order: config.strict_chunk_order,
        }
    }

    /// Creates the uploads and temp directories if they are missing.
    pub async fn prepare(&self) -> Result<(), TransferError> {
        fs::create_dir_all(&self.temp_root)
            .await
            .map_err(TransferError::storage("create temp directory"))?;
        fs::create_dir_all(&self.uploads_root)
            .await
            .map_err(TransferError::storage("create uploads directory"))
    }

    pub fn final_path(&self, filename: &str) -> PathBuf {
        self.uploads_root.join(filename)
    }

    pub fn temp_path(&self, filename: &str) -> PathBuf {
        self.temp_root.join(format!("{filename}{PART_SUFFIX}"))
    }

    /// Looks up the unfinished upload for `filename`, if any.
    pub async fn session(&self, filename: &str) -> Result<Option<UploadSession>, TransferError> {
        match fs::metadata(self.temp_path(filename)).await {
            Ok(metadata) => Ok(Some(UploadSession {
                filename: filename.to_string(),
                bytes_received: metadata.len(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(TransferError::storage("inspect temporary file")(e)),
        }
    }

    /// Stores `body` for `filename`.
    ///
    /// Without a `range` the body is the whole file and is finalized once the
    /// stream ends. With a `range` the body is one chunk and the upload is
    /// finalized only when the chunk ends at byte `total - 1`. `filename`
    /// must already be sanitized.
    pub async fn write<S, E>(
        &self,
        filename: &str,
        range: Option<ChunkRange>,
        body: S,
    ) -> Result<UploadProgress, TransferError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Display,
    {
        if let Some(range) = range {
            if range.total > self.max_upload_bytes {
                return Err(TransferError::PayloadTooLarge { limit: self.max_upload_bytes });
            }
        }
        self.prepare().await?;

        let temp_path = self.temp_path(filename);
        let offset = range.map_or(0, |range| range.start);
        let file = self.open_temp(filename, offset).await?;

        let mut writer = BufWriter::new(file);
        let copied = match copy_body(&mut writer, body, offset, self.max_upload_bytes).await {
            Ok(copied) => copied,
            Err(e) => {
                drop(writer);
                if matches!(e, TransferError::PayloadTooLarge { .. }) {
                    let _ = fs::remove_file(&temp_path).await;
                }
                return Err(e);
            }
        };
        writer
            .flush()
            .await
            .map_err(TransferError::storage("write temporary file"))?;
        let file = writer.into_inner();
        file.sync_all()
            .await
            .map_err(TransferError::storage("sync temporary file"))?;
        drop(file);

        let written = copied.written;
        let complete = match (range, copied.interrupted) {
            (None, None) => true,
            (None, Some(reason)) => {
                let _ = fs::remove_file(&temp_path).await;
                return Err(TransferError::BadRequest(format!(
                    "Upload body ended early after {written} bytes: {reason}"
                )));
            }
            (Some(range), None) => range.is_final(),
            (Some(_), Some(reason)) => {
                tracing::warn!(filename, written, %reason, "chunk body interrupted, keeping bytes received");
                false
            }
        };

        if !complete {
            let received = offset + written;
            tracing::debug!(filename, written, received, "stored chunk");
            return Ok(UploadProgress::Partial { written, received });
        }

        fs::rename(&temp_path, self.final_path(filename))
            .await
            .map_err(TransferError::storage("finalize upload"))?;
        tracing::info!(filename, bytes = offset + written, "upload complete");
        Ok(UploadProgress::Complete { written })
    }

    async fn open_temp(&self, filename: &str, offset: u64) -> Result<File, TransferError> {
        let temp_path = self.temp_path(filename);
        if offset == 0 {
            return File::create(&temp_path)
                .await
                .map_err(TransferError::storage("create temporary file"));
        }

        let unavailable = |source: io::Error| TransferError::TempFileUnavailable {
            name: filename.to_string(),
            source,
        };

        if self.strict_chunk_order {
            let received = match self.session(filename).await? {
                Some(session) => session.bytes_received,
                None => return Err(unavailable(io::ErrorKind::NotFound.into())),
            };
            if received != offset {
                return Err(TransferError::ChunkOutOfOrder { expected: received, got: offset });
            }
        }

        OpenOptions::new()
            .append(true)
            .open(&temp_path)
            .await
            .map_err(unavailable)
    }
}

/// Copies `body` into `writer`, refusing to let the upload grow past `limit`
/// bytes counted from the start of the file.
async fn copy_body<W, S, E>(
    writer: &mut W,
    body: S,
    offset: u64,
    limit: u64,
) -> Result<Copied, TransferError>
where
    W: AsyncWrite + Unpin,
    S: Stream<Item = Result<Bytes, E>>,
    E: Display,
{
    pin_mut!(body);
    let mut written = 0u64;

    while let Some(next) = body.next().await {
        let chunk = match next {
            Ok(chunk) => chunk,
            Err(e) => {
                return Ok(Copied { written, interrupted: Some(e.to_string()) });
            }
        };

        let len = chunk.len() as u64;
        if offset.saturating_add(written).saturating_add(len) > limit {
            return Err(TransferError::PayloadTooLarge { limit });
        }
        writer
            .write_all(&chunk)
            .await
            .map_err(TransferError::storage("write temporary file"))?;
        written += len;
    }

    Ok(Copied { written, interrupted: None })
}
