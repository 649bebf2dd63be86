use std::io;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::range::RangeError;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Invalid Content-Range header: {0}")]
    MalformedRange(String),

    #[error("Content-Range does not describe a chunk of the file: {0}")]
    InvalidChunkRange(String),

    #[error("Failed to open temporary file {name}: {source}")]
    TempFileUnavailable {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("Upload exceeds the {limit} byte limit")]
    PayloadTooLarge { limit: u64 },

    #[error("Chunk starts at byte {got} but {expected} bytes have been received")]
    ChunkOutOfOrder { expected: u64, got: u64 },

    #[error("Failed to {action}: {source}")]
    StorageIo {
        action: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),
}

impl TransferError {
    pub(crate) fn storage(action: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| TransferError::StorageIo { action, source }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            TransferError::MalformedRange(_) => StatusCode::BAD_REQUEST,
            TransferError::InvalidChunkRange(_) => StatusCode::BAD_REQUEST,
            TransferError::TempFileUnavailable { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            TransferError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            TransferError::ChunkOutOfOrder { .. } => StatusCode::CONFLICT,
            TransferError::StorageIo { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            TransferError::NotFound(_) => StatusCode::NOT_FOUND,
            TransferError::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }
}

/// Content-Range on an upload: syntax problems are malformed, out of
/// order bounds mean the chunk itself is invalid.
impl From<RangeError> for TransferError {
    fn from(err: RangeError) -> Self {
        match err {
            RangeError::Malformed(header) => TransferError::MalformedRange(header),
            RangeError::NotSatisfiable(header) => TransferError::InvalidChunkRange(header),
        }
    }
}

impl IntoResponse for TransferError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = ?self, "request failed");
        } else {
            tracing::debug!(%status, "request rejected: {}", self);
        }
        (status, self.to_string()).into_response()
    }
}
