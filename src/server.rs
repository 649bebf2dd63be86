//! HTTP surface: `POST|PUT /upload` and `GET /download/{filename}`.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::TransferError;
use crate::lock::FileLocks;
use crate::range::ChunkRange;
use crate::upload::{UploadProgress, UploadStore};
use crate::{sanitize_filename, KnownSize, Ranged};

const UPLOAD_COMPLETE: &str = "Upload completed successfully";
const CHUNK_STORED: &str = "Chunk uploaded successfully";

/// Shared state handed to every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: UploadStore,
    pub locks: FileLocks,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        AppState {
            store: UploadStore::new(&config),
            config: Arc::new(config),
            locks: FileLocks::new(),
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/upload", post(upload).put(upload))
        .route("/download/", get(missing_filename))
        .route("/download/{filename}", get(download))
        // the upload cap is enforced while copying
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn missing_filename() -> TransferError {
    TransferError::BadRequest("Filename not provided".to_string())
}

async fn download(
    State(state): State<AppState>,
    Path(filename): Path<String>,
    headers: HeaderMap,
) -> Result<Response, TransferError> {
    let filename = sanitize_filename(&filename)
        .ok_or_else(|| TransferError::BadRequest("Invalid filename".to_string()))?;

    // held by the body until the last byte is sent
    let guard = state.locks.read(&filename).await;
    let path = state.store.final_path(&filename);

    match tokio::fs::metadata(&path).await {
        Ok(metadata) if metadata.is_file() => {}
        Ok(_) => return Err(TransferError::NotFound(filename)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(TransferError::NotFound(filename));
        }
        Err(e) => return Err(TransferError::storage("access file")(e)),
    }

    let body = KnownSize::open(&path)
        .await
        .map_err(TransferError::storage("open file"))?
        .with_guard(guard);

    let range = headers
        .get(header::RANGE)
        .filter(|value| !is_blank(value))
        .map(|value| String::from_utf8_lossy(value.as_bytes()).into_owned());

    let mut response = match Ranged::new(range.clone(), body, filename.clone()).try_respond() {
        Ok(response) => response,
        Err(unsatisfiable) => return Ok(unsatisfiable.into_response()),
    };
    response
        .seek_to_start()
        .await
        .map_err(TransferError::storage("seek file"))?;

    tracing::info!(filename = %filename, range = range.as_deref().unwrap_or("-"), "serving download");
    Ok(response.into_response())
}

async fn upload(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, TransferError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    if content_type.starts_with("multipart/form-data") {
        return upload_multipart(&state, content_type, body).await;
    }

    let requested = match headers.get("x-filename") {
        Some(value) => value
            .to_str()
            .map_err(|_| TransferError::BadRequest("Invalid X-Filename header".to_string()))?
            .to_string(),
        None => generated_name(),
    };
    let filename = sanitize_filename(&requested)
        .ok_or_else(|| TransferError::BadRequest("Invalid filename".to_string()))?;

    let range = match headers.get(header::CONTENT_RANGE).filter(|value| !is_blank(value)) {
        Some(value) => {
            let value = value
                .to_str()
                .map_err(|_| TransferError::MalformedRange(String::from_utf8_lossy(value.as_bytes()).into_owned()))?;
            Some(ChunkRange::parse(value)?)
        }
        None => None,
    };

    tracing::debug!(filename = %filename, content_type, range = ?range, "received upload");

    let guard = state.locks.write(&filename).await;
    let progress = state.store.write(&filename, range, body.into_data_stream()).await;
    drop(guard);

    Ok(progress_response(progress?))
}

async fn upload_multipart(
    state: &AppState,
    content_type: &str,
    body: Body,
) -> Result<Response, TransferError> {
    let boundary = multer::parse_boundary(content_type)
        .map_err(|e| TransferError::BadRequest(format!("Failed to create multipart reader: {e}")))?;
    let mut multipart = multer::Multipart::new(body.into_data_stream(), boundary);

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| TransferError::BadRequest(format!("Error reading multipart: {e}")))?
    {
        let Some(requested) = field.file_name().map(str::to_string) else {
            let name = field.name().unwrap_or_default().to_string();
            let value = field
                .text()
                .await
                .map_err(|e| TransferError::BadRequest(format!("Failed to read form field: {e}")))?;
            tracing::debug!(field = %name, value = %value, "received form field");
            continue;
        };
        let filename = sanitize_filename(&requested)
            .ok_or_else(|| TransferError::BadRequest("Invalid filename".to_string()))?;

        let guard = state.locks.write(&filename).await;
        let progress = state.store.write(&filename, None, field).await;
        drop(guard);

        let progress = progress?;
        tracing::info!(filename = %filename, bytes = progress.written(), "stored multipart file");
    }

    Ok((StatusCode::OK, UPLOAD_COMPLETE).into_response())
}

/// An empty header counts as absent.
fn is_blank(value: &HeaderValue) -> bool {
    value.as_bytes().iter().all(u8::is_ascii_whitespace)
}

fn generated_name() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    format!("upload_{nanos}")
}

fn progress_response(progress: UploadProgress) -> Response {
    match progress {
        UploadProgress::Complete { .. } => (StatusCode::OK, UPLOAD_COMPLETE).into_response(),
        UploadProgress::Partial { .. } => {
            let mut headers = HeaderMap::new();
            if let Some(range) = progress.range_header().and_then(|r| HeaderValue::from_str(&r).ok()) {
                headers.insert(header::RANGE, range);
            }
            (StatusCode::PARTIAL_CONTENT, headers, CHUNK_STORED).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_response() {
        let response = progress_response(UploadProgress::Partial { written: 50, received: 50 });
        assert_eq!(StatusCode::PARTIAL_CONTENT, response.status());
        assert_eq!(Some(&HeaderValue::from_static("bytes=0-49")), response.headers().get("Range"));

        let response = progress_response(UploadProgress::Complete { written: 50 });
        assert_eq!(StatusCode::OK, response.status());
        assert!(response.headers().get("Range").is_none());
    }

    #[test]
    fn test_is_blank() {
        assert!(is_blank(&HeaderValue::from_static("")));
        assert!(is_blank(&HeaderValue::from_static("  ")));
        assert!(!is_blank(&HeaderValue::from_static("bytes=0-")));
    }

    #[test]
    fn test_generated_name() {
        let name = generated_name();
        assert!(name.starts_with("upload_"));
        assert!(name["upload_".len()..].parse::<u128>().is_ok());
    }
}
