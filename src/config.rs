use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Service configuration, built once at startup and shared read-only.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address (default: 0.0.0.0:5100)
    pub bind_addr: SocketAddr,

    /// Directory holding finalized uploads (default: ./uploads)
    pub uploads_root: PathBuf,

    /// Largest accepted upload in bytes (default: 10 GiB)
    pub max_upload_bytes: u64,

    /// Reject chunks whose start does not match the bytes already stored
    /// (default: false)
    pub strict_chunk_order: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 5100)),
            uploads_root: PathBuf::from("./uploads"),
            max_upload_bytes: 10 << 30,
            strict_chunk_order: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            bind_addr: env::var("BIND_ADDR")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.bind_addr),

            uploads_root: env::var("UPLOADS_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.uploads_root),

            max_upload_bytes: env::var("MAX_UPLOAD_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_upload_bytes),

            strict_chunk_order: env::var("STRICT_CHUNK_ORDER")
                .map(|v| v.to_lowercase() == "true" || v == "1")
                .unwrap_or(default.strict_chunk_order),
        }
    }

    /// Uploads rooted at `dir`, everything else default. Handy for tests.
    pub fn with_uploads_root(dir: impl Into<PathBuf>) -> Self {
        Self {
            uploads_root: dir.into(),
            ..Self::default()
        }
    }

    /// Directory holding in-progress `.part` files.
    pub fn temp_root(&self) -> PathBuf {
        self.uploads_root.join("temp")
    }
}
