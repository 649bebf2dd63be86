use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use axum_transfer::config::Config;
use axum_transfer::server::{router, AppState};
use http_body_util::BodyExt;
use tempfile::TempDir;
use tower::ServiceExt;

fn setup(config: impl FnOnce(Config) -> Config) -> (TempDir, Router) {
    let dir = tempfile::tempdir().unwrap();
    let config = config(Config::with_uploads_root(dir.path()));
    (dir, router(AppState::new(config)))
}

fn chunk(filename: &str, content_range: &str, body: &'static str) -> Request<Body> {
    Request::builder()
        .method("PUT")
        .uri("/upload")
        .header("X-Filename", filename)
        .header(header::CONTENT_RANGE, content_range)
        .body(Body::from(body))
        .unwrap()
}

fn get(uri: &str, range: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(range) = range {
        builder = builder.header(header::RANGE, range);
    }
    builder.body(Body::empty()).unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn chunked_upload_then_download() {
    let (dir, app) = setup(|c| c);

    let response = app.clone().oneshot(chunk("digits.txt", "bytes 0-4/10", "01234")).await.unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()["range"], "bytes=0-4");
    assert_eq!(body_string(response).await, "Chunk uploaded successfully");
    assert!(dir.path().join("temp/digits.txt.part").exists());
    assert!(!dir.path().join("digits.txt").exists());

    let response = app.clone().oneshot(chunk("digits.txt", "bytes 5-9/10", "56789")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("range").is_none());
    assert_eq!(body_string(response).await, "Upload completed successfully");
    assert!(!dir.path().join("temp/digits.txt.part").exists());
    assert_eq!(std::fs::read_to_string(dir.path().join("digits.txt")).unwrap(), "0123456789");

    let response = app.clone().oneshot(get("/download/digits.txt", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "10");
    assert_eq!(response.headers()[header::ACCEPT_RANGES], "bytes");
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain");
    assert_eq!(
        response.headers()[header::CONTENT_DISPOSITION],
        "attachment; filename=\"digits.txt\""
    );
    assert!(response.headers()[header::ETAG].to_str().unwrap().starts_with("W/\""));
    assert!(response.headers().contains_key(header::LAST_MODIFIED));
    assert_eq!(body_string(response).await, "0123456789");
}

#[tokio::test]
async fn whole_upload_without_range() {
    let (dir, app) = setup(|c| c);

    let request = Request::builder()
        .method("POST")
        .uri("/upload")
        .header("X-Filename", "note.md")
        .body(Body::from("# hello"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(std::fs::read_to_string(dir.path().join("note.md")).unwrap(), "# hello");
}

#[tokio::test]
async fn upload_without_filename_is_named() {
    let (dir, app) = setup(|c| c);

    let request = Request::builder()
        .method("PUT")
        .uri("/upload")
        .body(Body::from("anonymous"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name != "temp")
        .collect();
    assert_eq!(names.len(), 1);
    assert!(names[0].starts_with("upload_"));
}

#[tokio::test]
async fn upload_filename_is_reduced_to_base_name() {
    let (dir, app) = setup(|c| c);

    let request = Request::builder()
        .method("PUT")
        .uri("/upload")
        .header("X-Filename", "../../etc/passwd")
        .body(Body::from("root:x:0:0"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(std::fs::read_to_string(dir.path().join("passwd")).unwrap(), "root:x:0:0");
}

#[tokio::test]
async fn upload_rejects_dot_filename() {
    let (_dir, app) = setup(|c| c);

    let request = Request::builder()
        .method("PUT")
        .uri("/upload")
        .header("X-Filename", "uploads/..")
        .body(Body::from("x"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn upload_rejects_bad_content_range() {
    let (dir, app) = setup(|c| c);

    for content_range in ["bytes 5-2/10", "bytes 0-10/10", "bytes 0-4", "items 0-4/10"] {
        let response = app.clone().oneshot(chunk("bad.bin", content_range, "01234")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{content_range}");
    }
    assert!(!dir.path().join("bad.bin").exists());
}

#[tokio::test]
async fn upload_over_limit() {
    let (dir, app) = setup(|c| Config { max_upload_bytes: 8, ..c });

    let response = app.clone().oneshot(chunk("big.bin", "bytes 0-4/100", "01234")).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

    let request = Request::builder()
        .method("PUT")
        .uri("/upload")
        .header("X-Filename", "big.bin")
        .body(Body::from("0123456789"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert!(!dir.path().join("big.bin").exists());
    assert!(!dir.path().join("temp/big.bin.part").exists());
}

#[tokio::test]
async fn continuation_without_first_chunk() {
    let (_dir, app) = setup(|c| c);

    let response = app.oneshot(chunk("orphan.bin", "bytes 5-9/10", "56789")).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn strict_order_rejects_gap() {
    let (_dir, app) = setup(|c| Config { strict_chunk_order: true, ..c });

    let response = app.clone().oneshot(chunk("gap.bin", "bytes 0-2/9", "012")).await.unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);

    let response = app.clone().oneshot(chunk("gap.bin", "bytes 6-8/9", "678")).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = app.oneshot(chunk("gap.bin", "bytes 3-5/9", "345")).await.unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()["range"], "bytes=0-5");
}

#[tokio::test]
async fn download_ranges() {
    let (dir, app) = setup(|c| c);
    std::fs::write(dir.path().join("abc.txt"), "abcdefghij").unwrap();

    let response = app.clone().oneshot(get("/download/abc.txt", Some("bytes=5-"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 5-9/10");
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "5");
    assert_eq!(body_string(response).await, "fghij");

    let response = app.clone().oneshot(get("/download/abc.txt", Some("bytes=-3"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 7-9/10");
    assert_eq!(body_string(response).await, "hij");

    let response = app.clone().oneshot(get("/download/abc.txt", Some("bytes=2-400"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes 2-9/10");
    assert_eq!(body_string(response).await, "cdefghij");
}

#[tokio::test]
async fn download_unsatisfiable_ranges() {
    let (dir, app) = setup(|c| c);
    std::fs::write(dir.path().join("abc.txt"), "abcdefghij").unwrap();

    for range in ["bytes=0-1,4-5", "bytes=abc", "bytes=10-", "bytes=-0", "bytes=5-2"] {
        let response = app.clone().oneshot(get("/download/abc.txt", Some(range))).await.unwrap();
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE, "{range}");
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes */10", "{range}");
    }
}

#[tokio::test]
async fn download_errors() {
    let (dir, app) = setup(|c| c);
    std::fs::create_dir_all(dir.path().join("temp")).unwrap();

    let response = app.clone().oneshot(get("/download/missing.txt", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // directories are not downloadable
    let response = app.clone().oneshot(get("/download/temp", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app.clone().oneshot(get("/download/", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let request = Request::builder()
        .method("POST")
        .uri("/download/missing.txt")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

    let request = Request::builder().method("GET").uri("/upload").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn download_does_not_see_partial_upload() {
    let (_dir, app) = setup(|c| c);

    let response = app.clone().oneshot(chunk("half.bin", "bytes 0-4/10", "01234")).await.unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);

    let response = app.oneshot(get("/download/half.bin", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn lock_entries_released_after_requests() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("abc.txt"), "abcdefghij").unwrap();
    let state = AppState::new(Config::with_uploads_root(dir.path()));
    let locks = state.locks.clone();
    let app = router(state);

    for i in 0..50 {
        let response = app.clone().oneshot(get(&format!("/download/missing{i}.txt"), None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
    assert_eq!(locks.len(), 0);

    let response = app.clone().oneshot(get("/download/abc.txt", Some("bytes=0-1,4-5"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(locks.len(), 0);

    let response = app.clone().oneshot(get("/download/abc.txt", None)).await.unwrap();
    assert_eq!(locks.len(), 1, "body holds its read lock while streaming");
    assert_eq!(body_string(response).await, "abcdefghij");
    assert_eq!(locks.len(), 0);

    let response = app.clone().oneshot(chunk("part.bin", "bytes 0-4/10", "01234")).await.unwrap();
    assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
    let response = app.oneshot(chunk("part.bin", "bytes 5-9/10", "56789")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(locks.len(), 0);
}

#[tokio::test]
async fn empty_range_headers_are_ignored() {
    let (dir, app) = setup(|c| c);
    std::fs::write(dir.path().join("abc.txt"), "abcdefghij").unwrap();

    let response = app.clone().oneshot(get("/download/abc.txt", Some(""))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get(header::CONTENT_RANGE).is_none());
    assert_eq!(body_string(response).await, "abcdefghij");

    let response = app.oneshot(chunk("whole.txt", "", "all at once")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "Upload completed successfully");
    assert_eq!(std::fs::read_to_string(dir.path().join("whole.txt")).unwrap(), "all at once");
    assert!(!dir.path().join("temp/whole.txt.part").exists());
}

#[tokio::test]
async fn upload_filename_with_trailing_slash() {
    let (dir, app) = setup(|c| c);

    let request = Request::builder()
        .method("PUT")
        .uri("/upload")
        .header("X-Filename", "reports/")
        .body(Body::from("q3"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(std::fs::read_to_string(dir.path().join("reports")).unwrap(), "q3");
}
