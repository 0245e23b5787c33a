//! Server test utilities.

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use image_gallery::{
    db::{self, DatabaseSettings},
    handlers::validation::UploadPolicy,
    routes::routes::build_router,
    services::{image_repository::ImageRepository, storage_service::ImageStorage},
    state::AppState,
};
use serde_json::Value;
use std::{
    path::PathBuf,
    time::{Duration, SystemTime},
};
use tempfile::TempDir;
use tower::ServiceExt;

/// Upload limit used by test servers, small enough to test the boundary.
pub const TEST_MAX_UPLOAD_BYTES: u64 = 1024;

/// Request timeout of test servers, also their grace period for files
/// without a metadata row.
pub const TEST_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A test server wrapper with all dependencies.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub router: Router,
    pub storage: ImageStorage,
    pub repository: ImageRepository,
    storage_path: PathBuf,
    db_path: PathBuf,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    /// Create a new test server with temporary storage and database.
    pub async fn new() -> Self {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let storage_path = temp_dir.path().join("images");
        std::fs::create_dir_all(&storage_path).expect("Failed to create storage directory");
        let db_path = temp_dir.path().join("meta/gallery.db");

        let (router, storage, repository) = open_worker(&storage_path, &db_path).await;
        db::migrate(repository.pool())
            .await
            .expect("Failed to migrate database");

        Self {
            router,
            storage,
            repository,
            storage_path,
            db_path,
            _temp_dir: temp_dir,
        }
    }

    /// A second router over the same directory and database file, with its
    /// own pool, as another worker process would have.
    pub async fn another_worker(&self) -> Router {
        open_worker(&self.storage_path, &self.db_path).await.0
    }

    /// Names present on disk and in the metadata table.
    pub async fn name_sets(&self) -> (Vec<String>, Vec<String>) {
        let files: Vec<String> = self
            .storage
            .list()
            .await
            .expect("list storage")
            .into_iter()
            .collect();
        let mut rows: Vec<String> = self
            .repository
            .list_all()
            .await
            .expect("list metadata")
            .into_iter()
            .map(|r| r.filename)
            .collect();
        rows.sort();
        (files, rows)
    }
}

async fn open_worker(
    storage_path: &std::path::Path,
    db_path: &std::path::Path,
) -> (Router, ImageStorage, ImageRepository) {
    let pool = db::connect(&DatabaseSettings::for_path(db_path))
        .await
        .expect("Failed to open database");
    let storage = ImageStorage::new(storage_path);
    let repository = ImageRepository::new(pool);
    let state = AppState::new(storage.clone(), repository.clone())
        .with_upload_policy(
            UploadPolicy::new(TEST_MAX_UPLOAD_BYTES).with_orphan_grace(TEST_REQUEST_TIMEOUT),
        );
    let router = build_router(state, TEST_REQUEST_TIMEOUT);
    (router, storage, repository)
}

/// Put a file into the storage root behind the server's back, as a crashed
/// upload or a failed delete would leave it. `age` back-dates its mtime.
#[allow(dead_code)]
pub fn plant_file(storage: &ImageStorage, filename: &str, data: &[u8], age: Duration) {
    let path = storage.base_path().join(filename);
    std::fs::write(&path, data).expect("write planted file");
    std::fs::File::options()
        .write(true)
        .open(&path)
        .and_then(|file| file.set_modified(SystemTime::now() - age))
        .expect("back-date planted file");
}

/// Send a request and return status plus the JSON body (`Null` when the
/// body is empty or not JSON).
#[allow(dead_code)]
pub async fn send_json(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let (status, bytes) = send_raw(router, request).await;
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}

/// Send a request and return status plus the raw body.
#[allow(dead_code)]
pub async fn send_raw(router: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body.to_vec())
}

#[allow(dead_code)]
pub fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

#[allow(dead_code)]
pub fn delete(uri: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}
