//! HTTP handlers for image upload, listing, serving and deletion.
//!
//! Every handler walks the same phases: the request is received, validated
//! in full, executed against storage and the metadata store, and the
//! response is built. Any failure short-circuits into an `AppError`, and
//! validation failures never reach storage or the database.

use crate::{
    errors::AppError,
    handlers::validation::UploadPolicy,
    models::{
        image::{ImageKind, content_type_for},
        page::PageResult,
    },
    services::{pagination::PageParams, storage_service::{StorageError, sanitize_filename}},
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{
        Multipart, Path, Query, State,
        multipart::{Field, MultipartRejection},
        rejection::{PathRejection, QueryRejection},
    },
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use chrono::Utc;
use serde::Serialize;
use tokio_util::io::ReaderStream;
use tracing::{error, info, warn};

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub filename: String,
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

/// A file part that passed every upload check.
struct ValidatedUpload {
    filename: String,
    bytes: Vec<u8>,
}

/// `POST /api/upload/`: store one image from a multipart body.
///
/// The file is written first and the metadata row inserted second; the row
/// is the commit point. If the insert fails the file is removed again before
/// the error is reported.
pub async fn upload_image(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>, AppError> {
    let mut multipart = multipart?;
    let upload = read_single_file(&mut multipart, &state.upload_policy).await?;

    let size_bytes = upload.bytes.len() as u64;
    publish(&state, &upload).await?;

    let record = match state
        .repository
        .insert(&upload.filename, size_bytes, Utc::now())
        .await
    {
        Ok(record) => record,
        Err(err) => {
            match state.storage.delete(&upload.filename).await {
                Ok(()) => warn!(
                    filename = %upload.filename,
                    error = %err,
                    "metadata insert failed, stored file removed"
                ),
                Err(cleanup_err) => error!(
                    filename = %upload.filename,
                    error = %err,
                    cleanup_error = %cleanup_err,
                    "metadata insert failed and stored file could not be removed"
                ),
            }
            return Err(err.into());
        }
    };

    info!(filename = %record.filename, size_bytes, "image uploaded");
    Ok(Json(UploadResponse {
        url: format!("/images/{}", record.filename),
        filename: record.filename,
    }))
}

/// Write the upload to storage.
///
/// A file that already sits under the name but has no metadata row is either
/// another worker's upload that has not inserted its row yet, or a leftover
/// from a crash or a failed delete. Only files older than the policy's grace
/// period count as leftovers; such a file is removed and the write retried
/// once.
async fn publish(state: &AppState, upload: &ValidatedUpload) -> Result<(), AppError> {
    let filename = upload.filename.as_str();
    match state.storage.write(filename, &upload.bytes).await {
        Ok(_) => return Ok(()),
        Err(StorageError::AlreadyExists(_)) => {}
        Err(err) => return Err(err.into()),
    }

    if state.repository.exists(filename).await? {
        return Err(StorageError::AlreadyExists(filename.to_string()).into());
    }

    let grace = state.upload_policy.orphan_grace;
    match state.storage.remove_if_stale(filename, grace).await {
        Ok(true) => {}
        Ok(false) => {
            warn!(
                filename,
                "file without metadata row is recent, treating it as an upload in flight"
            );
            return Err(StorageError::AlreadyExists(filename.to_string()).into());
        }
        Err(err) => {
            error!(
                filename,
                error = %err,
                "consistency fault: file without metadata row could not be reclaimed"
            );
            return Err(err.into());
        }
    }

    error!(
        filename,
        "consistency fault: removed stored file that had no metadata row"
    );
    state.storage.write(filename, &upload.bytes).await?;
    Ok(())
}

/// Pull exactly one file part out of the body and validate it.
///
/// Parts without a file name are ignored; a second file part is an error.
async fn read_single_file(
    multipart: &mut Multipart,
    policy: &UploadPolicy,
) -> Result<ValidatedUpload, AppError> {
    let mut upload = None;

    while let Some(mut field) = multipart.next_field().await? {
        let Some(filename) = field.file_name().map(str::to_owned) else {
            continue;
        };
        if upload.is_some() {
            return Err(AppError::validation(
                "Only one file may be uploaded per request",
            ));
        }

        let kind: ImageKind = policy.check_filename(&filename)?;
        policy.check_declared_type(field.content_type())?;
        let bytes = read_limited(&mut field, policy).await?;
        policy.check_content(&bytes, kind)?;

        upload = Some(ValidatedUpload { filename, bytes });
    }

    upload.ok_or_else(|| AppError::validation("No file was uploaded"))
}

/// Buffer a part, stopping as soon as it grows past the size limit.
async fn read_limited(field: &mut Field<'_>, policy: &UploadPolicy) -> Result<Vec<u8>, AppError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = field.chunk().await? {
        policy.check_size((bytes.len() + chunk.len()) as u64)?;
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

/// `GET /api/images/`: one page of filenames.
///
/// Query: `page`, `per_page`, `sort_param`, `sort_value`. Invalid values
/// are rejected rather than replaced by defaults.
pub async fn list_images(
    State(state): State<AppState>,
    query: Result<Query<PageParams>, QueryRejection>,
) -> Result<Json<PageResult>, AppError> {
    let Query(params) = query?;
    let request = state.paginator.parse(&params)?;

    let records = state.repository.list_all().await?;
    Ok(Json(state.paginator.paginate(records, &request)))
}

/// `GET /images/{filename}`: stream the raw image bytes of a recorded image.
pub async fn serve_image(
    State(state): State<AppState>,
    path: Result<Path<String>, PathRejection>,
) -> Result<Response, AppError> {
    let Path(filename) = path?;
    sanitize_filename(&filename)?;

    // The row is the existence signal; a file without one is not served.
    if !state.repository.exists(&filename).await? {
        return Err(StorageError::NotFound(filename).into());
    }
    let (file, len) = state.storage.open(&filename).await?;

    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type_for(&filename)),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    Ok(response)
}

/// `DELETE /api/images/{filename}`: remove the metadata row, then the file.
///
/// Once the row is gone the image no longer exists as far as clients are
/// concerned, so a failure to remove the file afterwards is logged as a
/// consistency fault and the request still succeeds. Startup reconciliation
/// removes the leftover file.
pub async fn delete_image(
    State(state): State<AppState>,
    path: Result<Path<String>, PathRejection>,
) -> Result<Json<MessageResponse>, AppError> {
    let Path(filename) = path?;
    sanitize_filename(&filename)?;

    state.repository.delete(&filename).await?;

    match state.storage.delete(&filename).await {
        Ok(()) => info!(filename = %filename, "image deleted"),
        Err(StorageError::NotFound(_)) => warn!(
            filename = %filename,
            "consistency fault: metadata row removed but file was already missing"
        ),
        Err(err) => error!(
            filename = %filename,
            error = %err,
            "consistency fault: metadata row removed but file could not be deleted"
        ),
    }

    Ok(Json(MessageResponse {
        message: format!("File '{}' deleted successfully.", filename),
    }))
}
