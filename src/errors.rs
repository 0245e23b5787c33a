use crate::services::{
    image_repository::RepositoryError, pagination::PageError, storage_service::StorageError,
};
use axum::{
    Json,
    extract::{
        multipart::{MultipartError, MultipartRejection},
        rejection::{PathRejection, QueryRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use tracing::{error, warn};

/// Error kinds a client can observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    NotFound,
    DuplicateKey,
    RepositoryUnavailable,
    IoFailure,
    RouteNotFound,
}

impl ErrorKind {
    pub fn status(self) -> StatusCode {
        match self {
            Self::Validation => StatusCode::BAD_REQUEST,
            Self::NotFound | Self::RouteNotFound => StatusCode::NOT_FOUND,
            Self::DuplicateKey => StatusCode::CONFLICT,
            Self::RepositoryUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::IoFailure => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable name, sent as `code` in error bodies.
    pub fn code(self) -> &'static str {
        match self {
            Self::Validation => "validation_error",
            Self::NotFound => "not_found",
            Self::DuplicateKey => "duplicate_key",
            Self::RepositoryUnavailable => "repository_unavailable",
            Self::IoFailure => "io_failure",
            Self::RouteNotFound => "route_not_found",
        }
    }
}

/// The only error type that crosses the HTTP boundary.
///
/// Storage and repository errors are translated here; driver and I/O details
/// are logged on conversion and replaced with a generic message.
#[derive(Debug)]
pub struct AppError {
    pub kind: ErrorKind,
    pub message: String,
}

impl AppError {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
        }
    }

    /// Shortcut for a 400 validation failure.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, msg)
    }

    pub fn route_not_found() -> Self {
        Self::new(ErrorKind::RouteNotFound, "Not Found")
    }

    pub fn status(&self) -> StatusCode {
        self.kind.status()
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(status = status.as_u16(), code = self.kind.code(), "{}", self.message);
        } else {
            warn!(status = status.as_u16(), code = self.kind.code(), "{}", self.message);
        }

        let body = Json(json!({
            "error": self.message,
            "code": self.kind.code(),
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::InvalidFilename { .. } => AppError::validation(err.to_string()),
            StorageError::NotFound(name) => {
                AppError::not_found(format!("Image '{}' not found", name))
            }
            StorageError::AlreadyExists(name) => AppError::new(
                ErrorKind::DuplicateKey,
                format!("Image '{}' already exists", name),
            ),
            StorageError::StorageFull => {
                error!("storage directory is full");
                AppError::new(ErrorKind::IoFailure, "Storage is full")
            }
            StorageError::Io(io_err) => {
                error!(error = %io_err, "storage I/O failure");
                AppError::new(ErrorKind::IoFailure, "Storage I/O failure")
            }
        }
    }
}

impl From<RepositoryError> for AppError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::DuplicateKey(name) => AppError::new(
                ErrorKind::DuplicateKey,
                format!("Image '{}' already exists", name),
            ),
            RepositoryError::NotFound(name) => {
                AppError::not_found(format!("Image '{}' not found", name))
            }
            RepositoryError::SizeOutOfRange(size) => {
                AppError::validation(format!("File size {} is out of range", size))
            }
            RepositoryError::Unavailable(db_err) => {
                error!(error = %db_err, "metadata store unavailable");
                AppError::new(
                    ErrorKind::RepositoryUnavailable,
                    "Metadata store unavailable, retry later",
                )
            }
        }
    }
}

impl From<PageError> for AppError {
    fn from(err: PageError) -> Self {
        AppError::validation(err.to_string())
    }
}

impl From<MultipartError> for AppError {
    fn from(err: MultipartError) -> Self {
        AppError::validation(format!("Invalid multipart body: {}", err.body_text()))
    }
}

impl From<MultipartRejection> for AppError {
    fn from(rejection: MultipartRejection) -> Self {
        AppError::validation(rejection.body_text())
    }
}

impl From<PathRejection> for AppError {
    fn from(rejection: PathRejection) -> Self {
        AppError::validation(rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::validation(rejection.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn storage_errors_map_to_client_statuses() {
        let invalid = AppError::from(StorageError::InvalidFilename {
            name: "../x".into(),
            reason: "must not contain `..`",
        });
        assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

        let missing = AppError::from(StorageError::NotFound("a.png".into()));
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        let taken = AppError::from(StorageError::AlreadyExists("a.png".into()));
        assert_eq!(taken.kind, ErrorKind::DuplicateKey);
        assert_eq!(taken.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn io_details_are_not_exposed() {
        let err = AppError::from(StorageError::Io(io::Error::other("disk /dev/sda1 on fire")));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.message.contains("sda1"));
    }

    #[test]
    fn driver_errors_become_service_unavailable() {
        let err = AppError::from(RepositoryError::Unavailable(sqlx::Error::PoolTimedOut));
        assert_eq!(err.kind, ErrorKind::RepositoryUnavailable);
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(!err.message.contains("pool"));
    }

    #[test]
    fn oversized_record_is_a_client_error() {
        let err = AppError::from(RepositoryError::SizeOutOfRange(u64::MAX));
        assert_eq!(err.kind, ErrorKind::Validation);
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn route_not_found_is_404() {
        assert_eq!(AppError::route_not_found().status(), StatusCode::NOT_FOUND);
    }
}
