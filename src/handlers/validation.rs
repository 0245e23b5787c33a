//! Upload validation rules. Everything here runs before storage or the
//! metadata store is touched.

use crate::{
    errors::AppError,
    models::image::ImageKind,
    services::storage_service::sanitize_filename,
};
use std::time::Duration;

/// Largest accepted image unless configured otherwise (5 MiB).
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 5 * 1024 * 1024;

/// Slack on top of the file limit for multipart boundaries and part headers.
pub const MULTIPART_OVERHEAD_BYTES: u64 = 64 * 1024;

/// Default age after which a stored file without a metadata row is treated
/// as a leftover rather than an upload still in flight.
pub const DEFAULT_ORPHAN_GRACE: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct UploadPolicy {
    pub max_bytes: u64,
    /// Younger files without a row may belong to another worker's upload
    /// that has not inserted its row yet. Should be at least the request
    /// timeout.
    pub orphan_grace: Duration,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_UPLOAD_BYTES)
    }
}

impl UploadPolicy {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            orphan_grace: DEFAULT_ORPHAN_GRACE,
        }
    }

    pub fn with_orphan_grace(mut self, orphan_grace: Duration) -> Self {
        self.orphan_grace = orphan_grace;
        self
    }

    /// Request body limit to install on the router.
    pub fn body_limit(&self) -> usize {
        usize::try_from(self.max_bytes.saturating_add(MULTIPART_OVERHEAD_BYTES))
            .unwrap_or(usize::MAX)
    }

    /// The name must be storable and carry an allowed image extension.
    pub fn check_filename(&self, filename: &str) -> Result<ImageKind, AppError> {
        sanitize_filename(filename)?;
        ImageKind::from_extension(filename).ok_or_else(|| {
            AppError::validation(format!(
                "Unsupported file extension for '{}': allowed are .jpg, .jpeg, .png, .gif",
                filename
            ))
        })
    }

    /// A declared part content type, when present, must be an allowed image type.
    pub fn check_declared_type(&self, declared: Option<&str>) -> Result<(), AppError> {
        match declared {
            None => Ok(()),
            Some(mime) if ImageKind::from_mime(mime).is_some() => Ok(()),
            Some(mime) => Err(AppError::validation(format!(
                "Unsupported content type '{}': allowed are image/jpeg, image/png, image/gif",
                mime
            ))),
        }
    }

    /// Fails once `received` bytes exceed the limit.
    pub fn check_size(&self, received: u64) -> Result<(), AppError> {
        if received > self.max_bytes {
            return Err(AppError::validation(format!(
                "File exceeds the maximum size of {} bytes",
                self.max_bytes
            )));
        }
        Ok(())
    }

    /// The payload must actually be an image of the kind its extension claims.
    pub fn check_content(&self, bytes: &[u8], expected: ImageKind) -> Result<(), AppError> {
        match ImageKind::sniff(bytes) {
            Some(kind) if kind == expected => Ok(()),
            Some(kind) => Err(AppError::validation(format!(
                "File content is {} but the extension says {}",
                kind.content_type(),
                expected.content_type()
            ))),
            None => Err(AppError::validation(
                "File content is not a supported image (jpeg, png, gif)",
            )),
        }
    }
}
