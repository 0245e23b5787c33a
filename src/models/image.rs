//! Represents a stored image and the formats the gallery accepts.

use chrono::{DateTime, Utc};
use image::ImageFormat;
use serde::{Deserialize, Serialize};

/// Metadata for one stored image.
///
/// The image bytes live in the storage directory under `filename`; this
/// struct only carries what the metadata store knows about them.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ImageRecord {
    /// Unique identifier, also the on-disk file name.
    pub filename: String,

    /// Size in bytes, counted from the upload body when the file was written.
    pub size_bytes: u64,

    /// When the metadata row was committed. Never decreases in insert order.
    pub uploaded_at: DateTime<Utc>,
}

/// Image formats accepted for upload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageKind {
    Jpeg,
    Png,
    Gif,
}

impl ImageKind {
    /// Infer the format from a file extension (case-insensitive).
    pub fn from_extension(filename: &str) -> Option<Self> {
        let (_, ext) = filename.rsplit_once('.')?;
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "gif" => Some(Self::Gif),
            _ => None,
        }
    }

    /// Map a declared MIME type to a format. Parameters after `;` are ignored.
    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or(mime).trim();
        match essence.to_ascii_lowercase().as_str() {
            "image/jpeg" | "image/jpg" | "image/pjpeg" => Some(Self::Jpeg),
            "image/png" => Some(Self::Png),
            "image/gif" => Some(Self::Gif),
            _ => None,
        }
    }

    /// Identify the format from the leading magic bytes.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        match image::guess_format(bytes).ok()? {
            ImageFormat::Jpeg => Some(Self::Jpeg),
            ImageFormat::Png => Some(Self::Png),
            ImageFormat::Gif => Some(Self::Gif),
            _ => None,
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
        }
    }
}

/// Content type to serve for a stored file, inferred from its extension.
pub fn content_type_for(filename: &str) -> &'static str {
    ImageKind::from_extension(filename)
        .map(ImageKind::content_type)
        .unwrap_or("application/octet-stream")
}
