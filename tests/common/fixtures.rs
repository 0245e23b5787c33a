//! Test fixtures for image payloads and multipart bodies.

use axum::{body::Body, http::Request};

pub const BOUNDARY: &str = "gallery-test-boundary-7f3a";

const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";
const GIF_MAGIC: &[u8] = b"GIF89a";
const JPEG_MAGIC: &[u8] = b"\xff\xd8\xff\xe0";

/// `len` bytes that start with the PNG signature; the rest is filler.
#[allow(dead_code)]
pub fn png_bytes(len: usize) -> Vec<u8> {
    with_magic(PNG_MAGIC, len)
}

#[allow(dead_code)]
pub fn gif_bytes(len: usize) -> Vec<u8> {
    with_magic(GIF_MAGIC, len)
}

#[allow(dead_code)]
pub fn jpeg_bytes(len: usize) -> Vec<u8> {
    with_magic(JPEG_MAGIC, len)
}

fn with_magic(magic: &[u8], len: usize) -> Vec<u8> {
    assert!(len >= magic.len(), "payload shorter than its signature");
    let mut data = magic.to_vec();
    data.extend((0..len - magic.len()).map(|i| (i % 251) as u8));
    data
}

/// One part of a multipart/form-data body.
#[allow(dead_code)]
pub struct Part {
    pub name: String,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Vec<u8>,
}

#[allow(dead_code)]
impl Part {
    /// A `file` part with the given name, content type and payload.
    pub fn file(filename: &str, content_type: &str, data: Vec<u8>) -> Self {
        Self {
            name: "file".into(),
            filename: Some(filename.into()),
            content_type: Some(content_type.into()),
            data,
        }
    }

    /// A plain text form field.
    pub fn text(name: &str, value: &str) -> Self {
        Self {
            name: name.into(),
            filename: None,
            content_type: None,
            data: value.as_bytes().to_vec(),
        }
    }
}

#[allow(dead_code)]
pub fn multipart_body(parts: &[Part]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        let disposition = match &part.filename {
            Some(filename) => format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                part.name, filename
            ),
            None => format!("Content-Disposition: form-data; name=\"{}\"\r\n", part.name),
        };
        body.extend_from_slice(disposition.as_bytes());
        if let Some(content_type) = &part.content_type {
            body.extend_from_slice(format!("Content-Type: {}\r\n", content_type).as_bytes());
        }
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(&part.data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

/// `POST /api/upload/` carrying `parts`.
#[allow(dead_code)]
pub fn upload_request(parts: &[Part]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/upload/")
        .header(
            "Content-Type",
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(multipart_body(parts)))
        .unwrap()
}

/// Upload request for a single PNG file.
#[allow(dead_code)]
pub fn upload_png(filename: &str, data: Vec<u8>) -> Request<Body> {
    upload_request(&[Part::file(filename, "image/png", data)])
}
