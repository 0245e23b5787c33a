//! Pagination and sorting over a materialized set of image records.
//!
//! The engine is pure: it orders and slices whatever the repository handed
//! back and never performs I/O. Ordering is total (filename is the final
//! tie-break and filenames are unique), so the same input always produces the
//! same pages even while the underlying collection changes between calls.

use crate::models::{
    image::ImageRecord,
    page::{PageRequest, PageResult, SortDirection, SortKey},
};
use serde::Deserialize;
use std::cmp::Ordering;
use thiserror::Error;

/// Page sizes a client may ask for.
pub const ALLOWED_PAGE_SIZES: [u32; 3] = [4, 8, 12];
pub const DEFAULT_PAGE: u32 = 1;
pub const DEFAULT_PER_PAGE: u32 = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PageError {
    #[error("invalid page `{0}`: must be a positive integer")]
    InvalidPage(String),
    #[error("invalid per_page `{value}`: allowed values are {allowed:?}")]
    InvalidPerPage { value: String, allowed: Vec<u32> },
    #[error("invalid sort_param `{0}`: expected one of name, size, age")]
    InvalidSortKey(String),
    #[error("invalid sort_value `{0}`: expected asc or desc")]
    InvalidDirection(String),
}

/// Listing parameters exactly as they arrive in the query string.
///
/// Everything is kept as text so that a malformed value is reported as a
/// validation error instead of being rejected by the extractor.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct PageParams {
    pub page: Option<String>,
    pub per_page: Option<String>,
    pub sort_param: Option<String>,
    pub sort_value: Option<String>,
}

/// Parses listing parameters against an allow-list and shapes record sets
/// into pages.
#[derive(Clone, Debug)]
pub struct Paginator {
    allowed_page_sizes: Vec<u32>,
    default_per_page: u32,
    default_sort_key: SortKey,
    default_direction: SortDirection,
}

impl Default for Paginator {
    fn default() -> Self {
        Self {
            allowed_page_sizes: ALLOWED_PAGE_SIZES.to_vec(),
            default_per_page: DEFAULT_PER_PAGE,
            default_sort_key: SortKey::Age,
            default_direction: SortDirection::Desc,
        }
    }
}

impl Paginator {
    pub fn allowed_page_sizes(&self) -> &[u32] {
        &self.allowed_page_sizes
    }

    /// Validate raw parameters. Absent values take the defaults; present but
    /// invalid values are errors.
    pub fn parse(&self, params: &PageParams) -> Result<PageRequest, PageError> {
        let page = match params.page.as_deref() {
            None => DEFAULT_PAGE,
            Some(raw) => match raw.trim().parse::<u32>() {
                Ok(page) if page >= 1 => page,
                _ => return Err(PageError::InvalidPage(raw.to_string())),
            },
        };

        let per_page = match params.per_page.as_deref() {
            None => self.default_per_page,
            Some(raw) => match raw.trim().parse::<u32>() {
                Ok(size) if self.allowed_page_sizes.contains(&size) => size,
                _ => {
                    return Err(PageError::InvalidPerPage {
                        value: raw.to_string(),
                        allowed: self.allowed_page_sizes.clone(),
                    });
                }
            },
        };

        let sort_key = match params.sort_param.as_deref() {
            None => self.default_sort_key,
            Some(raw) => raw.parse()?,
        };
        let direction = match params.sort_value.as_deref() {
            None => self.default_direction,
            Some(raw) => raw.parse()?,
        };

        Ok(PageRequest {
            page,
            per_page,
            sort_key,
            direction,
        })
    }

    pub fn paginate(&self, records: Vec<ImageRecord>, request: &PageRequest) -> PageResult {
        paginate(records, request)
    }
}

/// Sort `records` in place by `key`, reversing the whole ordering for
/// descending requests.
pub fn sort_records(records: &mut [ImageRecord], key: SortKey, direction: SortDirection) {
    records.sort_by(|a, b| {
        let ord = compare(a, b, key);
        match direction {
            SortDirection::Asc => ord,
            SortDirection::Desc => ord.reverse(),
        }
    });
}

fn compare(a: &ImageRecord, b: &ImageRecord, key: SortKey) -> Ordering {
    match key {
        SortKey::Name => a.filename.cmp(&b.filename),
        SortKey::Size => a
            .size_bytes
            .cmp(&b.size_bytes)
            .then_with(|| a.filename.cmp(&b.filename)),
        SortKey::Age => a
            .uploaded_at
            .cmp(&b.uploaded_at)
            .then_with(|| a.filename.cmp(&b.filename)),
    }
}

/// Order `records` and cut out the requested page.
///
/// A page past the end is clamped to the last page and reported as such.
/// An empty collection has zero pages and serves page 1 with no files.
pub fn paginate(mut records: Vec<ImageRecord>, request: &PageRequest) -> PageResult {
    let per_page = request.per_page.max(1) as usize;
    sort_records(&mut records, request.sort_key, request.direction);

    let total_pages = records.len().div_ceil(per_page);
    let page = if total_pages == 0 {
        1
    } else {
        (request.page.max(1) as usize).min(total_pages)
    };

    let files = records
        .into_iter()
        .skip((page - 1) * per_page)
        .take(per_page)
        .map(|record| record.filename)
        .collect();

    PageResult {
        files,
        total_pages: u32::try_from(total_pages).unwrap_or(u32::MAX),
        page: u32::try_from(page).unwrap_or(u32::MAX),
        per_page: request.per_page,
    }
}
