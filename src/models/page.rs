//! Request-scoped pagination and sorting types. Nothing here is persisted.

use crate::services::pagination::PageError;
use serde::Serialize;
use std::str::FromStr;

/// Ordering axis for listings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortKey {
    /// Lexicographic on filename.
    Name,
    /// Numeric on size, filename breaks ties.
    Size,
    /// Upload time, filename breaks ties.
    Age,
}

impl FromStr for SortKey {
    type Err = PageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "name" | "sort_name" => Ok(Self::Name),
            "size" | "sort_size" => Ok(Self::Size),
            "age" | "sort_age" => Ok(Self::Age),
            other => Err(PageError::InvalidSortKey(other.to_string())),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortDirection {
    Asc,
    Desc,
}

impl FromStr for SortDirection {
    type Err = PageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "asc" => Ok(Self::Asc),
            "desc" => Ok(Self::Desc),
            other => Err(PageError::InvalidDirection(other.to_string())),
        }
    }
}

/// A validated listing request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageRequest {
    /// 1-based page number as requested by the client.
    pub page: u32,
    pub per_page: u32,
    pub sort_key: SortKey,
    pub direction: SortDirection,
}

/// One page of filenames plus the numbers a client needs to render a pager.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct PageResult {
    pub files: Vec<String>,
    pub total_pages: u32,
    /// The page actually served, after clamping out-of-range requests.
    pub page: u32,
    pub per_page: u32,
}
