//! Pagination parameters and the listing envelope.
//!
//! Two layers apply pagination rules. The HTTP boundary rejects values
//! outside `1..=MAX_LIMIT` / `>= 0` via [`PageRequest::parse`]; the record
//! service then applies defaults with [`PageRequest::normalized`] for callers
//! that bypass the boundary.

use serde::{Deserialize, Serialize};

/// Page size used when the caller supplies none (or a non-positive one).
pub const DEFAULT_LIMIT: i64 = 10;

/// Largest page size accepted at the HTTP boundary.
pub const MAX_LIMIT: i64 = 100;

/// Rejection reasons for raw pagination query parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PageParamError {
    #[error("Invalid limit parameter")]
    InvalidLimit,
    #[error("Invalid offset parameter")]
    InvalidOffset,
}

/// Requested window over a listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub limit: i64,
    pub offset: i64,
}

impl PageRequest {
    #[must_use]
    pub fn new(limit: i64, offset: i64) -> Self {
        Self { limit, offset }
    }

    /// Parses raw query parameters as received at the HTTP boundary.
    ///
    /// Missing values take the defaults (`limit = 10`, `offset = 0`).
    ///
    /// # Errors
    ///
    /// Returns [`PageParamError::InvalidLimit`] when `limit` is not an integer
    /// in `1..=100`, and [`PageParamError::InvalidOffset`] when `offset` is not
    /// a non-negative integer.
    pub fn parse(limit: Option<&str>, offset: Option<&str>) -> Result<Self, PageParamError> {
        let limit = match limit {
            None => DEFAULT_LIMIT,
            Some(raw) => raw
                .trim()
                .parse::<i64>()
                .ok()
                .filter(|l| (1..=MAX_LIMIT).contains(l))
                .ok_or(PageParamError::InvalidLimit)?,
        };
        let offset = match offset {
            None => 0,
            Some(raw) => raw
                .trim()
                .parse::<i64>()
                .ok()
                .filter(|o| *o >= 0)
                .ok_or(PageParamError::InvalidOffset)?,
        };
        Ok(Self { limit, offset })
    }

    /// Applies service-level defaults: `limit <= 0` becomes 10, `offset < 0`
    /// becomes 0. No upper bound is applied here.
    #[must_use]
    pub fn normalized(self) -> Self {
        Self {
            limit: if self.limit <= 0 {
                DEFAULT_LIMIT
            } else {
                self.limit
            },
            offset: self.offset.max(0),
        }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
            offset: 0,
        }
    }
}

/// Listing envelope: page items, total matching records, echoed window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub limit: i64,
    pub offset: i64,
}
