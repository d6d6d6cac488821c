//! Pagination types and the page envelope shaper
//!
//! # Example
//!
//! ```rust
//! use polystore::repository::{shape, Pagination};
//!
//! let pagination = Pagination::page(2, 10);
//! assert_eq!(pagination.offset, 10);
//!
//! let result = shape((0..10).collect::<Vec<_>>(), 2, 10, 25);
//! assert_eq!(result.pages, 3);
//! assert_eq!(result.data.len(), 10);
//! ```

use serde::Serialize;

use super::filter::{Filter, Sort};

/// Offset/limit window over a result set
///
/// # Example
///
/// ```rust
/// use polystore::repository::Pagination;
///
/// let page1 = Pagination::first_page(20);
/// assert_eq!(page1.offset, 0);
///
/// let page3 = Pagination::page(3, 20);
/// assert_eq!(page3.offset, 40);
/// assert_eq!(page3.limit, 20);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    /// Number of results to skip
    pub offset: u64,
    /// Maximum number of results to return
    pub limit: u64,
}

impl Pagination {
    /// Create new pagination parameters
    #[must_use]
    pub const fn new(offset: u64, limit: u64) -> Self {
        Self { offset, limit }
    }

    /// Create pagination for the first page with the given limit
    #[must_use]
    pub const fn first_page(limit: u64) -> Self {
        Self { offset: 0, limit }
    }

    /// Create pagination for a specific page number (1-indexed)
    ///
    /// Page numbers below 1 are treated as page 1.
    #[must_use]
    pub const fn page(page_number: u64, page_size: u64) -> Self {
        Self {
            offset: page_number.saturating_sub(1).saturating_mul(page_size),
            limit: page_size,
        }
    }
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 20,
        }
    }
}

/// Ordering and windowing for list reads
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryOptions {
    /// Result ordering
    pub sort: Option<Sort>,
    /// Result window
    pub pagination: Option<Pagination>,
}

impl QueryOptions {
    /// Options with no ordering and no window
    pub fn new() -> Self {
        Self::default()
    }

    /// Order results by a sort string such as `"-created_at,name"`
    #[must_use]
    pub fn sort(mut self, sort: impl Into<Sort>) -> Self {
        self.sort = Some(sort.into());
        self
    }

    /// Restrict results to a window
    #[must_use]
    pub fn paginate(mut self, pagination: Pagination) -> Self {
        self.pagination = Some(pagination);
        self
    }
}

/// Request for one page of results
#[derive(Debug, Clone, PartialEq)]
pub struct PageOptions {
    /// Caller filter
    pub filter: Filter,
    /// 1-based page number
    pub page: u64,
    /// Page size
    pub limit: u64,
    /// Result ordering
    pub sort: Option<Sort>,
}

impl PageOptions {
    /// Request page `page` of size `limit`
    pub fn new(page: u64, limit: u64) -> Self {
        Self {
            filter: Filter::new(),
            page,
            limit,
            sort: None,
        }
    }

    /// Restrict the page to records matching `filter`
    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    /// Order results by a sort string
    #[must_use]
    pub fn sort(mut self, sort: impl Into<Sort>) -> Self {
        self.sort = Some(sort.into());
        self
    }

    /// Window to fetch for this page
    ///
    /// A zero limit fetches a single record.
    pub fn pagination(&self) -> Pagination {
        Pagination::page(self.page, effective_limit(self.limit))
    }
}

impl Default for PageOptions {
    fn default() -> Self {
        Self::new(1, Pagination::default().limit)
    }
}

/// Uniform envelope for one page of results
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageResult<T> {
    /// Records on this page
    pub data: Vec<T>,
    /// Requested page, echoed back
    pub page: u64,
    /// Requested page size, echoed back
    pub limit: u64,
    /// Total matching records across all pages
    pub total: u64,
    /// Number of pages, never less than 1
    pub pages: u64,
}

impl<T> PageResult<T> {
    /// Convert every record, keeping the envelope
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> PageResult<U> {
        PageResult {
            data: self.data.into_iter().map(f).collect(),
            page: self.page,
            limit: self.limit,
            total: self.total,
            pages: self.pages,
        }
    }

    /// Whether a later page exists
    pub fn has_next(&self) -> bool {
        self.page < self.pages
    }
}

fn effective_limit(limit: u64) -> u64 {
    limit.max(1)
}

/// Offset of the first record on `page`
pub fn offset(page: u64, limit: u64) -> u64 {
    page.saturating_sub(1).saturating_mul(limit)
}

/// Build the page envelope from a data slice and a total count
///
/// `pages = max(1, ceil(total / limit))`. A zero `limit` is divided as 1 but
/// echoed back unchanged. `data` is truncated to the effective limit.
pub fn shape<T>(mut data: Vec<T>, page: u64, limit: u64, total: u64) -> PageResult<T> {
    let divisor = effective_limit(limit);
    let pages = total.div_ceil(divisor).max(1);
    data.truncate(usize::try_from(divisor).unwrap_or(usize::MAX));
    PageResult {
        data,
        page,
        limit,
        total,
        pages,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pagination_page() {
        assert_eq!(Pagination::page(1, 10), Pagination::new(0, 10));
        assert_eq!(Pagination::page(3, 20).offset, 40);
        assert_eq!(Pagination::page(0, 20).offset, 0);
    }

    #[test]
    fn test_pagination_default() {
        let pagination = Pagination::default();
        assert_eq!(pagination.offset, 0);
        assert_eq!(pagination.limit, 20);
    }

    #[test]
    fn test_offset() {
        assert_eq!(offset(2, 10), 10);
        assert_eq!(offset(0, 10), 0);
        assert_eq!(offset(1, 0), 0);
    }

    #[test]
    fn test_pages_is_ceiling() {
        for (total, limit, expected) in [(0, 10, 1), (1, 10, 1), (10, 10, 1), (11, 10, 2), (25, 10, 3)] {
            let result = shape(Vec::<u8>::new(), 1, limit, total);
            assert_eq!(result.pages, expected, "total={} limit={}", total, limit);
        }
    }

    #[test]
    fn test_zero_limit_does_not_panic() {
        let result = shape(vec![1, 2, 3], 1, 0, 3);
        assert_eq!(result.limit, 0);
        assert_eq!(result.pages, 3);
        assert_eq!(result.data, vec![1]);
    }

    #[test]
    fn test_data_truncated_to_limit() {
        let result = shape((0..15).collect::<Vec<_>>(), 2, 10, 25);
        assert_eq!(result.data.len(), 10);
        assert_eq!(result.page, 2);
        assert_eq!(result.pages, 3);
        assert!(result.has_next());
    }

    #[test]
    fn test_page_options_window() {
        let options = PageOptions::new(3, 25).sort("-name");
        assert_eq!(options.pagination(), Pagination::new(50, 25));
        assert_eq!(PageOptions::new(1, 0).pagination().limit, 1);
    }

    #[test]
    fn test_map_keeps_envelope() {
        let result = shape(vec![1, 2], 1, 2, 4).map(|n| n * 10);
        assert_eq!(result.data, vec![10, 20]);
        assert_eq!(result.pages, 2);
    }
}
