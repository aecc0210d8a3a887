//! # Pagination Support
//!
//! Offset pagination for collection scans.

use serde::{Deserialize, Serialize};

/// Pagination parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

impl Pagination {
    /// Create new pagination with limit and offset
    pub fn new(limit: u32, offset: u32) -> Self {
        Self { limit, offset }
    }

    /// Create pagination for a specific page (1-indexed)
    pub fn page(page: u32, page_size: u32) -> Self {
        let offset = page.saturating_sub(1).saturating_mul(page_size);
        Self {
            limit: page_size,
            offset,
        }
    }

    /// Get the page number (1-indexed)
    pub fn page_number(&self) -> u32 {
        if self.limit == 0 {
            1
        } else {
            (self.offset / self.limit) + 1
        }
    }

    /// Get the next page pagination
    pub fn next_page(&self) -> Self {
        Self {
            limit: self.limit,
            offset: self.offset.saturating_add(self.limit),
        }
    }
}

/// One page of a collection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page_number: u32,
    pub page_size: u32,
    pub total_count: u64,
    pub total_pages: u32,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, pagination: &Pagination, total_count: u64) -> Self {
        let total_pages = if pagination.limit == 0 {
            1
        } else {
            let size = u64::from(pagination.limit);
            (total_count.div_ceil(size).max(1)).min(u64::from(u32::MAX)) as u32
        };

        Self {
            items,
            page_number: pagination.page_number(),
            page_size: pagination.limit,
            total_count,
            total_pages,
        }
    }

    /// Check if there's a next page
    pub fn has_next_page(&self) -> bool {
        self.page_number < self.total_pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_offsets() {
        assert_eq!(Pagination::page(1, 20), Pagination::new(20, 0));
        assert_eq!(Pagination::page(3, 20), Pagination::new(20, 40));
        assert_eq!(Pagination::page(0, 20).offset, 0);
        assert_eq!(Pagination::new(20, 40).page_number(), 3);
        assert_eq!(Pagination::new(20, 0).next_page().offset, 20);
    }

    #[test]
    fn test_page_totals() {
        let page = Page::new(vec![1, 2], &Pagination::page(1, 2), 5);
        assert_eq!(page.total_pages, 3);
        assert!(page.has_next_page());

        let empty: Page<u8> = Page::new(Vec::new(), &Pagination::page(1, 10), 0);
        assert_eq!(empty.total_pages, 1);
        assert!(!empty.has_next_page());
    }
}
