//! Page slicing for ordered result sets.

use crate::error::{AppError, Result};
use serde::Deserialize;

/// Pagination parameters from the query string.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageQuery {
    /// 0-based page index.
    pub page: Option<String>,
    /// Page size override.
    pub per_page: Option<String>,
}

/// Validated page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// 0-based page index.
    pub index: usize,
    /// Page size, 0 when pagination is disabled.
    pub size: usize,
}

impl PageRequest {
    /// Page `index` of size `size`.
    pub fn new(index: usize, size: usize) -> Self {
        Self { index, size }
    }

    /// Validate raw query values against the configured default and ceiling.
    pub fn from_query(query: &PageQuery, default_size: usize, max_size: usize) -> Result<Self> {
        let index = parse_param("page", query.page.as_deref())?.unwrap_or(0);
        let size = match parse_param("per_page", query.per_page.as_deref())? {
            Some(size) if size > max_size => {
                return Err(AppError::BadRequest(format!(
                    "per_page must not exceed {max_size}"
                )));
            }
            Some(size) => size,
            None => default_size,
        };

        Ok(Self { index, size })
    }
}

fn parse_param(name: &str, raw: Option<&str>) -> Result<Option<usize>> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => value
            .parse::<usize>()
            .map(Some)
            .map_err(|_| AppError::BadRequest(format!("{name} must be a non-negative integer"))),
    }
}

/// One page of an ordered sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    /// Items on this page.
    pub items: Vec<T>,
    /// 0-based page index.
    pub index: usize,
    /// Page size, 0 when pagination is disabled.
    pub size: usize,
    /// Length of the whole sequence.
    pub total: usize,
    /// Whether a prior page exists.
    pub has_previous: bool,
    /// Whether a further page exists.
    pub has_next: bool,
}

impl<T> Page<T> {
    /// Whether the sequence is split into pages.
    pub fn is_paginated(&self) -> bool {
        self.size > 0
    }

    /// Index of the last page.
    pub fn last_index(&self) -> usize {
        if self.size == 0 || self.total == 0 {
            0
        } else {
            (self.total - 1) / self.size
        }
    }

    /// Offset of the first item of this page in the whole sequence.
    pub fn start_index(&self) -> usize {
        self.index.saturating_mul(self.size)
    }

    /// Number of pages, at least one.
    pub fn page_count(&self) -> usize {
        self.last_index() + 1
    }

    /// Transform the items while keeping page metadata.
    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            index: self.index,
            size: self.size,
            total: self.total,
            has_previous: self.has_previous,
            has_next: self.has_next,
        }
    }
}

/// Cut `items` down to the page described by `request`.
pub fn paginate<T>(items: Vec<T>, request: PageRequest) -> Page<T> {
    let total = items.len();

    if request.size == 0 {
        return Page {
            items,
            index: 0,
            size: 0,
            total,
            has_previous: false,
            has_next: false,
        };
    }

    let start = request.index.saturating_mul(request.size).min(total);
    let end = request
        .index
        .saturating_add(1)
        .saturating_mul(request.size)
        .min(total);

    Page {
        items: items.into_iter().skip(start).take(end - start).collect(),
        index: request.index,
        size: request.size,
        total,
        has_previous: request.index > 0,
        has_next: end < total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(page: Option<&str>, per_page: Option<&str>) -> PageQuery {
        PageQuery {
            page: page.map(String::from),
            per_page: per_page.map(String::from),
        }
    }

    #[test]
    fn pages_reassemble_the_sequence() {
        for total in [0usize, 1, 7, 24, 25, 26, 99] {
            for size in [1usize, 3, 10, 25] {
                let items: Vec<usize> = (0..total).collect();
                let pages = total.div_ceil(size).max(1);
                let mut joined = Vec::new();

                for index in 0..pages {
                    let page = paginate(items.clone(), PageRequest::new(index, size));
                    assert_eq!(page.page_count(), pages);
                    joined.extend(page.items);
                }

                assert_eq!(joined, items, "total={total} size={size}");
            }
        }
    }

    #[test]
    fn zero_size_is_one_page() {
        let page = paginate((0..40).collect::<Vec<_>>(), PageRequest::new(3, 0));

        assert_eq!(page.items.len(), 40);
        assert!(!page.is_paginated());
        assert!(!page.has_next);
        assert!(!page.has_previous);
    }

    #[test]
    fn flags_follow_position() {
        let items: Vec<u32> = (0..30).collect();

        let first = paginate(items.clone(), PageRequest::new(0, 25));
        assert_eq!(first.items.len(), 25);
        assert!(first.has_next);
        assert!(!first.has_previous);
        assert_eq!(first.last_index(), 1);

        let second = paginate(items, PageRequest::new(1, 25));
        assert_eq!(second.items, (25..30).collect::<Vec<_>>());
        assert!(!second.has_next);
        assert!(second.has_previous);
        assert_eq!(second.start_index(), 25);
    }

    #[test]
    fn out_of_range_page_is_empty() {
        let page = paginate(vec![1, 2, 3], PageRequest::new(10, 2));

        assert!(page.items.is_empty());
        assert!(page.has_previous);
        assert!(!page.has_next);
    }

    #[test]
    fn huge_index_does_not_overflow() {
        let page = paginate(vec![1, 2, 3], PageRequest::new(usize::MAX, 2));
        assert!(page.items.is_empty());
    }

    #[test]
    fn query_defaults_and_overrides() {
        let request = PageRequest::from_query(&query(None, None), 25, 100).unwrap();
        assert_eq!(request, PageRequest::new(0, 25));

        let request = PageRequest::from_query(&query(Some("2"), Some("10")), 25, 100).unwrap();
        assert_eq!(request, PageRequest::new(2, 10));

        let request = PageRequest::from_query(&query(Some(""), Some("")), 25, 100).unwrap();
        assert_eq!(request, PageRequest::new(0, 25));
    }

    #[test]
    fn query_rejects_bad_values() {
        assert!(matches!(
            PageRequest::from_query(&query(Some("abc"), None), 25, 100),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            PageRequest::from_query(&query(Some("-1"), None), 25, 100),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            PageRequest::from_query(&query(None, Some("101")), 25, 100),
            Err(AppError::BadRequest(_))
        ));
    }
}
