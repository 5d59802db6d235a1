//! Offset/limit pages over ordered collections.

use serde::{Deserialize, Serialize};

/// Limits for one kind of paged read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitRange {
    pub default: usize,
    pub max: usize,
}

pub const DIRECTORIES_LIMIT: LimitRange = LimitRange { default: 50, max: 400 };
pub const RECENT_LIMIT: LimitRange = LimitRange { default: 40, max: 40 };
pub const RUNNING_LIMIT: LimitRange = LimitRange { default: 40, max: 400 };

/// Clamp a requested limit into `1..=range.max`; a missing or zero limit takes
/// the default.
pub fn clamp_limit(requested: Option<usize>, range: LimitRange) -> usize {
    match requested {
        Some(0) | None => range.default,
        Some(limit) => limit.min(range.max),
    }
}

/// A page as exchanged with the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
    pub has_more: bool,
    pub next_offset: Option<usize>,
}

impl<T> Default for Page<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            total: 0,
            offset: 0,
            limit: 0,
            has_more: false,
            next_offset: None,
        }
    }
}

/// Slice `items` into a page. An offset past the end yields an empty page.
pub fn page<T: Clone>(items: &[T], offset: usize, limit: usize) -> Page<T> {
    let total = items.len();
    let offset = offset.min(total);
    let end = offset.saturating_add(limit).min(total);
    let has_more = end < total;
    Page {
        items: items[offset..end].to_vec(),
        total,
        offset,
        limit,
        has_more,
        next_offset: has_more.then_some(end),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_reports_next_offset() {
        let items: Vec<u32> = (0..5).collect();
        let first = page(&items, 0, 2);
        assert_eq!(first.items, vec![0, 1]);
        assert!(first.has_more);
        assert_eq!(first.next_offset, Some(2));

        let last = page(&items, 4, 2);
        assert_eq!(last.items, vec![4]);
        assert!(!last.has_more);
        assert_eq!(last.next_offset, None);
    }

    #[test]
    fn test_offset_past_end_is_empty() {
        let items = vec!["a"];
        let empty = page(&items, 10, 5);
        assert!(empty.items.is_empty());
        assert_eq!(empty.offset, 1);
        assert_eq!(empty.total, 1);
    }

    #[test]
    fn test_clamp_limit() {
        assert_eq!(clamp_limit(None, RECENT_LIMIT), 40);
        assert_eq!(clamp_limit(Some(0), DIRECTORIES_LIMIT), 50);
        assert_eq!(clamp_limit(Some(1000), RUNNING_LIMIT), 400);
        assert_eq!(clamp_limit(Some(100), RECENT_LIMIT), 40);
        assert_eq!(clamp_limit(Some(7), RECENT_LIMIT), 7);
    }
}
