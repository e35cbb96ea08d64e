//! Paginated results resolved one page at a time.

use parking_lot::Mutex;
use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::object::ObjectId;

/// The id list of a paginated query.
///
/// The initial fetch resolves identities only; each page's full rows are
/// fetched on first access, driven by the owning context. The list itself
/// only tracks which pages have been resolved.
pub struct IncrementalList {
    entity: String,
    page_size: usize,
    ids: Vec<ObjectId>,
    resolved: Mutex<HashSet<usize>>,
}

impl IncrementalList {
    /// Wrap a fetched id list. `page_size` must be non-zero.
    pub fn new(entity: impl Into<String>, page_size: usize, ids: Vec<ObjectId>) -> Result<Self> {
        if page_size == 0 {
            return Err(Error::Query("page size must be non-zero".to_string()));
        }
        Ok(Self {
            entity: entity.into(),
            page_size,
            ids,
            resolved: Mutex::new(HashSet::new()),
        })
    }

    /// Root entity of the paginated query.
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Total number of objects.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Configured page size.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of pages, counting a trailing partial page.
    pub fn page_count(&self) -> usize {
        self.ids.len().div_ceil(self.page_size)
    }

    /// Ids of one page.
    pub fn page_ids(&self, page: usize) -> Result<&[ObjectId]> {
        let start = page * self.page_size;
        if start >= self.ids.len() && !(page == 0 && self.ids.is_empty()) {
            return Err(Error::Query(format!(
                "page {page} out of range for {} objects",
                self.ids.len()
            )));
        }
        let end = (start + self.page_size).min(self.ids.len());
        Ok(&self.ids[start..end])
    }

    /// Whether a page's rows have been fetched.
    pub fn is_page_resolved(&self, page: usize) -> bool {
        self.resolved.lock().contains(&page)
    }

    /// Mark a page's rows fetched.
    pub fn mark_page_resolved(&self, page: usize) {
        self.resolved.lock().insert(page);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn ids(n: usize) -> Vec<ObjectId> {
        (0..n)
            .map(|i| ObjectId::with_single_key("Artist", "ID", Value::Int64(i as i64)))
            .collect()
    }

    #[test]
    fn test_page_boundaries() {
        let list = IncrementalList::new("Artist", 4, ids(10)).unwrap();
        assert_eq!(list.page_count(), 3);
        assert_eq!(list.page_ids(0).unwrap().len(), 4);
        assert_eq!(list.page_ids(2).unwrap().len(), 2);
        assert!(list.page_ids(3).is_err());
    }

    #[test]
    fn test_resolution_tracking() {
        let list = IncrementalList::new("Artist", 4, ids(10)).unwrap();
        assert!(!list.is_page_resolved(1));
        list.mark_page_resolved(1);
        assert!(list.is_page_resolved(1));
        assert!(!list.is_page_resolved(0));
    }

    #[test]
    fn test_zero_page_size_rejected() {
        assert!(IncrementalList::new("Artist", 0, ids(1)).is_err());
    }
}
