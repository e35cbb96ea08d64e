//! Keyed caching of query results.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::access::snapshot::DataRow;

use super::incremental::IncrementalList;

/// A cached select result: the shared main row list plus prefetch
/// sub-results. Handing out clones shares the underlying lists.
#[derive(Debug, Clone, Default)]
pub struct CachedResult {
    /// Main rows.
    pub rows: Arc<Vec<DataRow>>,
    /// Prefetch rows by relationship path.
    pub prefetch_rows: BTreeMap<String, Arc<Vec<DataRow>>>,
}

/// Cache of query results and paginated id lists, keyed by the query's
/// cache key. Entries live until explicitly refreshed or removed; row
/// staleness is governed by the snapshot layer, not here.
#[derive(Default)]
pub struct QueryCache {
    results: Mutex<HashMap<String, CachedResult>>,
    lists: Mutex<HashMap<String, Arc<IncrementalList>>>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored result for a key, sharing the row lists.
    pub fn get(&self, key: &str) -> Option<CachedResult> {
        let hit = self.results.lock().get(key).cloned();
        trace!(key, hit = hit.is_some(), "query cache lookup");
        hit
    }

    /// Store a result under a key, replacing any previous entry.
    pub fn put(&self, key: impl Into<String>, result: CachedResult) {
        self.results.lock().insert(key.into(), result);
    }

    /// Drop a stored result.
    pub fn remove(&self, key: &str) {
        self.results.lock().remove(key);
    }

    /// Stored paginated list for a key.
    pub fn get_list(&self, key: &str) -> Option<Arc<IncrementalList>> {
        self.lists.lock().get(key).cloned()
    }

    /// Store a paginated list under a key.
    pub fn put_list(&self, key: impl Into<String>, list: Arc<IncrementalList>) {
        self.lists.lock().insert(key.into(), list);
    }

    /// Drop a stored paginated list.
    pub fn remove_list(&self, key: &str) {
        self.lists.lock().remove(key);
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.results.lock().clear();
        self.lists.lock().clear();
    }
}
