//! Shared cache of last-known-committed row snapshots.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{trace, warn};

use super::event::{Event, EventBus, EventKind, SnapshotEvent};
use super::snapshot::DataRow;
use crate::object::{ObjectId, SessionHandle};

/// Configuration for a [`SnapshotCache`].
#[derive(Debug, Clone)]
pub struct SnapshotCacheConfig {
    /// Cache name, used in log output.
    pub name: String,
    /// Maximum number of cached rows before LRU eviction.
    pub max_size: usize,
    /// Declared time-based expiration. Carried in the configuration for
    /// adapters that enforce it; the in-memory cache evicts by LRU only.
    pub snapshot_ttl: Option<Duration>,
}

impl Default for SnapshotCacheConfig {
    fn default() -> Self {
        Self {
            name: "default".into(),
            max_size: 10_000,
            snapshot_ttl: None,
        }
    }
}

struct CacheEntry {
    row: DataRow,
    last_used: u64,
}

struct Lru {
    map: HashMap<ObjectId, CacheEntry>,
    tick: u64,
}

impl Lru {
    fn touch(&mut self, id: &ObjectId) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(entry) = self.map.get_mut(id) {
            entry.last_used = tick;
        }
    }

    fn insert(&mut self, id: ObjectId, row: DataRow) {
        self.tick += 1;
        let last_used = self.tick;
        self.map.insert(id, CacheEntry { row, last_used });
    }

    fn evict_over(&mut self, max_size: usize) -> Vec<ObjectId> {
        let mut evicted = Vec::new();
        while self.map.len() > max_size {
            let oldest = self
                .map
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    self.map.remove(&id);
                    evicted.push(id);
                }
                None => break,
            }
        }
        evicted
    }
}

/// Bounded, internally synchronized cache of the last known committed
/// database state, shared by every session attached to one domain.
///
/// All cache mutation funnels through [`SnapshotCache::process_snapshot_changes`],
/// which reconciles incoming rows against cached versions and broadcasts a
/// change event to subscribers.
///
/// Lock ordering: a thread holding an `ObjectStore` lock may acquire this
/// cache's lock, never the reverse. Event callbacks run after the cache lock
/// has been released.
pub struct SnapshotCache {
    config: SnapshotCacheConfig,
    inner: Mutex<Lru>,
    bus: Arc<EventBus>,
}

impl SnapshotCache {
    /// Create a cache with the given configuration.
    pub fn new(config: SnapshotCacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Lru {
                map: HashMap::new(),
                tick: 0,
            }),
            bus: Arc::new(EventBus::new()),
        }
    }

    /// Create a cache with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(SnapshotCacheConfig::default())
    }

    /// The event bus snapshot events are posted to.
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Cache configuration.
    pub fn config(&self) -> &SnapshotCacheConfig {
        &self.config
    }

    /// O(1) lookup of a cached row. Never fetches.
    pub fn get_cached_snapshot(&self, id: &ObjectId) -> Option<DataRow> {
        let mut inner = self.inner.lock();
        inner.touch(id);
        inner.map.get(id).map(|e| e.row.clone())
    }

    /// Number of cached rows.
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().map.is_empty()
    }

    /// Drop one cached row without posting an event.
    pub fn forget_snapshot(&self, id: &ObjectId) {
        self.inner.lock().map.remove(id);
    }

    /// Store a freshly fetched row, bypassing version reconciliation and
    /// event posting. Used by fetch paths that are not change notifications.
    pub fn put_snapshot(&self, id: ObjectId, row: DataRow) {
        let mut inner = self.inner.lock();
        inner.insert(id, row);
        let evicted = inner.evict_over(self.config.max_size);
        if !evicted.is_empty() {
            trace!(cache = %self.config.name, count = evicted.len(), "evicted snapshots");
        }
    }

    /// The single choke point for all cache mutation.
    ///
    /// For each updated id: with no prior row the snapshot is inserted
    /// as-is; with a prior row a column-level merge is applied only when the
    /// incoming row's `replaces_version` matches the cached version;
    /// otherwise the entry is forgotten entirely, forcing a refetch rather
    /// than a possibly incorrect merge. Deleted and invalidated ids are
    /// evicted. A change event is posted synchronously afterwards, unless
    /// every change collection is empty.
    pub fn process_snapshot_changes(
        &self,
        posted_by: Option<SessionHandle>,
        updated: Vec<(ObjectId, DataRow)>,
        deleted: Vec<ObjectId>,
        invalidated: Vec<ObjectId>,
        indirectly_modified: Vec<ObjectId>,
    ) {
        if updated.is_empty()
            && deleted.is_empty()
            && invalidated.is_empty()
            && indirectly_modified.is_empty()
        {
            warn!(cache = %self.config.name, "bogus snapshot change event with no changes");
            return;
        }

        let mut applied: HashMap<ObjectId, DataRow> = HashMap::new();
        {
            let mut inner = self.inner.lock();
            for id in deleted.iter().chain(invalidated.iter()) {
                inner.map.remove(id);
            }
            for (id, row) in updated {
                let merged = match inner.map.get(&id) {
                    None => None,
                    Some(entry) if row.replaces_version() == Some(entry.row.version()) => {
                        Some(entry.row.apply_diff(&row))
                    }
                    Some(entry) => {
                        // Conflict: cannot merge safely, must refetch.
                        trace!(
                            cache = %self.config.name,
                            id = %id,
                            cached_version = entry.row.version(),
                            replaces = ?row.replaces_version(),
                            "snapshot version mismatch, forgetting entry"
                        );
                        inner.map.remove(&id);
                        continue;
                    }
                };
                applied.insert(id.clone(), row.clone());
                inner.insert(id, merged.unwrap_or(row));
            }
            let evicted = inner.evict_over(self.config.max_size);
            if !evicted.is_empty() {
                trace!(cache = %self.config.name, count = evicted.len(), "evicted snapshots");
            }
        }

        let event = SnapshotEvent {
            posted_by,
            updated: applied,
            deleted,
            invalidated,
            indirectly_modified,
        };
        self.bus
            .publish(EventKind::SnapshotsChanged, &Event::Snapshots(event));
    }
}
