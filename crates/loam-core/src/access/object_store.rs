//! Per-session registry of live objects and their pending diffs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::snapshot::DataRow;
use super::snapshot_cache::SnapshotCache;
use crate::error::{Error, Result};
use crate::graph::{GraphDiff, GraphOp, ObjectDiff};
use crate::map::EntityResolver;
use crate::object::{ObjectId, PersistenceState, Persistent, SessionHandle};
use crate::value::Value;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Pluggable policy hooks for an [`ObjectStore`].
///
/// The default implementation approves every merge.
pub trait ObjectStoreDelegate: Send + Sync {
    /// Whether an externally changed snapshot may be merged into a locally
    /// held object. Returning false leaves the object untouched.
    fn should_merge_changes(&self, _id: &ObjectId, _cache_version: u64) -> bool {
        true
    }
}

struct Inner {
    objects: HashMap<ObjectId, Box<dyn Persistent>>,
    diffs: HashMap<ObjectId, ObjectDiff>,
    /// Ids in the order they first became dirty; drives diff composition.
    dirty_order: Vec<ObjectId>,
}

/// Single source of truth, per session, for which live objects exist and
/// what has changed.
///
/// The store owns objects in an identity-keyed table; callers address them
/// by [`ObjectId`] and mutate them through the `record_*` operations so that
/// every change is captured in the object's diff. The store is internally
/// synchronized.
///
/// Lock ordering: the store's own lock is always acquired before the shared
/// [`SnapshotCache`] lock, never the reverse.
pub struct ObjectStore {
    handle: SessionHandle,
    cache: Arc<SnapshotCache>,
    resolver: Arc<EntityResolver>,
    delegate: Option<Arc<dyn ObjectStoreDelegate>>,
    inner: Mutex<Inner>,
}

impl ObjectStore {
    /// Create a store attached to a shared snapshot cache.
    pub fn new(cache: Arc<SnapshotCache>, resolver: Arc<EntityResolver>) -> Self {
        Self {
            handle: SessionHandle(NEXT_SESSION.fetch_add(1, Ordering::Relaxed)),
            cache,
            resolver,
            delegate: None,
            inner: Mutex::new(Inner {
                objects: HashMap::new(),
                diffs: HashMap::new(),
                dirty_order: Vec::new(),
            }),
        }
    }

    /// Install a delegate.
    pub fn set_delegate(&mut self, delegate: Arc<dyn ObjectStoreDelegate>) {
        self.delegate = Some(delegate);
    }

    /// This store's session handle.
    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    /// The shared snapshot cache.
    pub fn snapshot_cache(&self) -> &Arc<SnapshotCache> {
        &self.cache
    }

    /// Number of registered objects.
    pub fn len(&self) -> usize {
        self.inner.lock().objects.len()
    }

    /// Whether no objects are registered.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().objects.is_empty()
    }

    /// Insert an object into the identity map under `id`.
    ///
    /// Re-registration under the same identity overwrites: the previous
    /// instance and its pending diff are dropped.
    pub fn register_node(&self, id: ObjectId, mut object: Box<dyn Persistent>) {
        object.set_object_id(Some(id.clone()));
        object.set_session(Some(self.handle));
        let mut inner = self.inner.lock();
        if inner.objects.insert(id.clone(), object).is_some() {
            inner.diffs.remove(&id);
            inner.dirty_order.retain(|d| d != &id);
        }
    }

    /// Remove objects from the identity map, detaching them.
    pub fn unregister_nodes(&self, ids: &[ObjectId]) {
        let mut inner = self.inner.lock();
        for id in ids {
            if let Some(mut object) = inner.objects.remove(id) {
                object.set_session(None);
                object.set_object_id(None);
                object.set_persistence_state(PersistenceState::Transient);
            }
            inner.diffs.remove(id);
            inner.dirty_order.retain(|d| d != id);
        }
    }

    /// Run a closure against a registered object.
    pub fn with_object<R>(
        &self,
        id: &ObjectId,
        f: impl FnOnce(&mut dyn Persistent) -> R,
    ) -> Option<R> {
        let mut inner = self.inner.lock();
        inner.objects.get_mut(id).map(|o| f(o.as_mut()))
    }

    /// Persistence state of a registered object.
    pub fn object_state(&self, id: &ObjectId) -> Option<PersistenceState> {
        self.with_object(id, |o| o.persistence_state())
    }

    /// Read a property of a registered object.
    pub fn read_property(&self, id: &ObjectId, property: &str) -> Option<Value> {
        self.with_object(id, |o| o.read_property(property)).flatten()
    }

    /// Arc targets of a registered object.
    pub fn arc_targets(&self, id: &ObjectId, arc: &str) -> Vec<ObjectId> {
        self.with_object(id, |o| o.arc_targets(arc)).unwrap_or_default()
    }

    /// All registered ids.
    pub fn registered_ids(&self) -> Vec<ObjectId> {
        self.inner.lock().objects.keys().cloned().collect()
    }

    /// Ids with pending diffs, in first-dirty order.
    pub fn dirty_ids(&self) -> Vec<ObjectId> {
        self.inner.lock().dirty_order.clone()
    }

    /// Record an object as newly created: Transient -> New plus a creation
    /// op in the diff.
    pub fn record_object_created(&self, id: &ObjectId) -> Result<()> {
        let mut inner = self.inner.lock();
        let object = inner
            .objects
            .get_mut(id)
            .ok_or_else(|| Error::NotManaged(id.to_string()))?;
        let next = object.persistence_state().transition(PersistenceState::New)?;
        object.set_persistence_state(next);
        Self::record_op(&mut inner, id, GraphOp::NodeCreated);
        Ok(())
    }

    /// Record an object as deleted.
    ///
    /// Deleting an object this store does not own, or one with no identity,
    /// is fatal.
    pub fn record_object_deleted(&self, id: &ObjectId) -> Result<()> {
        let mut inner = self.inner.lock();
        let object = inner
            .objects
            .get_mut(id)
            .ok_or_else(|| Error::NotManaged(id.to_string()))?;
        if object.session() != Some(self.handle) || object.object_id().is_none() {
            return Err(Error::NotManaged(id.to_string()));
        }
        let next = object
            .persistence_state()
            .transition(PersistenceState::Deleted)?;
        object.set_persistence_state(next);
        Self::record_op(&mut inner, id, GraphOp::NodeRemoved);
        Ok(())
    }

    /// Record a scalar property write, performing the write itself.
    ///
    /// Registering a diff against a Committed object transitions it to
    /// Modified. Before the first local change is recorded, a stale object
    /// (snapshot version behind the cache) is reconciled with the cached row
    /// through the delegate-mediated merge, so a concurrent external update
    /// is never silently discarded.
    pub fn record_property_changed(
        &self,
        id: &ObjectId,
        property: &str,
        new_value: Value,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.objects.contains_key(id) {
            return Err(Error::NotManaged(id.to_string()));
        }
        self.ensure_mutable(&mut inner, id)?;
        let object = inner.objects.get_mut(id).expect("checked above");
        let old_value = object.read_property(property).unwrap_or(Value::Null);
        object.write_property(property, new_value.clone());
        Self::record_op(
            &mut inner,
            id,
            GraphOp::PropertyChanged {
                property: property.to_string(),
                old_value,
                new_value,
            },
        );
        Ok(())
    }

    /// Record an arc creation, updating the object's arc targets.
    pub fn record_arc_created(&self, id: &ObjectId, target: ObjectId, arc: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.objects.contains_key(id) {
            return Err(Error::NotManaged(id.to_string()));
        }
        self.ensure_mutable(&mut inner, id)?;
        let object = inner.objects.get_mut(id).expect("checked above");
        object.add_arc_target(arc, target.clone());
        Self::record_op(
            &mut inner,
            id,
            GraphOp::ArcCreated {
                target,
                arc: arc.to_string(),
            },
        );
        Ok(())
    }

    /// Record an arc deletion, updating the object's arc targets.
    pub fn record_arc_deleted(&self, id: &ObjectId, target: ObjectId, arc: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if !inner.objects.contains_key(id) {
            return Err(Error::NotManaged(id.to_string()));
        }
        self.ensure_mutable(&mut inner, id)?;
        let object = inner.objects.get_mut(id).expect("checked above");
        object.remove_arc_target(arc, &target);
        Self::record_op(
            &mut inner,
            id,
            GraphOp::ArcDeleted {
                target,
                arc: arc.to_string(),
            },
        );
        Ok(())
    }

    /// Pending diff of one object, if any.
    pub fn object_diff(&self, id: &ObjectId) -> Option<ObjectDiff> {
        self.inner.lock().diffs.get(id).cloned()
    }

    /// Immutable combined diff for the whole pending change set.
    pub fn get_changes(&self) -> GraphDiff {
        let inner = self.inner.lock();
        let mut diff = GraphDiff::new();
        for id in &inner.dirty_order {
            if let Some(object_diff) = inner.diffs.get(id) {
                diff.add_object_diff(id, object_diff);
            }
        }
        diff
    }

    /// Whether any diffs are pending.
    pub fn has_changes(&self) -> bool {
        !self.inner.lock().dirty_order.is_empty()
    }

    /// Roll back all uncommitted changes: New objects become Transient and
    /// are unregistered, Modified and Deleted objects become Hollow (forcing
    /// a lazy re-fetch), and all diffs are discarded.
    pub fn objects_rolled_back(&self) {
        let mut inner = self.inner.lock();
        let dirty = std::mem::take(&mut inner.dirty_order);
        inner.diffs.clear();
        for id in dirty {
            let remove = match inner.objects.get_mut(&id) {
                Some(object) => match object.persistence_state() {
                    PersistenceState::New => {
                        object.set_persistence_state(PersistenceState::Transient);
                        object.set_session(None);
                        object.set_object_id(None);
                        true
                    }
                    PersistenceState::Modified | PersistenceState::Deleted => {
                        object.set_persistence_state(PersistenceState::Hollow);
                        object.clear_data();
                        false
                    }
                    _ => false,
                },
                None => false,
            };
            if remove {
                inner.objects.remove(&id);
            }
        }
        debug!(session = self.handle.0, "rolled back object store changes");
    }

    /// Post-commit bookkeeping: promote replaced ids, finalize deletes, and
    /// reset surviving dirty objects to Committed.
    ///
    /// `replacements` maps pre-commit ids to their permanent ids;
    /// `snapshot_versions` carries the cache version captured for each
    /// post-commit id.
    pub fn graph_committed(
        &self,
        replacements: &[(ObjectId, ObjectId)],
        deleted: &[ObjectId],
        snapshot_versions: &HashMap<ObjectId, u64>,
    ) {
        let mut inner = self.inner.lock();
        for id in deleted {
            if let Some(mut object) = inner.objects.remove(id) {
                object.set_persistence_state(PersistenceState::Transient);
                object.set_session(None);
                object.set_object_id(None);
            }
        }
        for (old_id, new_id) in replacements {
            if let Some(mut object) = inner.objects.remove(old_id) {
                object.set_object_id(Some(new_id.clone()));
                inner.objects.insert(new_id.clone(), object);
            }
        }
        if !replacements.is_empty() {
            // Arcs recorded before the commit still point at pre-commit ids.
            for object in inner.objects.values_mut() {
                for (old_id, new_id) in replacements {
                    object.replace_arc_target(old_id, new_id);
                }
            }
        }
        let dirty = std::mem::take(&mut inner.dirty_order);
        inner.diffs.clear();
        for id in dirty {
            let resolved = replacements
                .iter()
                .find(|(old, _)| old == &id)
                .map(|(_, new)| new.clone())
                .unwrap_or(id);
            if let Some(object) = inner.objects.get_mut(&resolved) {
                if object.persistence_state().is_dirty() {
                    object.set_persistence_state(PersistenceState::Committed);
                }
                if let Some(version) = snapshot_versions.get(&resolved) {
                    object.set_snapshot_version(*version);
                }
            }
        }
        debug!(session = self.handle.0, "object store committed");
    }

    /// Apply a peer-originated snapshot-change event.
    ///
    /// Self-originated events are ignored: the local commit already updated
    /// the objects. For peer events, clean objects absorb the changed
    /// columns; objects with in-flight local edits are only merged when the
    /// delegate approves, so local changes are never silently overwritten.
    pub fn snapshots_changed(&self, event: &super::event::SnapshotEvent) {
        if event.posted_by == Some(self.handle) {
            return;
        }
        let mut inner = self.inner.lock();
        for (id, delta) in &event.updated {
            let locally_changed: Vec<String> = inner
                .diffs
                .get(id)
                .map(|d| d.property_changes().keys().cloned().collect())
                .unwrap_or_default();
            let Some(object) = inner.objects.get_mut(id) else {
                continue;
            };
            let state = object.persistence_state();
            let merge_allowed = match state {
                PersistenceState::Committed => true,
                PersistenceState::Modified => self
                    .delegate
                    .as_ref()
                    .map(|d| d.should_merge_changes(id, delta.version()))
                    .unwrap_or(true),
                _ => false,
            };
            if !merge_allowed {
                continue;
            }
            let entity = match self.resolver.obj_entity(object.entity_name()) {
                Ok(entity) => Arc::clone(entity),
                Err(_) => continue,
            };
            for attribute in &entity.attributes {
                if locally_changed.iter().any(|p| p == &attribute.name) {
                    continue;
                }
                if let Some(value) = delta.get(&attribute.db_attribute) {
                    object.write_property(&attribute.name, value.clone());
                }
            }
            // Track the cache's post-merge version, not the delta's.
            drop(inner);
            let version = self
                .cache
                .get_cached_snapshot(id)
                .map(|row| row.version())
                .unwrap_or_else(|| delta.version());
            inner = self.inner.lock();
            if let Some(object) = inner.objects.get_mut(id) {
                object.set_snapshot_version(version);
            }
        }
        for id in &event.deleted {
            if let Some(mut object) = inner.objects.remove(id) {
                object.set_persistence_state(PersistenceState::Transient);
                object.set_session(None);
                object.set_object_id(None);
            }
            inner.diffs.remove(id);
            inner.dirty_order.retain(|d| d != id);
        }
        for id in event.invalidated.iter().chain(event.indirectly_modified.iter()) {
            if let Some(object) = inner.objects.get_mut(id) {
                if object.persistence_state() == PersistenceState::Committed {
                    object.set_persistence_state(PersistenceState::Hollow);
                    object.clear_data();
                }
            }
        }
    }

    fn record_op(inner: &mut Inner, id: &ObjectId, op: GraphOp) {
        if !inner.diffs.contains_key(id) {
            inner.dirty_order.push(id.clone());
        }
        inner.diffs.entry(id.clone()).or_default().record(op);
    }

    /// Transition a Committed object to Modified before recording a diff,
    /// reconciling a stale snapshot version with the cache first.
    fn ensure_mutable(&self, inner: &mut Inner, id: &ObjectId) -> Result<()> {
        let object = inner.objects.get_mut(id).expect("caller checked presence");
        let state = object.persistence_state();
        if state != PersistenceState::Committed {
            // Hollow objects become Modified on their first write as well.
            if state == PersistenceState::Hollow {
                object.set_persistence_state(PersistenceState::Modified);
            }
            return Ok(());
        }
        let object_version = object.snapshot_version();
        // Store lock is held; acquiring the cache lock here follows the
        // documented lock order.
        if let Some(cached) = self.cache.get_cached_snapshot(id) {
            if cached.version() != object_version {
                let approved = self
                    .delegate
                    .as_ref()
                    .map(|d| d.should_merge_changes(id, cached.version()))
                    .unwrap_or(true);
                if approved {
                    let entity = self.resolver.obj_entity(object.entity_name())?;
                    let object = inner.objects.get_mut(id).expect("caller checked presence");
                    for attribute in &entity.attributes {
                        if let Some(value) = cached.get(&attribute.db_attribute) {
                            object.write_property(&attribute.name, value.clone());
                        }
                    }
                    object.set_snapshot_version(cached.version());
                }
            }
        }
        let object = inner.objects.get_mut(id).expect("caller checked presence");
        let next = object
            .persistence_state()
            .transition(PersistenceState::Modified)?;
        object.set_persistence_state(next);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::{DbAttribute, DbEntity, ObjAttribute, ObjEntity};
    use crate::object::DataObject;

    fn fixture() -> (Arc<SnapshotCache>, Arc<EntityResolver>) {
        let mut resolver = EntityResolver::new();
        resolver.add_db_entity(DbEntity::new(
            "ARTIST",
            vec![DbAttribute::pk("ID"), DbAttribute::new("NAME")],
        ));
        resolver.add_obj_entity(
            ObjEntity::new("Artist", "ARTIST").with_attribute(ObjAttribute::new("name", "NAME")),
        );
        (
            Arc::new(SnapshotCache::with_defaults()),
            Arc::new(resolver),
        )
    }

    fn store() -> ObjectStore {
        let (cache, resolver) = fixture();
        ObjectStore::new(cache, resolver)
    }

    fn register_committed(store: &ObjectStore, key: i64) -> ObjectId {
        let id = ObjectId::with_single_key("Artist", "ID", Value::Int64(key));
        let mut object = DataObject::new("Artist");
        object.set_persistence_state(PersistenceState::Hollow);
        store.register_node(id.clone(), Box::new(object));
        store.with_object(&id, |o| {
            o.set_persistence_state(PersistenceState::Committed);
            o.write_property("name", Value::from("original"));
        });
        id
    }

    #[test]
    fn test_identity_uniqueness_on_reregistration() {
        let store = store();
        let id = ObjectId::temporary("Artist");
        store.register_node(id.clone(), Box::new(DataObject::new("Artist")));
        store.record_object_created(&id).unwrap();
        assert!(store.has_changes());

        // Overwriting registration is last-write-wins and must not leak the
        // previous instance's pending diff.
        store.register_node(id.clone(), Box::new(DataObject::new("Artist")));
        assert_eq!(store.len(), 1);
        assert!(!store.has_changes());
        assert!(store.object_diff(&id).is_none());
    }

    #[test]
    fn test_committed_becomes_modified_on_write() {
        let store = store();
        let id = register_committed(&store, 1);
        store
            .record_property_changed(&id, "name", Value::from("changed"))
            .unwrap();
        assert_eq!(store.object_state(&id), Some(PersistenceState::Modified));
        assert_eq!(store.read_property(&id, "name"), Some(Value::from("changed")));
    }

    #[test]
    fn test_stale_snapshot_merged_before_mutation() {
        let store = store();
        let id = register_committed(&store, 1);
        // A peer committed a newer row; the local object still reports
        // snapshot version 0.
        let row = DataRow::from_pairs([
            ("ID".to_string(), Value::Int64(1)),
            ("NAME".to_string(), Value::from("peer")),
        ]);
        let version = row.version();
        store.snapshot_cache().put_snapshot(id.clone(), row);

        store
            .record_property_changed(&id, "name", Value::from("local"))
            .unwrap();
        // The merge ran before the local write: the recorded original value
        // is the peer's, not the stale local one.
        let diff = store.object_diff(&id).unwrap();
        assert_eq!(
            diff.original_value("name"),
            Some(&Value::from("peer"))
        );
        store.with_object(&id, |o| assert_eq!(o.snapshot_version(), version));
    }

    #[test]
    fn test_delete_unowned_object_is_fatal() {
        let store = store();
        let id = ObjectId::with_single_key("Artist", "ID", Value::Int64(1));
        let err = store.record_object_deleted(&id).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_rollback_resets_states_and_diffs() {
        let store = store();

        let new_id = ObjectId::temporary("Artist");
        store.register_node(new_id.clone(), Box::new(DataObject::new("Artist")));
        store.record_object_created(&new_id).unwrap();

        let modified_id = register_committed(&store, 2);
        store
            .record_property_changed(&modified_id, "name", Value::from("x"))
            .unwrap();

        let deleted_id = register_committed(&store, 3);
        store.record_object_deleted(&deleted_id).unwrap();

        store.objects_rolled_back();
        assert!(!store.has_changes());
        // New object was unregistered entirely.
        assert!(store.object_state(&new_id).is_none());
        assert_eq!(store.object_state(&modified_id), Some(PersistenceState::Hollow));
        assert_eq!(store.object_state(&deleted_id), Some(PersistenceState::Hollow));
        assert_eq!(store.read_property(&modified_id, "name"), None);
    }

    #[test]
    fn test_self_originated_snapshot_event_ignored() {
        let store = store();
        let id = register_committed(&store, 1);
        let mut event = super::super::event::SnapshotEvent {
            posted_by: Some(store.handle()),
            ..Default::default()
        };
        event.updated.insert(
            id.clone(),
            DataRow::from_pairs([("NAME".to_string(), Value::from("peer"))]),
        );
        store.snapshots_changed(&event);
        assert_eq!(store.read_property(&id, "name"), Some(Value::from("original")));
    }

    #[test]
    fn test_peer_event_merges_committed_object() {
        let store = store();
        let id = register_committed(&store, 1);
        let mut event = super::super::event::SnapshotEvent::default();
        event.updated.insert(
            id.clone(),
            DataRow::from_pairs([("NAME".to_string(), Value::from("peer"))]),
        );
        store.snapshots_changed(&event);
        assert_eq!(store.read_property(&id, "name"), Some(Value::from("peer")));
        assert_eq!(store.object_state(&id), Some(PersistenceState::Committed));
    }

    #[test]
    fn test_peer_event_merge_vetoed_by_delegate() {
        struct NoMerge;
        impl ObjectStoreDelegate for NoMerge {
            fn should_merge_changes(&self, _id: &ObjectId, _v: u64) -> bool {
                false
            }
        }

        let (cache, resolver) = fixture();
        let mut store = ObjectStore::new(cache, resolver);
        store.set_delegate(Arc::new(NoMerge));
        let id = register_committed(&store, 1);
        store
            .record_property_changed(&id, "name", Value::from("local"))
            .unwrap();

        let mut event = super::super::event::SnapshotEvent::default();
        event.updated.insert(
            id.clone(),
            DataRow::from_pairs([("NAME".to_string(), Value::from("peer"))]),
        );
        store.snapshots_changed(&event);
        assert_eq!(store.read_property(&id, "name"), Some(Value::from("local")));
    }
}
