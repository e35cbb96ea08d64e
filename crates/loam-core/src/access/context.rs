//! The session facade tying the store, cache, node, and query machinery
//! together.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use tracing::{debug, warn};

use crate::access::commit::{self, FlushAction};
use crate::access::event::{Event, EventKind, Subscription};
use crate::access::node::DataNode;
use crate::access::object_store::ObjectStore;
use crate::access::query::{
    CachePolicy, IncrementalList, ObjectIdQuery, ObjectMaterializer, PrefetchSemantics, Query,
    QueryAction, QueryCache, QueryResponse, RelationshipQuery, SelectQuery,
};
use crate::access::snapshot_cache::SnapshotCache;
use crate::access::transaction::Transaction;
use crate::error::{Error, Result};
use crate::graph::GraphDiff;
use crate::map::{EntityResolver, EntitySorter};
use crate::object::{DataObject, ObjectId, PersistenceState, Persistent};
use crate::value::Value;

/// An independent unit of work over one data node.
///
/// The context owns its object store and query cache; the snapshot cache
/// is shared between peer contexts, and peer commits reach this context
/// through the cache's event bus.
pub struct DataContext {
    store: Arc<ObjectStore>,
    resolver: Arc<EntityResolver>,
    node: Arc<dyn DataNode>,
    query_cache: Arc<QueryCache>,
    sorter: EntitySorter,
    subscription: Option<Subscription>,
}

impl DataContext {
    /// Create a context over a node, sharing the given snapshot cache with
    /// any peer contexts.
    pub fn new(
        resolver: Arc<EntityResolver>,
        node: Arc<dyn DataNode>,
        cache: Arc<SnapshotCache>,
    ) -> Self {
        let store = Arc::new(ObjectStore::new(Arc::clone(&cache), Arc::clone(&resolver)));
        let weak: Weak<ObjectStore> = Arc::downgrade(&store);
        let subscription = cache.event_bus().subscribe(
            EventKind::SnapshotsChanged,
            move |event| {
                if let (Some(store), Event::Snapshots(snapshot_event)) =
                    (weak.upgrade(), event)
                {
                    store.snapshots_changed(snapshot_event);
                }
            },
        );
        debug!("created data context");
        Self {
            store,
            resolver,
            node,
            query_cache: Arc::new(QueryCache::new()),
            sorter: EntitySorter::new(),
            subscription: Some(subscription),
        }
    }

    /// The underlying object store.
    pub fn object_store(&self) -> &Arc<ObjectStore> {
        &self.store
    }

    /// The entity metadata.
    pub fn resolver(&self) -> &Arc<EntityResolver> {
        &self.resolver
    }

    /// The per-context query result cache.
    pub fn query_cache(&self) -> &Arc<QueryCache> {
        &self.query_cache
    }

    /// Whether uncommitted changes are pending.
    pub fn has_changes(&self) -> bool {
        self.store.has_changes()
    }

    // ----- object lifecycle -------------------------------------------------

    /// Create and register a new object of an entity.
    pub fn new_object(&self, entity: &str) -> Result<ObjectId> {
        self.resolver.obj_entity(entity)?;
        let id = ObjectId::temporary(entity);
        self.store
            .register_node(id.clone(), Box::new(DataObject::new(entity)));
        self.store.record_object_created(&id)?;
        Ok(id)
    }

    /// Translate a known identity into an object registered with this
    /// context. An unregistered id gets a Hollow placeholder without a
    /// fetch; its row is loaded lazily on first property read. An already
    /// registered id is returned as-is.
    pub fn local_object(&self, id: &ObjectId) -> Result<ObjectId> {
        self.resolver.obj_entity(id.entity_name())?;
        if id.is_temporary() {
            return Err(Error::NotManaged(format!(
                "{id} has no permanent identity"
            )));
        }
        if self.store.object_state(id).is_none() {
            let mut object = DataObject::new(id.entity_name());
            object.set_persistence_state(PersistenceState::Hollow);
            self.store.register_node(id.clone(), Box::new(object));
        }
        Ok(id.clone())
    }

    /// Delete a registered object, applying delete rules. Relationship
    /// faults with a rule other than NoAction are resolved first so the
    /// rules see the real related objects, not just those already loaded.
    pub fn delete_object(&self, id: &ObjectId) -> Result<()> {
        let entity = Arc::clone(self.resolver.obj_entity(id.entity_name())?);
        let fetched = matches!(
            self.store.object_state(id),
            Some(PersistenceState::Committed | PersistenceState::Modified)
        );
        if fetched {
            for relationship in &entity.relationships {
                if relationship.delete_rule == crate::map::DeleteRule::NoAction {
                    continue;
                }
                if relationship.to_many
                    && self.store.arc_targets(id, &relationship.name).is_empty()
                {
                    let related = self.resolve_relationship(id, &relationship.name)?;
                    debug!(
                        id = %id,
                        relationship = %relationship.name,
                        count = related.len(),
                        "resolved relationship before delete"
                    );
                }
            }
        }
        commit::perform_delete(
            &self.store,
            &self.resolver,
            &commit::RegisteredArcs(&self.store),
            id,
        )
    }

    // ----- property and arc edits ------------------------------------------

    /// Write a scalar property.
    pub fn write_property(&self, id: &ObjectId, property: &str, value: Value) -> Result<()> {
        self.store.record_property_changed(id, property, value)
    }

    /// Read a scalar property, resolving a Hollow object from its row
    /// first.
    pub fn read_property(&self, id: &ObjectId, property: &str) -> Result<Value> {
        if self.store.object_state(id) == Some(PersistenceState::Hollow) {
            self.fetch_object(id, false)?;
        }
        Ok(self.store.read_property(id, property).unwrap_or(Value::Null))
    }

    /// Point a to-one relationship at a new target (or clear it), keeping
    /// the reverse relationship consistent on both the old and new targets.
    pub fn set_to_one(
        &self,
        id: &ObjectId,
        relationship: &str,
        target: Option<ObjectId>,
    ) -> Result<()> {
        let entity = Arc::clone(self.resolver.obj_entity(id.entity_name())?);
        let rel = entity.relationship(relationship).ok_or_else(|| {
            Error::Mapping(format!(
                "unknown relationship '{}.{relationship}'",
                entity.name
            ))
        })?;
        if rel.to_many {
            return Err(Error::Mapping(format!(
                "'{relationship}' is a to-many relationship",
            )));
        }
        let reverse = self
            .resolver
            .reverse_obj_relationship(rel)
            .map(|r| r.name.clone());

        for old in self.store.arc_targets(id, relationship) {
            if Some(&old) == target.as_ref() {
                continue;
            }
            self.store.record_arc_deleted(id, old.clone(), relationship)?;
            if let Some(reverse) = &reverse {
                if self.store.object_state(&old).is_some() {
                    self.store.record_arc_deleted(&old, id.clone(), reverse)?;
                }
            }
        }
        if let Some(target) = target {
            if self.store.arc_targets(id, relationship).contains(&target) {
                return Ok(());
            }
            self.store
                .record_arc_created(id, target.clone(), relationship)?;
            if let Some(reverse) = &reverse {
                if self.store.object_state(&target).is_some() {
                    self.store.record_arc_created(&target, id.clone(), reverse)?;
                }
            }
        }
        Ok(())
    }

    /// Add a target to a to-many (or flattened) relationship.
    pub fn add_to_many(&self, id: &ObjectId, relationship: &str, target: ObjectId) -> Result<()> {
        let entity = Arc::clone(self.resolver.obj_entity(id.entity_name())?);
        let rel = entity.relationship(relationship).ok_or_else(|| {
            Error::Mapping(format!(
                "unknown relationship '{}.{relationship}'",
                entity.name
            ))
        })?;
        self.store
            .record_arc_created(id, target.clone(), relationship)?;
        if let Some(reverse) = self.resolver.reverse_obj_relationship(rel) {
            let reverse_name = reverse.name.clone();
            if self.store.object_state(&target).is_some() {
                self.store.record_arc_created(&target, id.clone(), &reverse_name)?;
            }
        }
        Ok(())
    }

    /// Remove a target from a to-many (or flattened) relationship.
    pub fn remove_from_many(
        &self,
        id: &ObjectId,
        relationship: &str,
        target: ObjectId,
    ) -> Result<()> {
        let entity = Arc::clone(self.resolver.obj_entity(id.entity_name())?);
        let rel = entity.relationship(relationship).ok_or_else(|| {
            Error::Mapping(format!(
                "unknown relationship '{}.{relationship}'",
                entity.name
            ))
        })?;
        self.store
            .record_arc_deleted(id, target.clone(), relationship)?;
        if let Some(reverse) = self.resolver.reverse_obj_relationship(rel) {
            let reverse_name = reverse.name.clone();
            if self.store.object_state(&target).is_some() {
                self.store.record_arc_deleted(&target, id.clone(), &reverse_name)?;
            }
        }
        Ok(())
    }

    // ----- commit and rollback ---------------------------------------------

    /// Commit all pending changes in one internally managed transaction. On
    /// failure the transaction is rolled back and the pending diffs stay in
    /// place.
    pub fn commit_changes(&self) -> Result<GraphDiff> {
        if !self.store.has_changes() {
            return Ok(GraphDiff::new());
        }
        let mut tx = Transaction::internal();
        match self.commit_changes_in(&mut tx) {
            Ok(diff) => {
                tx.commit()?;
                Ok(diff)
            }
            Err(error) => {
                if let Err(rollback_error) = tx.rollback() {
                    warn!(%rollback_error, "rollback after failed commit also failed");
                }
                Err(error)
            }
        }
    }

    /// Flush all pending changes inside a caller-supplied transaction,
    /// which may be externally managed and carry a delegate. The caller
    /// owns the transaction outcome; a failed flush marks it rollback-only
    /// and leaves the pending diffs in place.
    pub fn commit_changes_in(&self, tx: &mut Transaction) -> Result<GraphDiff> {
        if !self.store.has_changes() {
            return Ok(GraphDiff::new());
        }
        let flush = FlushAction::new(&self.store, &self.resolver, &self.sorter, self.node.as_ref());
        flush.flush(tx)
    }

    /// Discard all pending changes.
    pub fn rollback_changes(&self) {
        self.store.objects_rolled_back();
    }

    // ----- queries ----------------------------------------------------------

    /// Run a select, materialize the result, and wire any prefetches.
    /// Returns ids in row order, deduplicated.
    pub fn perform_query(&self, query: &SelectQuery) -> Result<Vec<ObjectId>> {
        let mut tx = Transaction::internal();
        self.perform_query_in(query, &mut tx)
    }

    /// Run a select inside a caller-supplied transaction.
    pub fn perform_query_in(
        &self,
        query: &SelectQuery,
        tx: &mut Transaction,
    ) -> Result<Vec<ObjectId>> {
        let action = QueryAction::new(
            &self.store,
            &self.resolver,
            self.node.as_ref(),
            &self.query_cache,
        );
        let response = action.execute(&Query::Select(query.clone()), tx)?;
        let refresh = query.refresh || query.cache_policy == CachePolicy::CacheRefresh;
        self.materialize_response(query, &response, refresh)
    }

    /// Fetch one object by identity. `refresh` bypasses the snapshot cache.
    pub fn fetch_object(&self, id: &ObjectId, refresh: bool) -> Result<Option<ObjectId>> {
        let mut tx = Transaction::internal();
        self.fetch_object_in(id, refresh, &mut tx)
    }

    /// Fetch one object by identity inside a caller-supplied transaction.
    pub fn fetch_object_in(
        &self,
        id: &ObjectId,
        refresh: bool,
        tx: &mut Transaction,
    ) -> Result<Option<ObjectId>> {
        let action = QueryAction::new(
            &self.store,
            &self.resolver,
            self.node.as_ref(),
            &self.query_cache,
        );
        let response = action.execute(
            &Query::ObjectId(ObjectIdQuery {
                id: id.clone(),
                refresh,
            }),
            tx,
        )?;
        let materializer = ObjectMaterializer::new(&self.store, &self.resolver);
        let ids = materializer.materialize(id.entity_name(), &response.rows, refresh)?;
        Ok(ids.into_iter().next())
    }

    /// Resolve the objects behind one relationship of a source object,
    /// wiring the arcs on both sides.
    pub fn resolve_relationship(
        &self,
        source: &ObjectId,
        relationship: &str,
    ) -> Result<Vec<ObjectId>> {
        let mut tx = Transaction::internal();
        let action = QueryAction::new(
            &self.store,
            &self.resolver,
            self.node.as_ref(),
            &self.query_cache,
        );
        let response = action.execute(
            &Query::Relationship(RelationshipQuery {
                source: source.clone(),
                relationship: relationship.to_string(),
            }),
            &mut tx,
        )?;
        let materializer = ObjectMaterializer::new(&self.store, &self.resolver);
        let entity = Arc::clone(self.resolver.obj_entity(source.entity_name())?);
        let rel = entity.relationship(relationship).ok_or_else(|| {
            Error::Mapping(format!(
                "unknown relationship '{}.{relationship}'",
                entity.name
            ))
        })?;

        let ids = match &response.resolved_ids {
            Some(ids) => {
                // Identity-only resolution: register hollow placeholders.
                materializer.materialize_hollow(ids)?;
                ids.clone()
            }
            None => materializer.materialize(&rel.target_entity, &response.rows, false)?,
        };
        for target in &ids {
            crate::access::query::prefetch::connect_pair(
                &self.store,
                &self.resolver,
                &entity.name,
                relationship,
                source,
                target,
            )?;
        }
        Ok(ids)
    }

    /// Run a paginated select, caching the id list under the query's cache
    /// key. Rows are fetched per page through [`DataContext::resolve_page`].
    pub fn paginated_query(&self, query: &SelectQuery) -> Result<Arc<IncrementalList>> {
        let key = query.cache_key.clone().ok_or_else(|| {
            Error::Query("paginated queries require a cache key".to_string())
        })?;
        if query.cache_policy != CachePolicy::CacheRefresh {
            if let Some(list) = self.query_cache.get_list(&key) {
                return Ok(list);
            }
        }
        let mut tx = Transaction::internal();
        let action = QueryAction::new(
            &self.store,
            &self.resolver,
            self.node.as_ref(),
            &self.query_cache,
        );
        let response = action.execute(&Query::Select(query.clone()), &mut tx)?;
        let ids = response.resolved_ids.ok_or_else(|| {
            Error::Query("paginated select produced no id list".to_string())
        })?;
        let list = Arc::new(IncrementalList::new(
            query.entity.clone(),
            query.page_size,
            ids,
        )?);
        self.query_cache.put_list(key, Arc::clone(&list));
        Ok(list)
    }

    /// Fetch and materialize one page of a paginated list. Pages already
    /// resolved are returned without touching the node.
    pub fn resolve_page(
        &self,
        list: &IncrementalList,
        page: usize,
    ) -> Result<Vec<ObjectId>> {
        let page_ids: Vec<ObjectId> = list.page_ids(page)?.to_vec();
        if list.is_page_resolved(page) || page_ids.is_empty() {
            return Ok(page_ids);
        }
        let entity = Arc::clone(self.resolver.obj_entity(list.entity())?);
        let db = self.resolver.db_entity_for(&entity)?;
        let key_columns = db.primary_key_names();
        if key_columns.len() != 1 {
            return Err(Error::Query(format!(
                "pagination requires a single-column key; '{}' has {}",
                db.name,
                key_columns.len()
            )));
        }
        let column = key_columns[0].to_string();
        let values: Vec<Value> = page_ids
            .iter()
            .filter_map(|id| id.effective_value(&column))
            .collect();

        let mut select = SelectQuery::new(entity.name.clone());
        select.in_qualifier = Some((column, values));
        let mut tx = Transaction::internal();
        let action = QueryAction::new(
            &self.store,
            &self.resolver,
            self.node.as_ref(),
            &self.query_cache,
        );
        let response = action.execute(&Query::Select(select), &mut tx)?;
        let materializer = ObjectMaterializer::new(&self.store, &self.resolver);
        materializer.materialize(&entity.name, &response.rows, false)?;
        list.mark_page_resolved(page);
        Ok(page_ids)
    }

    /// Replay an externally produced diff into this context's store,
    /// creating, modifying, and deleting objects to match.
    pub fn apply_diff(&self, diff: &GraphDiff) -> Result<()> {
        use crate::graph::GraphOp;
        for (id, op) in diff.iter() {
            match op {
                GraphOp::NodeCreated => {
                    if self.store.object_state(id).is_none() {
                        self.store.register_node(
                            id.clone(),
                            Box::new(DataObject::new(id.entity_name())),
                        );
                    }
                    self.store.record_object_created(id)?;
                }
                GraphOp::NodeRemoved => {
                    self.store.record_object_deleted(id)?;
                }
                GraphOp::NodeIdChanged { .. } => {
                    // Id promotion happens on this side's own commit.
                }
                GraphOp::PropertyChanged { property, new_value, .. } => {
                    self.store
                        .record_property_changed(id, property, new_value.clone())?;
                }
                GraphOp::ArcCreated { target, arc } => {
                    self.store.record_arc_created(id, target.clone(), arc)?;
                }
                GraphOp::ArcDeleted { target, arc } => {
                    self.store.record_arc_deleted(id, target.clone(), arc)?;
                }
            }
        }
        Ok(())
    }

    fn materialize_response(
        &self,
        query: &SelectQuery,
        response: &QueryResponse,
        refresh: bool,
    ) -> Result<Vec<ObjectId>> {
        let materializer = ObjectMaterializer::new(&self.store, &self.resolver);
        let entity = Arc::clone(self.resolver.obj_entity(&query.entity)?);

        let main_ids = materializer.materialize(&query.entity, &response.rows, refresh)?;

        // Joint prefetches: each main row carries its own child columns.
        for node in &query.prefetches {
            if node.semantics != PrefetchSemantics::Joint {
                continue;
            }
            let rel = entity.relationship(&node.relationship).ok_or_else(|| {
                Error::Mapping(format!(
                    "unknown relationship '{}.{}'",
                    entity.name, node.relationship
                ))
            })?;
            for (row, parent) in response.rows.iter().zip(main_ids.iter()) {
                if let Some(child_row) =
                    crate::access::query::prefetch::child_row_from_joint(row, &node.relationship)
                {
                    let child =
                        materializer.materialize_row(&rel.target_entity, &child_row, false)?;
                    crate::access::query::prefetch::connect_pair(
                        &self.store,
                        &self.resolver,
                        &entity.name,
                        &node.relationship,
                        parent,
                        &child,
                    )?;
                }
            }
        }

        // Disjoint prefetches: separate row lists, connected by key match.
        let mut parents_by_path: BTreeMap<String, Vec<ObjectId>> = BTreeMap::new();
        parents_by_path.insert(String::new(), self.dedup(&main_ids));
        let mut entity_by_path: BTreeMap<String, String> = BTreeMap::new();
        entity_by_path.insert(String::new(), entity.name.clone());

        for (path, rows) in &response.prefetch_rows {
            let (parent_path, rel_name) = match path.rfind('.') {
                Some(split) => (&path[..split], &path[split + 1..]),
                None => ("", path.as_str()),
            };
            let parent_entity_name = entity_by_path
                .get(parent_path)
                .cloned()
                .ok_or_else(|| Error::Query(format!("prefetch path '{path}' has no parent")))?;
            let parent_entity = Arc::clone(self.resolver.obj_entity(&parent_entity_name)?);
            let rel = parent_entity.relationship(rel_name).ok_or_else(|| {
                Error::Mapping(format!(
                    "unknown relationship '{parent_entity_name}.{rel_name}'"
                ))
            })?;
            let child_ids = materializer.materialize(&rel.target_entity, rows, false)?;
            let child_ids = self.dedup(&child_ids);
            let parents = parents_by_path
                .get(parent_path)
                .cloned()
                .unwrap_or_default();
            crate::access::query::prefetch::connect_disjoint(
                &self.store,
                &self.resolver,
                &parent_entity_name,
                rel_name,
                &parents,
                &child_ids,
            )?;
            entity_by_path.insert(path.clone(), rel.target_entity.clone());
            parents_by_path.insert(path.clone(), child_ids);
        }

        Ok(self.dedup(&main_ids))
    }

    fn dedup(&self, ids: &[ObjectId]) -> Vec<ObjectId> {
        let mut seen = std::collections::HashSet::new();
        ids.iter()
            .filter(|id| seen.insert((*id).clone()))
            .cloned()
            .collect()
    }
}

impl Drop for DataContext {
    fn drop(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            self.store
                .snapshot_cache()
                .event_bus()
                .unsubscribe(subscription);
        }
    }
}
