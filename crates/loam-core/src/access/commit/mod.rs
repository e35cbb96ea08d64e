//! The commit pipeline: classify pending changes into batches, execute them
//! in dependency order, and propagate the results to the snapshot cache and
//! the object store.

pub mod buckets;
pub mod delete_rules;
pub mod diff_builder;
pub mod flattened;
pub mod qualifier;

use std::collections::{BTreeMap, HashMap};

use tracing::{debug, warn};

use crate::access::node::{DataNode, OperationObserver};
use crate::access::object_store::ObjectStore;
use crate::access::query::Query;
use crate::access::snapshot::DataRow;
use crate::access::transaction::Transaction;
use crate::error::{Error, Result};
use crate::graph::{GraphDiff, GraphOp};
use crate::map::{EntityResolver, EntitySorter};
use crate::object::ObjectId;
use crate::value::Value;

pub use buckets::{build as build_buckets, CommitBuckets};
pub use delete_rules::{perform_delete, RegisteredArcs, RelatedFinder};
pub use flattened::FlattenedArcKey;

/// Observer that folds operation results into a single outcome. The first
/// error wins; later operations on the same connection were aborted anyway.
#[derive(Default)]
struct FlushObserver {
    error: Option<Error>,
    row_count: usize,
}

impl OperationObserver for FlushObserver {
    fn next_count(&mut self, _query: &Query, count: usize) {
        self.row_count += count;
    }

    fn next_rows(&mut self, _query: &Query, _rows: Vec<DataRow>) {}

    fn next_query_exception(&mut self, _query: &Query, error: Error) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    fn next_global_exception(&mut self, error: Error) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }
}

/// One commit of an object store's pending change set through a data node.
///
/// The flush is all-or-nothing within the given transaction: any batch
/// failure marks the transaction rollback-only and leaves the pending
/// diffs in place, so the caller can roll back and retry or give up.
pub struct FlushAction<'a> {
    store: &'a ObjectStore,
    resolver: &'a EntityResolver,
    sorter: &'a EntitySorter,
    node: &'a dyn DataNode,
}

impl<'a> FlushAction<'a> {
    pub fn new(
        store: &'a ObjectStore,
        resolver: &'a EntityResolver,
        sorter: &'a EntitySorter,
        node: &'a dyn DataNode,
    ) -> Self {
        Self {
            store,
            resolver,
            sorter,
            node,
        }
    }

    /// Flush all pending changes. Returns the committed diff, including the
    /// id replacements performed for newly inserted objects.
    pub fn flush(&self, tx: &mut Transaction) -> Result<GraphDiff> {
        let mut result = self.store.get_changes();
        if result.is_empty() {
            debug!("flush requested with no pending changes");
            return Ok(result);
        }

        let buckets = buckets::build(self.store, self.resolver, self.sorter, self.node.pk_generator())
            .map_err(|e| {
                tx.set_rollback_only();
                e
            })?;

        let mut queries: Vec<Query> = Vec::new();
        queries.extend(buckets.inserts.iter().cloned().map(Query::Batch));
        queries.extend(buckets.flattened_inserts.iter().cloned().map(Query::Batch));
        queries.extend(buckets.updates.iter().cloned().map(Query::Batch));
        queries.extend(buckets.flattened_deletes.iter().cloned().map(Query::Batch));
        queries.extend(buckets.deletes.iter().cloned().map(Query::Batch));

        if !queries.is_empty() {
            let mut observer = FlushObserver::default();
            self.node.perform_queries(&queries, &mut observer, tx);
            if let Some(error) = observer.error {
                // Pending diffs stay intact for a retry after rollback.
                warn!(%error, "commit batch failed, marking transaction rollback-only");
                tx.set_rollback_only();
                return Err(error);
            }
            debug!(
                batches = queries.len(),
                rows = observer.row_count,
                "commit batches executed"
            );
        }

        self.post_process(&buckets, &mut result)?;
        Ok(result)
    }

    /// Promote generated keys to permanent ids, refresh the snapshot cache,
    /// and reset the store's dirty objects to Committed.
    fn post_process(&self, buckets: &CommitBuckets, result: &mut GraphDiff) -> Result<()> {
        let mut replacements: Vec<(ObjectId, ObjectId)> = Vec::new();
        let mut cache_deleted: Vec<ObjectId> = Vec::new();

        for id in buckets.inserted.iter().chain(buckets.updated.iter()) {
            if !id.is_replacement_needed() {
                continue;
            }
            let new_id = id.resolve_replacement()?;
            if !id.is_temporary() {
                // A permanent id changed its key; the old cache entry is
                // unreachable now.
                cache_deleted.push(id.clone());
            }
            result.add(id.clone(), GraphOp::NodeIdChanged { to: new_id.clone() });
            replacements.push((id.clone(), new_id));
        }
        for id in &buckets.deleted {
            cache_deleted.push(id.clone());
        }

        let final_id = |id: &ObjectId| -> ObjectId {
            replacements
                .iter()
                .find(|(old, _)| old == id)
                .map(|(_, new)| new.clone())
                .unwrap_or_else(|| id.clone())
        };

        let mut updated_rows: Vec<(ObjectId, DataRow)> = Vec::new();
        for id in &buckets.inserted {
            let values = self.full_snapshot(id)?;
            updated_rows.push((final_id(id), DataRow::new(values)));
        }
        for id in &buckets.updated {
            let values = self.full_snapshot(id)?;
            let row = match self.store.snapshot_cache().get_cached_snapshot(id) {
                Some(cached) => DataRow::new(values).replacing(cached.version()),
                None => DataRow::new(values),
            };
            updated_rows.push((final_id(id), row));
        }

        if !updated_rows.is_empty() || !cache_deleted.is_empty() {
            self.store.snapshot_cache().process_snapshot_changes(
                Some(self.store.handle()),
                updated_rows,
                cache_deleted,
                Vec::new(),
                Vec::new(),
            );
        }

        let mut versions: HashMap<ObjectId, u64> = HashMap::new();
        for id in buckets.inserted.iter().chain(buckets.updated.iter()) {
            let id = final_id(id);
            if let Some(row) = self.store.snapshot_cache().get_cached_snapshot(&id) {
                versions.insert(id, row.version());
            }
        }

        self.store
            .graph_committed(&replacements, &buckets.deleted, &versions);
        Ok(())
    }

    /// Rebuild a full database row for an object after its batch executed.
    /// Key columns come from the (now resolved) id, scalar columns from the
    /// object's properties, and foreign keys from its to-one arcs.
    fn full_snapshot(&self, id: &ObjectId) -> Result<BTreeMap<String, Value>> {
        let entity = self.resolver.obj_entity(id.entity_name())?;
        let db = self.resolver.db_entity_for(entity)?;
        let mut values = BTreeMap::new();

        for attribute in &entity.attributes {
            let value = self
                .store
                .read_property(id, &attribute.name)
                .unwrap_or(Value::Null);
            values.insert(attribute.db_attribute.clone(), value);
        }
        for relationship in &entity.relationships {
            if relationship.to_many || relationship.is_flattened() {
                continue;
            }
            let Some(db_rel) = db.relationship(relationship.first_db_relationship()) else {
                continue;
            };
            match self
                .store
                .arc_targets(id, &relationship.name)
                .into_iter()
                .next()
            {
                Some(target) => {
                    for join in &db_rel.joins {
                        let value = target.effective_value(&join.target).ok_or_else(|| {
                            Error::UnresolvedId(format!(
                                "no value for '{}' propagated from {target}",
                                join.target
                            ))
                        })?;
                        values.insert(join.source.clone(), value);
                    }
                }
                None => {
                    for join in &db_rel.joins {
                        values.entry(join.source.clone()).or_insert(Value::Null);
                    }
                }
            }
        }
        for column in db.primary_key_names() {
            if let Some(value) = id.effective_value(column) {
                values.insert(column.to_string(), value);
            }
        }
        Ok(values)
    }
}
