//! The query execution chain.
//!
//! Each query passes through a sequence of interceptors before reaching the
//! data node: identity lookups are answered from the snapshot cache,
//! to-one relationship fetches are answered from a known foreign key,
//! paginated selects resolve identities only, and keyed selects consult the
//! query cache. Only what survives interception touches the node.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::access::node::{DataNode, OperationObserver};
use crate::access::object_store::ObjectStore;
use crate::access::snapshot::DataRow;
use crate::access::transaction::Transaction;
use crate::error::{Error, Result};
use crate::map::{EntityResolver, ObjEntity};
use crate::object::ObjectId;
use crate::value::Value;

use super::cache::{CachedResult, QueryCache};
use super::select::{
    CachePolicy, ObjectIdQuery, PrefetchNode, PrefetchSemantics, Query, QueryResponse,
    RelationshipQuery, SelectQuery,
};

/// Observer that collects the rows of a single select.
#[derive(Default)]
struct RowCollector {
    rows: Vec<DataRow>,
    error: Option<Error>,
}

impl OperationObserver for RowCollector {
    fn next_count(&mut self, _query: &Query, _count: usize) {}

    fn next_rows(&mut self, _query: &Query, rows: Vec<DataRow>) {
        self.rows = rows;
    }

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

/// One dispatch of a query through the interceptor chain to a node.
pub struct QueryAction<'a> {
    store: &'a ObjectStore,
    resolver: &'a EntityResolver,
    node: &'a dyn DataNode,
    query_cache: &'a QueryCache,
}

impl<'a> QueryAction<'a> {
    pub fn new(
        store: &'a ObjectStore,
        resolver: &'a EntityResolver,
        node: &'a dyn DataNode,
        query_cache: &'a QueryCache,
    ) -> Self {
        Self {
            store,
            resolver,
            node,
            query_cache,
        }
    }

    /// Run a query to a raw-row response. Object materialization is the
    /// caller's concern.
    pub fn execute(&self, query: &Query, tx: &mut Transaction) -> Result<QueryResponse> {
        match query {
            Query::ObjectId(q) => self.execute_object_id(q, tx),
            Query::Relationship(q) => self.execute_relationship(q, tx),
            Query::Select(q) => self.execute_select(q, tx),
            Query::Batch(_) => Err(Error::Query(
                "batches are executed by the commit pipeline".to_string(),
            )),
        }
    }

    fn execute_object_id(
        &self,
        query: &ObjectIdQuery,
        tx: &mut Transaction,
    ) -> Result<QueryResponse> {
        if !query.refresh {
            if let Some(row) = self
                .store
                .snapshot_cache()
                .get_cached_snapshot(&query.id)
            {
                trace!(id = %query.id, "identity query served from snapshot cache");
                return Ok(QueryResponse {
                    rows: Arc::new(vec![row]),
                    ..QueryResponse::default()
                });
            }
        }
        let mut select = SelectQuery::new(query.id.entity_name());
        for (column, value) in query.id.key_map() {
            select = select.with_qualifier(column, value);
        }
        let rows = self.run_node_select(&select, tx)?;
        Ok(QueryResponse {
            rows: Arc::new(rows),
            ..QueryResponse::default()
        })
    }

    fn execute_relationship(
        &self,
        query: &RelationshipQuery,
        tx: &mut Transaction,
    ) -> Result<QueryResponse> {
        let entity = self.resolver.obj_entity(query.source.entity_name())?;
        let relationship = entity.relationship(&query.relationship).ok_or_else(|| {
            Error::Mapping(format!(
                "unknown relationship '{}.{}'",
                entity.name, query.relationship
            ))
        })?;

        if relationship.is_flattened() {
            return self.execute_flattened(entity, query, tx);
        }
        let db = self.resolver.db_entity_for(entity)?;
        let db_rel = db
            .relationship(relationship.first_db_relationship())
            .ok_or_else(|| {
                Error::Mapping(format!(
                    "unmapped db relationship for '{}.{}'",
                    entity.name, query.relationship
                ))
            })?;

        if !relationship.to_many {
            // A to-one target may be resolvable from the foreign key alone,
            // skipping the fetch. Unsafe with subtypes: the concrete class
            // is only known from the row.
            if let Some(snapshot) = self
                .store
                .snapshot_cache()
                .get_cached_snapshot(&query.source)
            {
                let mut key = BTreeMap::new();
                let mut missing = false;
                let mut null = false;
                for join in &db_rel.joins {
                    match snapshot.get(&join.source) {
                        Some(Value::Null) => null = true,
                        Some(value) => {
                            key.insert(join.target.clone(), value.clone());
                        }
                        None => missing = true,
                    }
                }
                if null {
                    trace!(source = %query.source, "to-one foreign key is NULL");
                    return Ok(QueryResponse {
                        resolved_ids: Some(Vec::new()),
                        ..QueryResponse::default()
                    });
                }
                if !missing && !self.resolver.has_subtypes(&relationship.target_entity) {
                    let id = ObjectId::new(relationship.target_entity.clone(), key);
                    trace!(source = %query.source, target = %id, "to-one resolved from known key");
                    return Ok(QueryResponse {
                        resolved_ids: Some(vec![id]),
                        ..QueryResponse::default()
                    });
                }
            }
        }

        // Fetch through the node, qualified by the source's key columns.
        let mut select = SelectQuery::new(relationship.target_entity.clone());
        for join in &db_rel.joins {
            let value = self
                .source_column_value(&query.source, &join.source)
                .ok_or_else(|| {
                    Error::Query(format!(
                        "no value for column '{}' of {}",
                        join.source, query.source
                    ))
                })?;
            select = select.with_qualifier(join.target.clone(), value);
        }
        let rows = self.run_node_select(&select, tx)?;
        Ok(QueryResponse {
            rows: Arc::new(rows),
            ..QueryResponse::default()
        })
    }

    /// Two-hop fetch across a join table.
    fn execute_flattened(
        &self,
        entity: &ObjEntity,
        query: &RelationshipQuery,
        tx: &mut Transaction,
    ) -> Result<QueryResponse> {
        let relationship = entity
            .relationship(&query.relationship)
            .ok_or_else(|| Error::Mapping(format!("unknown relationship '{}'", query.relationship)))?;
        let first = self
            .resolver
            .db_relationship(&entity.db_entity, &relationship.db_path[0])?;
        let second = self
            .resolver
            .db_relationship(&first.target_entity, &relationship.db_path[1])?;

        let mut join_select = SelectQuery::new(first.target_entity.clone());
        for join in &first.joins {
            let value = self
                .source_column_value(&query.source, &join.source)
                .ok_or_else(|| {
                    Error::Query(format!(
                        "no value for column '{}' of {}",
                        join.source, query.source
                    ))
                })?;
            join_select = join_select.with_qualifier(join.target.clone(), value);
        }
        let join_rows = self.run_node_select(&join_select, tx)?;
        if join_rows.is_empty() {
            return Ok(QueryResponse::default());
        }

        let link = second.joins.first().ok_or_else(|| {
            Error::Mapping(format!("relationship '{}' has no joins", second.name))
        })?;
        let values: Vec<Value> = join_rows
            .iter()
            .filter_map(|row| row.get(&link.source).cloned())
            .collect();
        let mut target_select = SelectQuery::new(relationship.target_entity.clone());
        target_select.in_qualifier = Some((link.target.clone(), values));
        let rows = self.run_node_select(&target_select, tx)?;
        Ok(QueryResponse {
            rows: Arc::new(rows),
            ..QueryResponse::default()
        })
    }

    fn execute_select(&self, query: &SelectQuery, tx: &mut Transaction) -> Result<QueryResponse> {
        // Paginated queries resolve identities only; page rows are fetched
        // on demand by the owning context.
        if query.page_size > 0 {
            let rows = self.run_node_select(query, tx)?;
            let entity = self.resolver.obj_entity(&query.entity)?;
            let db = self.resolver.db_entity_for(entity)?;
            let mut ids = Vec::with_capacity(rows.len());
            for row in &rows {
                let mut key = BTreeMap::new();
                for column in db.primary_key_names() {
                    let value = row.get(column).cloned().ok_or_else(|| {
                        Error::Query(format!(
                            "row for '{}' is missing key column '{column}'",
                            entity.name
                        ))
                    })?;
                    key.insert(column.to_string(), value);
                }
                ids.push(ObjectId::new(entity.name.clone(), key));
            }
            return Ok(QueryResponse {
                resolved_ids: Some(ids),
                ..QueryResponse::default()
            });
        }

        match (query.cache_policy, query.cache_key.as_deref()) {
            (CachePolicy::Cache, Some(key)) => {
                if let Some(hit) = self.query_cache.get(key) {
                    debug!(key, "select served from query cache");
                    return Ok(QueryResponse {
                        rows: hit.rows,
                        prefetch_rows: hit.prefetch_rows,
                        resolved_ids: None,
                    });
                }
                let response = self.fetch_with_prefetches(query, tx)?;
                self.query_cache.put(
                    key,
                    CachedResult {
                        rows: Arc::clone(&response.rows),
                        prefetch_rows: response.prefetch_rows.clone(),
                    },
                );
                Ok(response)
            }
            (CachePolicy::CacheRefresh, Some(key)) => {
                self.query_cache.remove(key);
                let response = self.fetch_with_prefetches(query, tx)?;
                self.query_cache.put(
                    key,
                    CachedResult {
                        rows: Arc::clone(&response.rows),
                        prefetch_rows: response.prefetch_rows.clone(),
                    },
                );
                Ok(response)
            }
            _ => self.fetch_with_prefetches(query, tx),
        }
    }

    /// Execute the main select and any disjoint prefetch sub-queries.
    fn fetch_with_prefetches(
        &self,
        query: &SelectQuery,
        tx: &mut Transaction,
    ) -> Result<QueryResponse> {
        let rows = self.run_node_select(query, tx)?;
        let mut response = QueryResponse {
            rows: Arc::new(rows),
            ..QueryResponse::default()
        };
        let entity = Arc::clone(self.resolver.obj_entity(&query.entity)?);
        let main_rows = Arc::clone(&response.rows);
        for node in &query.prefetches {
            self.run_disjoint_prefetch(&entity, node, "", &main_rows, &mut response, tx)?;
        }
        Ok(response)
    }

    fn run_disjoint_prefetch(
        &self,
        parent_entity: &Arc<ObjEntity>,
        node: &PrefetchNode,
        parent_path: &str,
        parent_rows: &Arc<Vec<DataRow>>,
        response: &mut QueryResponse,
        tx: &mut Transaction,
    ) -> Result<()> {
        let path = if parent_path.is_empty() {
            node.relationship.clone()
        } else {
            format!("{parent_path}.{}", node.relationship)
        };
        // Joint nodes ride along inside the main rows.
        if node.semantics == PrefetchSemantics::Joint {
            return Ok(());
        }
        let relationship = parent_entity.relationship(&node.relationship).ok_or_else(|| {
            Error::Mapping(format!(
                "unknown relationship '{}.{}'",
                parent_entity.name, node.relationship
            ))
        })?;
        if relationship.is_flattened() {
            return Err(Error::Query(format!(
                "flattened relationship '{}' cannot be prefetched disjointly",
                node.relationship
            )));
        }
        let db = self.resolver.db_entity_for(parent_entity)?;
        let db_rel = db
            .relationship(relationship.first_db_relationship())
            .ok_or_else(|| {
                Error::Mapping(format!("unmapped db relationship '{}'", node.relationship))
            })?;
        let join = db_rel.joins.first().ok_or_else(|| {
            Error::Mapping(format!("relationship '{}' has no joins", db_rel.name))
        })?;

        let mut values: Vec<Value> = Vec::new();
        for row in parent_rows.iter() {
            if let Some(value) = row.get(&join.source) {
                if *value != Value::Null && !values.contains(value) {
                    values.push(value.clone());
                }
            }
        }
        let child_rows = if values.is_empty() {
            Vec::new()
        } else {
            let mut select = SelectQuery::new(relationship.target_entity.clone());
            select.in_qualifier = Some((join.target.clone(), values));
            self.run_node_select(&select, tx)?
        };
        let child_rows = Arc::new(child_rows);
        response
            .prefetch_rows
            .insert(path.clone(), Arc::clone(&child_rows));

        let child_entity = self.resolver.obj_entity(&relationship.target_entity)?;
        let child_entity = Arc::clone(child_entity);
        for child in &node.children {
            self.run_disjoint_prefetch(&child_entity, child, &path, &child_rows, response, tx)?;
        }
        Ok(())
    }

    fn run_node_select(&self, select: &SelectQuery, tx: &mut Transaction) -> Result<Vec<DataRow>> {
        let query = Query::Select(select.clone());
        let mut collector = RowCollector::default();
        self.node
            .perform_queries(std::slice::from_ref(&query), &mut collector, tx);
        match collector.error {
            Some(error) => Err(error),
            None => Ok(collector.rows),
        }
    }

    fn source_column_value(&self, id: &ObjectId, column: &str) -> Option<Value> {
        id.effective_value(column).or_else(|| {
            self.store
                .snapshot_cache()
                .get_cached_snapshot(id)
                .and_then(|row| row.get(column).cloned())
        })
    }
}
