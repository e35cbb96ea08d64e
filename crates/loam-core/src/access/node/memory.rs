//! In-memory reference implementation of [`DataNode`].
//!
//! Stores tables as maps keyed by primary key. It does not enforce foreign
//! keys; instead it records an operation log so tests can assert batch
//! ordering, and counts selects so cache hits are observable.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::{DataNode, OperationObserver, PkGenerator};
use crate::access::batch::{BatchKind, BatchQuery};
use crate::access::query::{PrefetchSemantics, Query, SelectQuery};
use crate::access::snapshot::DataRow;
use crate::access::transaction::{Transaction, TransactionConnection};
use crate::error::{Error, Result};
use crate::map::{DbEntity, EntityResolver};
use crate::value::Value;

type PkKey = Vec<(String, Value)>;
type Table = HashMap<PkKey, BTreeMap<String, Value>>;

/// One executed batch, for order assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpLogEntry {
    /// Target table.
    pub table: String,
    /// Batch kind.
    pub kind: BatchKind,
    /// Number of rows in the batch.
    pub rows: usize,
}

/// No-op connection enlisted by [`MemoryNode`], so transactions follow the
/// same lifecycle as with a real driver.
pub struct MemoryConnection;

impl TransactionConnection for MemoryConnection {
    fn name(&self) -> &str {
        "memory"
    }

    fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// In-memory data source.
pub struct MemoryNode {
    name: String,
    resolver: Arc<EntityResolver>,
    tables: Mutex<HashMap<String, Table>>,
    sequences: Mutex<HashMap<String, i64>>,
    op_log: Mutex<Vec<OpLogEntry>>,
    select_count: AtomicUsize,
}

impl MemoryNode {
    /// Create an empty node over the given metadata.
    pub fn new(name: impl Into<String>, resolver: Arc<EntityResolver>) -> Self {
        Self {
            name: name.into(),
            resolver,
            tables: Mutex::new(HashMap::new()),
            sequences: Mutex::new(HashMap::new()),
            op_log: Mutex::new(Vec::new()),
            select_count: AtomicUsize::new(0),
        }
    }

    /// Insert a row directly, bypassing the batch pipeline. Test fixture
    /// helper.
    pub fn seed_row(&self, table: &str, values: BTreeMap<String, Value>) -> Result<()> {
        let entity = self.resolver.db_entity(table)?;
        let key = Self::pk_key(entity, &values)?;
        self.tables
            .lock()
            .entry(table.to_string())
            .or_default()
            .insert(key, values);
        Ok(())
    }

    /// All rows of a table, in unspecified order.
    pub fn table_rows(&self, table: &str) -> Vec<BTreeMap<String, Value>> {
        self.tables
            .lock()
            .get(table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Executed batches, in execution order.
    pub fn op_log(&self) -> Vec<OpLogEntry> {
        self.op_log.lock().clone()
    }

    /// Reset the operation log.
    pub fn clear_op_log(&self) {
        self.op_log.lock().clear();
    }

    /// Number of selects executed.
    pub fn select_count(&self) -> usize {
        self.select_count.load(Ordering::SeqCst)
    }

    fn pk_key(entity: &DbEntity, values: &BTreeMap<String, Value>) -> Result<PkKey> {
        let mut key = Vec::new();
        for column in entity.primary_key_names() {
            let value = values.get(column).cloned().ok_or_else(|| {
                Error::Query(format!("row for '{}' is missing key column '{column}'", entity.name))
            })?;
            key.push((column.to_string(), value));
        }
        if key.is_empty() {
            return Err(Error::Mapping(format!("table '{}' has no primary key", entity.name)));
        }
        Ok(key)
    }

    fn matches(row: &BTreeMap<String, Value>, qualifier: &BTreeMap<String, Value>) -> bool {
        qualifier.iter().all(|(column, expected)| {
            let actual = row.get(column).unwrap_or(&Value::Null);
            actual == expected
        })
    }

    fn run_select(&self, select: &SelectQuery) -> Result<Vec<DataRow>> {
        self.select_count.fetch_add(1, Ordering::SeqCst);
        // Join tables have no object entity; they are selectable by their
        // table name directly.
        let entity = self.resolver.obj_entity(&select.entity).ok();
        let db = match entity {
            Some(entity) => self.resolver.db_entity_for(entity)?,
            None => self.resolver.db_entity(&select.entity)?,
        };
        let tables = self.tables.lock();
        let rows: Vec<BTreeMap<String, Value>> = tables
            .get(&db.name)
            .map(|table| {
                table
                    .values()
                    .filter(|row| Self::matches(row, &select.qualifier))
                    .filter(|row| match &select.in_qualifier {
                        None => true,
                        Some((column, values)) => {
                            let actual = row.get(column).unwrap_or(&Value::Null);
                            values.contains(actual)
                        }
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        drop(tables);

        // Joint prefetches widen each main row with prefix-qualified child
        // columns from a simulated join.
        let joint: Vec<&str> = select
            .prefetches
            .iter()
            .filter(|p| p.semantics == PrefetchSemantics::Joint)
            .map(|p| p.relationship.as_str())
            .collect();
        if joint.is_empty() {
            return Ok(rows.into_iter().map(DataRow::new).collect());
        }
        let Some(entity) = entity else {
            return Err(Error::Query(format!(
                "'{}' has no object entity; joint prefetches are not available",
                select.entity
            )));
        };

        let mut joined = Vec::new();
        for row in rows {
            let mut expansions: Vec<BTreeMap<String, Value>> = vec![row.clone()];
            for rel_name in &joint {
                let rel = entity.relationship(rel_name).ok_or_else(|| {
                    Error::Mapping(format!("unknown relationship '{}.{rel_name}'", entity.name))
                })?;
                let db_rel = db.relationship(rel.first_db_relationship()).ok_or_else(|| {
                    Error::Mapping(format!("unmapped db relationship '{rel_name}'"))
                })?;
                let target_table = self.resolver.db_entity(&db_rel.target_entity)?;
                let tables = self.tables.lock();
                let children: Vec<BTreeMap<String, Value>> = tables
                    .get(&target_table.name)
                    .map(|t| {
                        t.values()
                            .filter(|child| {
                                db_rel.joins.iter().all(|join| {
                                    child.get(&join.target) == row.get(&join.source)
                                })
                            })
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                drop(tables);

                let mut next = Vec::new();
                for base in &expansions {
                    if children.is_empty() {
                        next.push(base.clone());
                        continue;
                    }
                    for child in &children {
                        let mut widened = base.clone();
                        for (column, value) in child {
                            widened.insert(format!("{rel_name}.{column}"), value.clone());
                        }
                        next.push(widened);
                    }
                }
                expansions = next;
            }
            joined.extend(expansions);
        }
        Ok(joined.into_iter().map(DataRow::new).collect())
    }

    fn run_batch(&self, batch: &BatchQuery) -> Result<usize> {
        let entity = self.resolver.db_entity(&batch.table)?;
        let resolved = batch.resolved_rows()?;
        let mut tables = self.tables.lock();
        let table = tables.entry(batch.table.clone()).or_default();
        let mut affected = 0;
        match batch.kind {
            BatchKind::Insert => {
                for (_, values, _) in &resolved {
                    let key = Self::pk_key(entity, values)?;
                    if table.insert(key, values.clone()).is_some() {
                        return Err(Error::Query(format!(
                            "duplicate primary key on insert into '{}'",
                            batch.table
                        )));
                    }
                    affected += 1;
                }
            }
            BatchKind::Update => {
                for (_, values, qualifier) in &resolved {
                    for row in table.values_mut() {
                        if Self::matches(row, qualifier) {
                            for (column, value) in values {
                                row.insert(column.clone(), value.clone());
                            }
                            affected += 1;
                        }
                    }
                }
            }
            BatchKind::Delete => {
                for (_, _, qualifier) in &resolved {
                    let before = table.len();
                    table.retain(|_, row| !Self::matches(row, qualifier));
                    affected += before - table.len();
                }
            }
        }
        drop(tables);
        self.op_log.lock().push(OpLogEntry {
            table: batch.table.clone(),
            kind: batch.kind,
            rows: resolved.len(),
        });
        debug!(node = %self.name, table = %batch.table, kind = ?batch.kind, affected, "batch executed");
        Ok(affected)
    }
}

impl DataNode for MemoryNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn perform_queries(
        &self,
        queries: &[Query],
        observer: &mut dyn OperationObserver,
        tx: &mut Transaction,
    ) {
        if tx.connection_count() == 0 {
            if let Err(err) = tx.add_connection(Box::new(MemoryConnection)) {
                observer.next_global_exception(err);
                return;
            }
        }
        for query in queries {
            match query {
                Query::Select(select) => match self.run_select(select) {
                    Ok(rows) => observer.next_rows(query, rows),
                    Err(err) => {
                        observer.next_query_exception(query, err);
                        return;
                    }
                },
                Query::Batch(batch) => match self.run_batch(batch) {
                    Ok(count) => observer.next_count(query, count),
                    Err(err) => {
                        observer.next_query_exception(query, err);
                        return;
                    }
                },
                Query::ObjectId(_) | Query::Relationship(_) => {
                    observer.next_query_exception(
                        query,
                        Error::Query(
                            "identity and relationship queries must be routed through the \
                             query action chain"
                                .to_string(),
                        ),
                    );
                    return;
                }
            }
        }
    }

    fn pk_generator(&self) -> &dyn PkGenerator {
        self
    }
}

impl PkGenerator for MemoryNode {
    fn generate_pk(&self, entity: &DbEntity) -> Result<Value> {
        let mut sequences = self.sequences.lock();
        let next = sequences.entry(entity.name.clone()).or_insert(200);
        *next += 1;
        Ok(Value::Int64(*next))
    }
}
