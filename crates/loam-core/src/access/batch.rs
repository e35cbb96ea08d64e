//! Batched physical write operations.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::object::ObjectId;
use crate::value::Value;

/// Kind of write a batch performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchKind {
    /// INSERT rows.
    Insert,
    /// UPDATE rows.
    Update,
    /// DELETE rows.
    Delete,
}

/// A column value in a batch row: either a known literal, or a key value
/// propagated from another object's id that may not be generated yet.
///
/// Propagated values resolve lazily at execution time. Batches are executed
/// in foreign-key dependency order, so by the time a dependent batch runs,
/// the master insert has completed and its generated key is available in the
/// id's replacement map.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchValue {
    /// A concrete value.
    Literal(Value),
    /// A value read from another id's key or replacement map at execution
    /// time.
    Propagated {
        /// Id supplying the value.
        master: ObjectId,
        /// Key column on the master.
        column: String,
    },
}

impl BatchValue {
    /// Resolve to a concrete value.
    pub fn resolve(&self) -> Result<Value> {
        match self {
            BatchValue::Literal(value) => Ok(value.clone()),
            BatchValue::Propagated { master, column } => {
                master.effective_value(column).ok_or_else(|| {
                    Error::UnresolvedId(format!("no value for '{column}' propagated from {master}"))
                })
            }
        }
    }

    /// Whether the value is a literal NULL.
    pub fn is_null_literal(&self) -> bool {
        matches!(self, BatchValue::Literal(Value::Null))
    }
}

/// One row of a batch.
#[derive(Debug, Clone)]
pub struct BatchRow {
    /// The object this row belongs to.
    pub id: ObjectId,
    /// Column values written by the operation.
    pub values: BTreeMap<String, BatchValue>,
    /// WHERE-clause column values (empty for inserts).
    pub qualifier: BTreeMap<String, BatchValue>,
}

/// A batched write against one table.
///
/// All rows of one batch share the same shape: the same set of written
/// columns and the same set of null-valued qualifier columns. Rows of
/// different shapes go into separate batches so a driver can bind each
/// batch as one prepared statement.
#[derive(Debug, Clone)]
pub struct BatchQuery {
    /// What the batch does.
    pub kind: BatchKind,
    /// Target table.
    pub table: String,
    /// Written columns, sorted.
    pub columns: Vec<String>,
    /// Qualifier columns, sorted (empty for inserts).
    pub qualifier_columns: Vec<String>,
    /// Qualifier columns whose value is NULL, affecting statement shape.
    pub null_qualifier_columns: BTreeSet<String>,
    /// Rows in execution order.
    pub rows: Vec<BatchRow>,
}

impl BatchQuery {
    /// Create an empty batch.
    pub fn new(kind: BatchKind, table: impl Into<String>) -> Self {
        Self {
            kind,
            table: table.into(),
            columns: Vec::new(),
            qualifier_columns: Vec::new(),
            null_qualifier_columns: BTreeSet::new(),
            rows: Vec::new(),
        }
    }

    /// Shape key used to coalesce compatible rows into one batch: the table,
    /// the written column set, and the null-qualifier column set.
    pub fn shape_key(
        kind: BatchKind,
        table: &str,
        values: &BTreeMap<String, BatchValue>,
        qualifier: &BTreeMap<String, BatchValue>,
    ) -> (BatchKind, String, Vec<String>, Vec<String>) {
        let columns: Vec<String> = values.keys().cloned().collect();
        let nulls: Vec<String> = qualifier
            .iter()
            .filter(|(_, v)| v.is_null_literal())
            .map(|(c, _)| c.clone())
            .collect();
        (kind, table.to_string(), columns, nulls)
    }

    /// Append a row, updating the batch's column sets.
    pub fn add_row(&mut self, row: BatchRow) {
        if self.rows.is_empty() {
            self.columns = row.values.keys().cloned().collect();
            self.qualifier_columns = row.qualifier.keys().cloned().collect();
            self.null_qualifier_columns = row
                .qualifier
                .iter()
                .filter(|(_, v)| v.is_null_literal())
                .map(|(c, _)| c.clone())
                .collect();
        }
        self.rows.push(row);
    }

    /// Resolve every row to concrete values.
    pub fn resolved_rows(
        &self,
    ) -> Result<Vec<(ObjectId, BTreeMap<String, Value>, BTreeMap<String, Value>)>> {
        let mut resolved = Vec::with_capacity(self.rows.len());
        for row in &self.rows {
            let mut values = BTreeMap::new();
            for (column, value) in &row.values {
                values.insert(column.clone(), value.resolve()?);
            }
            let mut qualifier = BTreeMap::new();
            for (column, value) in &row.qualifier {
                qualifier.insert(column.clone(), value.resolve()?);
            }
            resolved.push((row.id.clone(), values, qualifier));
        }
        Ok(resolved)
    }
}
