//! Row snapshots.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::value::Value;

static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

/// A point-in-time map of physical column values for one database row.
///
/// Rows are immutable once created. Each carries a process-wide monotonic
/// version; a row produced by diffing or merging also carries the version it
/// replaces, which the snapshot cache uses to validate incremental
/// application: a row whose `replaces_version` does not match the cached
/// version cannot be safely merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataRow {
    values: BTreeMap<String, Value>,
    version: u64,
    replaces_version: Option<u64>,
}

impl DataRow {
    /// Create a row with a fresh version.
    pub fn new(values: BTreeMap<String, Value>) -> Self {
        Self {
            values,
            version: NEXT_VERSION.fetch_add(1, Ordering::Relaxed),
            replaces_version: None,
        }
    }

    /// Create a row from column/value pairs.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self::new(pairs.into_iter().collect())
    }

    /// Declare which cached version this row replaces.
    pub fn replacing(mut self, version: u64) -> Self {
        self.replaces_version = Some(version);
        self
    }

    /// Column value, if present.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    /// Whether the row carries a value for a column.
    pub fn contains_column(&self, column: &str) -> bool {
        self.values.contains_key(column)
    }

    /// All column/value pairs.
    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// This row's version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The cached version this row replaces, if declared.
    pub fn replaces_version(&self) -> Option<u64> {
        self.replaces_version
    }

    /// Column-level delta from `self` to `newer`: the columns whose values
    /// differ, with `newer`'s values. Returns `None` when nothing changed.
    pub fn diff(&self, newer: &DataRow) -> Option<DataRow> {
        let changed: BTreeMap<String, Value> = newer
            .values
            .iter()
            .filter(|(column, value)| self.values.get(*column) != Some(value))
            .map(|(c, v)| (c.clone(), v.clone()))
            .collect();
        if changed.is_empty() {
            None
        } else {
            Some(DataRow::new(changed).replacing(self.version))
        }
    }

    /// Apply a column-level delta, producing a merged row with a fresh
    /// version replacing this one. The caller is responsible for checking
    /// that `delta.replaces_version()` matches `self.version()` first.
    pub fn apply_diff(&self, delta: &DataRow) -> DataRow {
        let mut values = self.values.clone();
        for (column, value) in &delta.values {
            values.insert(column.clone(), value.clone());
        }
        DataRow::new(values).replacing(self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pairs: &[(&str, Value)]) -> DataRow {
        DataRow::from_pairs(pairs.iter().map(|(c, v)| (c.to_string(), v.clone())))
    }

    #[test]
    fn test_versions_monotonic() {
        let a = row(&[("ID", Value::Int64(1))]);
        let b = row(&[("ID", Value::Int64(1))]);
        assert!(b.version() > a.version());
    }

    #[test]
    fn test_diff_and_apply() {
        let old = row(&[("ID", Value::Int64(1)), ("NAME", Value::from("a"))]);
        let new = row(&[("ID", Value::Int64(1)), ("NAME", Value::from("b"))]);

        let delta = old.diff(&new).unwrap();
        assert_eq!(delta.len(), 1);
        assert_eq!(delta.get("NAME"), Some(&Value::from("b")));
        assert_eq!(delta.replaces_version(), Some(old.version()));

        let merged = old.apply_diff(&delta);
        assert_eq!(merged.get("NAME"), Some(&Value::from("b")));
        assert_eq!(merged.get("ID"), Some(&Value::Int64(1)));
        assert_eq!(merged.replaces_version(), Some(old.version()));
    }

    #[test]
    fn test_diff_of_identical_rows_is_none() {
        let old = row(&[("ID", Value::Int64(1))]);
        let new = row(&[("ID", Value::Int64(1))]);
        assert!(old.diff(&new).is_none());
    }
}
