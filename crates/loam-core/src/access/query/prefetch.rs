//! Wiring prefetched objects to their parents.
//!
//! Prefetch connections bypass diff recording: fetched relationships are
//! facts from the database, not local edits, so arcs are set directly on
//! the objects.

use std::collections::HashMap;

use crate::access::object_store::ObjectStore;
use crate::access::snapshot::DataRow;
use crate::error::{Error, Result};
use crate::map::EntityResolver;
use crate::object::{ObjectId, Persistent};
use crate::value::Value;

/// Extract the child row embedded in a joint-prefetch result row. Returns
/// `None` when the outer join produced no child (all prefixed columns
/// absent or NULL).
pub fn child_row_from_joint(row: &DataRow, relationship: &str) -> Option<DataRow> {
    let prefix = format!("{relationship}.");
    let mut values = std::collections::BTreeMap::new();
    for (column, value) in row.values() {
        if let Some(stripped) = column.strip_prefix(&prefix) {
            // Nested joint prefixes stay intact for recursive extraction.
            values.insert(stripped.to_string(), value.clone());
        }
    }
    if values.is_empty() || values.values().all(|v| *v == Value::Null) {
        return None;
    }
    Some(DataRow::new(values))
}

/// Set both directions of one fetched arc without recording a diff.
pub fn connect_pair(
    store: &ObjectStore,
    resolver: &EntityResolver,
    parent_entity: &str,
    relationship: &str,
    parent: &ObjectId,
    child: &ObjectId,
) -> Result<()> {
    let entity = resolver.obj_entity(parent_entity)?;
    let rel = entity.relationship(relationship).ok_or_else(|| {
        Error::Mapping(format!("unknown relationship '{parent_entity}.{relationship}'"))
    })?;
    store.with_object(parent, |object| {
        object.add_arc_target(relationship, child.clone());
    });
    if let Some(reverse) = resolver.reverse_obj_relationship(rel) {
        let reverse_name = reverse.name.clone();
        store.with_object(child, |object| {
            object.add_arc_target(&reverse_name, parent.clone());
        });
    }
    Ok(())
}

/// Connect disjointly prefetched children to their parents by matching
/// foreign-key column values from the snapshot cache.
pub fn connect_disjoint(
    store: &ObjectStore,
    resolver: &EntityResolver,
    parent_entity: &str,
    relationship: &str,
    parents: &[ObjectId],
    children: &[ObjectId],
) -> Result<()> {
    let entity = resolver.obj_entity(parent_entity)?;
    let rel = entity.relationship(relationship).ok_or_else(|| {
        Error::Mapping(format!("unknown relationship '{parent_entity}.{relationship}'"))
    })?;
    if rel.is_flattened() {
        return Err(Error::Query(format!(
            "flattened relationship '{relationship}' cannot be connected from row snapshots"
        )));
    }
    let db = resolver.db_entity_for(entity)?;
    let db_rel = db.relationship(rel.first_db_relationship()).ok_or_else(|| {
        Error::Mapping(format!("unmapped db relationship '{relationship}'"))
    })?;
    let join = db_rel.joins.first().ok_or_else(|| {
        Error::Mapping(format!("relationship '{relationship}' has no joins"))
    })?;

    if rel.to_many {
        // Children carry the foreign key; index parents by their key value.
        let mut by_key: HashMap<Value, &ObjectId> = HashMap::new();
        for parent in parents {
            if let Some(value) = parent_column_value(store, parent, &join.source) {
                by_key.insert(value, parent);
            }
        }
        for child in children {
            let Some(fk) = store
                .snapshot_cache()
                .get_cached_snapshot(child)
                .and_then(|row| row.get(&join.target).cloned())
            else {
                continue;
            };
            if let Some(parent) = by_key.get(&fk) {
                connect_pair(store, resolver, parent_entity, relationship, parent, child)?;
            }
        }
    } else {
        // Parents carry the foreign key; index children by their key value.
        let mut by_key: HashMap<Value, &ObjectId> = HashMap::new();
        for child in children {
            if let Some(value) = child.effective_value(&join.target).or_else(|| {
                store
                    .snapshot_cache()
                    .get_cached_snapshot(child)
                    .and_then(|row| row.get(&join.target).cloned())
            }) {
                by_key.insert(value, child);
            }
        }
        for parent in parents {
            let Some(fk) = parent_column_value(store, parent, &join.source) else {
                continue;
            };
            if fk == Value::Null {
                continue;
            }
            if let Some(child) = by_key.get(&fk) {
                connect_pair(store, resolver, parent_entity, relationship, parent, child)?;
            }
        }
    }
    Ok(())
}

/// A parent-side column value: from the id's key when it is a key column,
/// otherwise from the cached snapshot.
fn parent_column_value(store: &ObjectStore, id: &ObjectId, column: &str) -> Option<Value> {
    id.effective_value(column).or_else(|| {
        store
            .snapshot_cache()
            .get_cached_snapshot(id)
            .and_then(|row| row.get(column).cloned())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_row_extraction() {
        let row = DataRow::from_pairs([
            ("ID".to_string(), Value::Int64(1)),
            ("paintings.ID".to_string(), Value::Int64(10)),
            ("paintings.TITLE".to_string(), Value::from("P")),
        ]);
        let child = child_row_from_joint(&row, "paintings").unwrap();
        assert_eq!(child.get("ID"), Some(&Value::Int64(10)));
        assert_eq!(child.get("TITLE"), Some(&Value::from("P")));
        assert!(child.get("paintings.ID").is_none());
    }

    #[test]
    fn test_missing_child_yields_none() {
        let row = DataRow::from_pairs([("ID".to_string(), Value::Int64(1))]);
        assert!(child_row_from_joint(&row, "paintings").is_none());
    }
}
