//! WHERE-clause construction for update and delete batches.

use std::collections::BTreeMap;

use crate::access::batch::BatchValue;
use crate::access::object_store::ObjectStore;
use crate::error::{Error, Result};
use crate::map::EntityResolver;
use crate::object::ObjectId;
use crate::value::Value;

/// Build the qualifier for one update or delete row: the primary-key
/// columns, plus the pre-change values of any optimistic-lock attributes.
///
/// A key column missing from the id is looked up through the object's
/// to-one arcs: a dependent-PK detail inherits its key from the master,
/// which may itself still be awaiting insertion, in which case a lazy
/// placeholder is emitted.
pub fn build_qualifier(
    store: &ObjectStore,
    resolver: &EntityResolver,
    id: &ObjectId,
) -> Result<BTreeMap<String, BatchValue>> {
    let entity = resolver.obj_entity(id.entity_name())?;
    let db = resolver.db_entity_for(entity)?;
    let mut qualifier = BTreeMap::new();

    for column in db.primary_key_names() {
        let value = match id.effective_value(column) {
            Some(value) => BatchValue::Literal(value),
            None => master_key_value(store, resolver, id, column)?,
        };
        qualifier.insert(column.to_string(), value);
    }

    let diff = store.object_diff(id);
    for attribute in entity.lock_attributes() {
        let original = diff
            .as_ref()
            .and_then(|d| d.original_value(&attribute.name).cloned())
            .or_else(|| store.read_property(id, &attribute.name))
            .unwrap_or(Value::Null);
        qualifier.insert(attribute.db_attribute.clone(), BatchValue::Literal(original));
    }
    Ok(qualifier)
}

/// Locate a key column propagated from a master object through a
/// dependent-PK relationship.
fn master_key_value(
    store: &ObjectStore,
    resolver: &EntityResolver,
    id: &ObjectId,
    column: &str,
) -> Result<BatchValue> {
    let entity = resolver.obj_entity(id.entity_name())?;
    let db = resolver.db_entity_for(entity)?;

    for relationship in &entity.relationships {
        if relationship.to_many || relationship.is_flattened() {
            continue;
        }
        let Some(db_rel) = db.relationship(relationship.first_db_relationship()) else {
            continue;
        };
        let Some(reverse) = resolver.reverse_db_relationship(db_rel) else {
            continue;
        };
        if !reverse.to_dependent_pk {
            continue;
        }
        for join in &db_rel.joins {
            if join.source != column {
                continue;
            }
            let Some(master) = store.arc_targets(id, &relationship.name).into_iter().next()
            else {
                continue;
            };
            return Ok(match master.effective_value(&join.target) {
                Some(value) => BatchValue::Literal(value),
                None => BatchValue::Propagated {
                    master,
                    column: join.target.clone(),
                },
            });
        }
    }
    Err(Error::UnresolvedId(format!(
        "no value for key column '{column}' of {id}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::snapshot_cache::SnapshotCache;
    use crate::map::{DbAttribute, DbEntity, ObjAttribute, ObjEntity};
    use crate::object::{DataObject, PersistenceState, Persistent};
    use std::sync::Arc;

    #[test]
    fn test_qualifier_includes_pk_and_lock_originals() {
        let mut resolver = EntityResolver::new();
        resolver.add_db_entity(DbEntity::new(
            "ARTIST",
            vec![DbAttribute::pk("ID"), DbAttribute::new("NAME")],
        ));
        resolver.add_obj_entity(
            ObjEntity::new("Artist", "ARTIST")
                .with_attribute(ObjAttribute::new("name", "NAME").with_lock()),
        );
        let resolver = Arc::new(resolver);
        let store = ObjectStore::new(
            Arc::new(SnapshotCache::with_defaults()),
            Arc::clone(&resolver),
        );

        let id = ObjectId::with_single_key("Artist", "ID", Value::Int64(7));
        let mut object = DataObject::new("Artist");
        object.write_property("name", Value::from("old"));
        object.set_persistence_state(PersistenceState::Committed);
        store.register_node(id.clone(), Box::new(object));
        store
            .record_property_changed(&id, "name", Value::from("new"))
            .unwrap();

        let qualifier = build_qualifier(&store, &resolver, &id).unwrap();
        assert_eq!(
            qualifier.get("ID"),
            Some(&BatchValue::Literal(Value::Int64(7)))
        );
        // The lock column qualifies on the value before the local change.
        assert_eq!(
            qualifier.get("NAME"),
            Some(&BatchValue::Literal(Value::from("old")))
        );
    }
}
