//! Translation of object-level diffs into column-level write sets.

use std::collections::BTreeMap;

use crate::access::batch::BatchValue;
use crate::access::object_store::ObjectStore;
use crate::error::{Error, Result};
use crate::map::EntityResolver;
use crate::object::ObjectId;
use crate::value::Value;

fn fk_value(target: &ObjectId, column: &str) -> BatchValue {
    match target.effective_value(column) {
        Some(value) => BatchValue::Literal(value),
        // The target's key is pending an earlier insert in the same commit;
        // resolve from its replacement map at execution time.
        None => BatchValue::Propagated {
            master: target.clone(),
            column: column.to_string(),
        },
    }
}

/// Full column snapshot for a new object's INSERT.
///
/// Built in three layers, later layers never overwriting earlier ones:
/// changed/held properties map to their columns, to-one arcs map to
/// foreign-key values, and the id's key columns fill whatever is left.
pub fn insert_snapshot(
    store: &ObjectStore,
    resolver: &EntityResolver,
    id: &ObjectId,
) -> Result<BTreeMap<String, BatchValue>> {
    let entity = resolver.obj_entity(id.entity_name())?;
    let db = resolver.db_entity_for(entity)?;
    let mut values: BTreeMap<String, BatchValue> = BTreeMap::new();

    for attribute in &entity.attributes {
        let value = store
            .read_property(id, &attribute.name)
            .unwrap_or(Value::Null);
        values.insert(attribute.db_attribute.clone(), BatchValue::Literal(value));
    }

    apply_arc_columns(store, resolver, id, &mut values, true)?;

    for column in db.primary_key_names() {
        if !values.contains_key(column) || values[column].is_null_literal() {
            values.insert(column.to_string(), fk_value(id, column));
        }
    }
    Ok(values)
}

/// Minimal column write set for a modified object's UPDATE. An empty result
/// is a phantom modification: nothing actually changed at the database
/// level, and no SQL should be issued.
pub fn update_snapshot(
    store: &ObjectStore,
    resolver: &EntityResolver,
    id: &ObjectId,
) -> Result<BTreeMap<String, BatchValue>> {
    let entity = resolver.obj_entity(id.entity_name())?;
    let mut values: BTreeMap<String, BatchValue> = BTreeMap::new();

    if let Some(diff) = store.object_diff(id) {
        for (property, change) in diff.property_changes() {
            let attribute = entity.attribute(&property).ok_or_else(|| {
                Error::Mapping(format!(
                    "entity '{}' has no attribute '{property}'",
                    entity.name
                ))
            })?;
            values.insert(
                attribute.db_attribute.clone(),
                BatchValue::Literal(change.new_value.clone()),
            );
        }
    }

    apply_arc_columns(store, resolver, id, &mut values, false)?;
    Ok(values)
}

/// Map net to-one arc changes to foreign-key columns. Deletions null the
/// columns first so a substitute (delete old, create new) nets out to the
/// new target's key.
fn apply_arc_columns(
    store: &ObjectStore,
    resolver: &EntityResolver,
    id: &ObjectId,
    values: &mut BTreeMap<String, BatchValue>,
    skip_present: bool,
) -> Result<()> {
    let Some(diff) = store.object_diff(id) else {
        return Ok(());
    };
    let entity = resolver.obj_entity(id.entity_name())?;
    let db = resolver.db_entity_for(entity)?;

    let changes = diff.arc_changes();
    for pass_created in [false, true] {
        for change in changes.iter().filter(|c| c.created == pass_created) {
            let Some(relationship) = entity.relationship(&change.arc) else {
                continue;
            };
            if relationship.to_many || relationship.is_flattened() {
                continue;
            }
            let db_rel = db
                .relationship(relationship.first_db_relationship())
                .ok_or_else(|| {
                    Error::Mapping(format!(
                        "unmapped db relationship for '{}.{}'",
                        entity.name, change.arc
                    ))
                })?;
            for join in &db_rel.joins {
                if skip_present && values.contains_key(&join.source) {
                    if !values[&join.source].is_null_literal() {
                        continue;
                    }
                }
                let value = if change.created {
                    fk_value(&change.target, &join.target)
                } else {
                    BatchValue::Literal(Value::Null)
                };
                values.insert(join.source.clone(), value);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::snapshot_cache::SnapshotCache;
    use crate::map::{DbAttribute, DbEntity, DbJoin, DbRelationship, ObjAttribute, ObjEntity, ObjRelationship};
    use crate::object::{DataObject, Persistent};
    use std::sync::Arc;

    fn fixtures() -> (ObjectStore, Arc<EntityResolver>) {
        let mut resolver = EntityResolver::new();
        resolver.add_db_entity(DbEntity::new(
            "ARTIST",
            vec![DbAttribute::generated_pk("ID"), DbAttribute::new("NAME")],
        ));
        resolver.add_db_entity(
            DbEntity::new(
                "PAINTING",
                vec![
                    DbAttribute::generated_pk("ID"),
                    DbAttribute::new("TITLE"),
                    DbAttribute::new("ARTIST_ID"),
                ],
            )
            .with_relationship(DbRelationship::to_one(
                "artist",
                "PAINTING",
                "ARTIST",
                vec![DbJoin::new("ARTIST_ID", "ID")],
            )),
        );
        resolver.add_obj_entity(
            ObjEntity::new("Artist", "ARTIST").with_attribute(ObjAttribute::new("name", "NAME")),
        );
        resolver.add_obj_entity(
            ObjEntity::new("Painting", "PAINTING")
                .with_attribute(ObjAttribute::new("title", "TITLE"))
                .with_relationship(ObjRelationship::new(
                    "artist", "Painting", "Artist", false, "artist",
                )),
        );
        let resolver = Arc::new(resolver);
        let store = ObjectStore::new(
            Arc::new(SnapshotCache::with_defaults()),
            Arc::clone(&resolver),
        );
        (store, resolver)
    }

    #[test]
    fn test_insert_snapshot_with_pending_fk() {
        let (store, resolver) = fixtures();
        let artist_id = ObjectId::temporary("Artist");
        store.register_node(artist_id.clone(), Box::new(DataObject::new("Artist")));
        store.record_object_created(&artist_id).unwrap();

        let painting_id = ObjectId::temporary("Painting");
        store.register_node(painting_id.clone(), Box::new(DataObject::new("Painting")));
        store.record_object_created(&painting_id).unwrap();
        store
            .record_property_changed(&painting_id, "title", Value::from("P1"))
            .unwrap();
        store
            .record_arc_created(&painting_id, artist_id.clone(), "artist")
            .unwrap();

        let snapshot = insert_snapshot(&store, &resolver, &painting_id).unwrap();
        assert_eq!(
            snapshot.get("TITLE"),
            Some(&BatchValue::Literal(Value::from("P1")))
        );
        // The artist's key is not generated yet: a lazy placeholder.
        assert!(matches!(
            snapshot.get("ARTIST_ID"),
            Some(BatchValue::Propagated { column, .. }) if column == "ID"
        ));

        // Once the key is generated, the placeholder resolves.
        artist_id.attach_replacement("ID", Value::Int64(201));
        assert_eq!(
            snapshot.get("ARTIST_ID").unwrap().resolve().unwrap(),
            Value::Int64(201)
        );
    }

    #[test]
    fn test_phantom_update_is_empty() {
        let (store, resolver) = fixtures();
        let id = ObjectId::with_single_key("Artist", "ID", Value::Int64(1));
        let mut object = DataObject::new("Artist");
        object.write_property("name", Value::from("same"));
        object.set_persistence_state(crate::object::PersistenceState::Committed);
        store.register_node(id.clone(), Box::new(object));
        store
            .record_property_changed(&id, "name", Value::from("same"))
            .unwrap();

        let snapshot = update_snapshot(&store, &resolver, &id).unwrap();
        assert!(snapshot.is_empty());
    }

    #[test]
    fn test_arc_delete_nulls_fk() {
        let (store, resolver) = fixtures();
        let artist = ObjectId::with_single_key("Artist", "ID", Value::Int64(1));
        let painting = ObjectId::with_single_key("Painting", "ID", Value::Int64(2));
        let mut object = DataObject::new("Painting");
        object.set_persistence_state(crate::object::PersistenceState::Committed);
        object.add_arc_target("artist", artist.clone());
        store.register_node(painting.clone(), Box::new(object));
        store
            .record_arc_deleted(&painting, artist, "artist")
            .unwrap();

        let snapshot = update_snapshot(&store, &resolver, &painting).unwrap();
        assert_eq!(
            snapshot.get("ARTIST_ID"),
            Some(&BatchValue::Literal(Value::Null))
        );
    }
}
