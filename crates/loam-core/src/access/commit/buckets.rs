//! Classification of a pending change set into ordered write batches.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::debug;

use crate::access::batch::{BatchKind, BatchQuery, BatchRow};
use crate::access::node::PkGenerator;
use crate::access::object_store::ObjectStore;
use crate::error::{Error, Result};
use crate::map::{DbEntity, EntityResolver, EntitySorter};
use crate::object::{ObjectId, PersistenceState};

use super::diff_builder::{insert_snapshot, update_snapshot};
use super::flattened::FlattenedArcKey;
use super::qualifier::build_qualifier;

/// Everything a flush executes, in execution order within each collection.
#[derive(Debug, Default)]
pub struct CommitBuckets {
    /// Insert batches, parent tables first.
    pub inserts: Vec<BatchQuery>,
    /// Join-table inserts for created flattened arcs.
    pub flattened_inserts: Vec<BatchQuery>,
    /// Update batches.
    pub updates: Vec<BatchQuery>,
    /// Join-table deletes for removed flattened arcs.
    pub flattened_deletes: Vec<BatchQuery>,
    /// Delete batches, child tables first.
    pub deletes: Vec<BatchQuery>,
    /// Modified ids whose changes do not touch the database.
    pub phantoms: Vec<ObjectId>,
    /// New ids in insert execution order.
    pub inserted: Vec<ObjectId>,
    /// Modified ids with real column changes.
    pub updated: Vec<ObjectId>,
    /// Deleted ids.
    pub deleted: Vec<ObjectId>,
}

/// Append a row to the batch with a matching shape, creating one if needed.
/// Batch order within a table follows first appearance of each shape.
fn coalesce(
    batches: &mut Vec<BatchQuery>,
    kind: BatchKind,
    table: &str,
    row: BatchRow,
) {
    let (_, _, columns, nulls) = BatchQuery::shape_key(kind, table, &row.values, &row.qualifier);
    for batch in batches.iter_mut() {
        if batch.kind == kind
            && batch.table == table
            && batch.columns == columns
            && batch.null_qualifier_columns.iter().cloned().collect::<Vec<_>>() == nulls
        {
            batch.add_row(row);
            return;
        }
    }
    let mut batch = BatchQuery::new(kind, table);
    batch.add_row(row);
    batches.push(batch);
}

/// Classify dirty objects, generate pending primary keys, and build every
/// batch in dependency order.
pub fn build(
    store: &ObjectStore,
    resolver: &EntityResolver,
    sorter: &EntitySorter,
    pk: &dyn PkGenerator,
) -> Result<CommitBuckets> {
    let mut buckets = CommitBuckets::default();
    let mut new_ids: Vec<ObjectId> = Vec::new();
    let mut modified_ids: Vec<ObjectId> = Vec::new();
    let mut deleted_ids: Vec<ObjectId> = Vec::new();

    for id in store.dirty_ids() {
        match store.object_state(&id) {
            Some(PersistenceState::New) => new_ids.push(id),
            Some(PersistenceState::Modified) => modified_ids.push(id),
            Some(PersistenceState::Deleted) => deleted_ids.push(id),
            _ => {}
        }
    }
    debug!(
        inserts = new_ids.len(),
        updates = modified_ids.len(),
        deletes = deleted_ids.len(),
        "building commit buckets"
    );

    build_flattened(store, resolver, &mut buckets)?;
    build_inserts(store, resolver, sorter, pk, new_ids, &mut buckets)?;
    build_updates(store, resolver, modified_ids, &mut buckets)?;
    build_deletes(store, resolver, sorter, deleted_ids, &mut buckets)?;
    Ok(buckets)
}

fn build_flattened(
    store: &ObjectStore,
    resolver: &EntityResolver,
    buckets: &mut CommitBuckets,
) -> Result<()> {
    // Both arc endpoints may have recorded the same join row; the
    // direction-insensitive key deduplicates them.
    let mut seen: HashMap<FlattenedArcKey, bool> = HashMap::new();
    let mut ordered: Vec<(FlattenedArcKey, String, String, bool)> = Vec::new();

    for id in store.dirty_ids() {
        let Some(diff) = store.object_diff(&id) else {
            continue;
        };
        let entity = resolver.obj_entity(id.entity_name())?;
        for change in diff.arc_changes() {
            let Some(relationship) = entity.relationship(&change.arc) else {
                continue;
            };
            if !relationship.is_flattened() {
                continue;
            }
            let key =
                FlattenedArcKey::new(resolver, relationship, id.clone(), change.target.clone())?;
            if seen.insert(key.clone(), change.created).is_none() {
                ordered.push((
                    key,
                    entity.name.clone(),
                    relationship.name.clone(),
                    change.created,
                ));
            }
        }
    }

    for (key, entity_name, relationship_name, created) in ordered {
        let relationship = resolver
            .obj_entity(&entity_name)?
            .relationship(&relationship_name)
            .ok_or_else(|| {
                Error::Mapping(format!("unknown relationship '{relationship_name}'"))
            })?;
        let values = key.join_snapshot(resolver, relationship)?;
        let row = BatchRow {
            id: ObjectId::temporary(key.join_table()),
            values: if created { values.clone() } else { BTreeMap::new() },
            qualifier: if created { BTreeMap::new() } else { values },
        };
        if created {
            coalesce(
                &mut buckets.flattened_inserts,
                BatchKind::Insert,
                key.join_table(),
                row,
            );
        } else {
            coalesce(
                &mut buckets.flattened_deletes,
                BatchKind::Delete,
                key.join_table(),
                row,
            );
        }
    }
    Ok(())
}

fn build_inserts(
    store: &ObjectStore,
    resolver: &EntityResolver,
    sorter: &EntitySorter,
    pk: &dyn PkGenerator,
    new_ids: Vec<ObjectId>,
    buckets: &mut CommitBuckets,
) -> Result<()> {
    let mut by_table: HashMap<String, Vec<ObjectId>> = HashMap::new();
    let mut tables: Vec<Arc<DbEntity>> = Vec::new();
    for id in new_ids {
        let entity = resolver.obj_entity(id.entity_name())?;
        let db = resolver.db_entity_for(entity)?;
        let rows = by_table.entry(db.name.clone()).or_default();
        if rows.is_empty() {
            tables.push(Arc::clone(db));
        }
        rows.push(id);
    }
    sorter.sort_db_entities(resolver, &mut tables, false);

    for table in &tables {
        let generated = table.generated_pk_attributes();
        if generated.len() > 1 {
            return Err(Error::Mapping(format!(
                "table '{}' maps more than one generated key column",
                table.name
            )));
        }
        let ids = by_table.remove(&table.name).unwrap_or_default();

        if let Some(attribute) = generated.first() {
            for id in &ids {
                if id.effective_value(&attribute.name).is_some() {
                    continue;
                }
                if column_is_propagated(resolver, table, &attribute.name) {
                    // The key arrives from a master row's insert.
                    continue;
                }
                let value = pk.generate_pk(table)?;
                id.attach_replacement(attribute.name.clone(), value);
            }
        }

        let ordered = order_reflexive(store, resolver, table, ids, false, sorter)?;
        for id in ordered {
            let values = insert_snapshot(store, resolver, &id)?;
            let row = BatchRow {
                id: id.clone(),
                values,
                qualifier: BTreeMap::new(),
            };
            coalesce(&mut buckets.inserts, BatchKind::Insert, &table.name, row);
            buckets.inserted.push(id);
        }
    }
    Ok(())
}

/// Whether a key column is filled from a master table through a
/// dependent-PK relationship rather than generated locally.
fn column_is_propagated(resolver: &EntityResolver, table: &DbEntity, column: &str) -> bool {
    resolver.db_entities().any(|entity| {
        entity.relationships.iter().any(|rel| {
            rel.to_dependent_pk
                && rel.target_entity == table.name
                && rel.joins.iter().any(|join| join.target == column)
        })
    })
}

/// Order one table's rows so in-batch parents of reflexive relationships
/// come first (or last, for deletes).
fn order_reflexive(
    store: &ObjectStore,
    resolver: &EntityResolver,
    table: &DbEntity,
    ids: Vec<ObjectId>,
    delete_order: bool,
    sorter: &EntitySorter,
) -> Result<Vec<ObjectId>> {
    let reflexive = table
        .relationships
        .iter()
        .any(|rel| !rel.to_many && rel.target_entity == table.name);
    if !reflexive {
        return Ok(ids);
    }
    let mut items = Vec::with_capacity(ids.len());
    for id in ids {
        let entity = resolver.obj_entity(id.entity_name())?;
        let parent = entity
            .relationships
            .iter()
            .filter(|rel| !rel.to_many && !rel.is_flattened())
            .filter(|rel| rel.target_entity == entity.name)
            .find_map(|rel| store.arc_targets(&id, &rel.name).into_iter().next());
        items.push((id, parent));
    }
    Ok(sorter.sort_objects(items, delete_order))
}

fn build_updates(
    store: &ObjectStore,
    resolver: &EntityResolver,
    modified_ids: Vec<ObjectId>,
    buckets: &mut CommitBuckets,
) -> Result<()> {
    for id in modified_ids {
        let values = update_snapshot(store, resolver, &id)?;
        if values.is_empty() {
            buckets.phantoms.push(id);
            continue;
        }
        let entity = resolver.obj_entity(id.entity_name())?;
        let table = resolver.db_entity_for(entity)?.name.clone();
        let qualifier = build_qualifier(store, resolver, &id)?;
        let row = BatchRow {
            id: id.clone(),
            values,
            qualifier,
        };
        coalesce(&mut buckets.updates, BatchKind::Update, &table, row);
        buckets.updated.push(id);
    }
    Ok(())
}

fn build_deletes(
    store: &ObjectStore,
    resolver: &EntityResolver,
    sorter: &EntitySorter,
    deleted_ids: Vec<ObjectId>,
    buckets: &mut CommitBuckets,
) -> Result<()> {
    let mut by_table: HashMap<String, Vec<ObjectId>> = HashMap::new();
    let mut tables: Vec<Arc<DbEntity>> = Vec::new();
    for id in deleted_ids {
        let entity = resolver.obj_entity(id.entity_name())?;
        let db = resolver.db_entity_for(entity)?;
        let rows = by_table.entry(db.name.clone()).or_default();
        if rows.is_empty() {
            tables.push(Arc::clone(db));
        }
        rows.push(id);
    }
    sorter.sort_db_entities(resolver, &mut tables, true);

    for table in &tables {
        let ids = by_table.remove(&table.name).unwrap_or_default();
        let ordered = order_reflexive(store, resolver, table, ids, true, sorter)?;
        for id in ordered {
            let qualifier = build_qualifier(store, resolver, &id)?;
            let row = BatchRow {
                id: id.clone(),
                values: BTreeMap::new(),
                qualifier,
            };
            coalesce(&mut buckets.deletes, BatchKind::Delete, &table.name, row);
            buckets.deleted.push(id);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::node::{DataNode, MemoryNode};
    use crate::access::snapshot_cache::SnapshotCache;
    use crate::map::{
        DbAttribute, DbJoin, DbRelationship, ObjAttribute, ObjEntity, ObjRelationship,
    };
    use crate::object::{DataObject, Persistent};
    use crate::value::Value;

    fn resolver() -> Arc<EntityResolver> {
        let mut resolver = EntityResolver::new();
        resolver.add_db_entity(
            DbEntity::new(
                "ARTIST",
                vec![DbAttribute::generated_pk("ID"), DbAttribute::new("NAME")],
            )
            .with_relationship(
                DbRelationship::to_many(
                    "paintings",
                    "ARTIST",
                    "PAINTING",
                    vec![DbJoin::new("ID", "ARTIST_ID")],
                )
                .with_reverse("artist"),
            ),
        );
        resolver.add_db_entity(
            DbEntity::new(
                "PAINTING",
                vec![
                    DbAttribute::generated_pk("ID"),
                    DbAttribute::new("TITLE"),
                    DbAttribute::new("ARTIST_ID"),
                ],
            )
            .with_relationship(
                DbRelationship::to_one(
                    "artist",
                    "PAINTING",
                    "ARTIST",
                    vec![DbJoin::new("ARTIST_ID", "ID")],
                )
                .with_reverse("paintings"),
            ),
        );
        resolver.add_obj_entity(
            ObjEntity::new("Artist", "ARTIST")
                .with_attribute(ObjAttribute::new("name", "NAME"))
                .with_relationship(
                    ObjRelationship::new("paintings", "Artist", "Painting", true, "paintings")
                        .with_reverse("artist"),
                ),
        );
        resolver.add_obj_entity(
            ObjEntity::new("Painting", "PAINTING")
                .with_attribute(ObjAttribute::new("title", "TITLE"))
                .with_relationship(
                    ObjRelationship::new("artist", "Painting", "Artist", false, "artist")
                        .with_reverse("paintings"),
                ),
        );
        Arc::new(resolver)
    }

    #[test]
    fn test_inserts_ordered_master_first() {
        let resolver = resolver();
        let store = ObjectStore::new(
            Arc::new(SnapshotCache::with_defaults()),
            Arc::clone(&resolver),
        );
        let node = MemoryNode::new("main", Arc::clone(&resolver));

        // Register the painting first to prove ordering is by dependency,
        // not registration.
        let painting = ObjectId::temporary("Painting");
        store.register_node(painting.clone(), Box::new(DataObject::new("Painting")));
        store.record_object_created(&painting).unwrap();
        let artist = ObjectId::temporary("Artist");
        store.register_node(artist.clone(), Box::new(DataObject::new("Artist")));
        store.record_object_created(&artist).unwrap();
        store
            .record_arc_created(&painting, artist.clone(), "artist")
            .unwrap();

        let sorter = EntitySorter::new();
        let buckets = build(&store, &resolver, &sorter, node.pk_generator()).unwrap();
        let tables: Vec<&str> = buckets.inserts.iter().map(|b| b.table.as_str()).collect();
        assert_eq!(tables, vec!["ARTIST", "PAINTING"]);

        // Both generated keys were allocated up front.
        assert!(artist.effective_value("ID").is_some());
        assert!(painting.effective_value("ID").is_some());
    }

    #[test]
    fn test_phantom_update_produces_no_batch() {
        let resolver = resolver();
        let store = ObjectStore::new(
            Arc::new(SnapshotCache::with_defaults()),
            Arc::clone(&resolver),
        );
        let node = MemoryNode::new("main", Arc::clone(&resolver));

        let id = ObjectId::with_single_key("Artist", "ID", Value::Int64(1));
        let mut object = DataObject::new("Artist");
        object.write_property("name", Value::from("a"));
        object.set_persistence_state(PersistenceState::Committed);
        store.register_node(id.clone(), Box::new(object));
        store
            .record_property_changed(&id, "name", Value::from("a"))
            .unwrap();

        let sorter = EntitySorter::new();
        let buckets = build(&store, &resolver, &sorter, node.pk_generator()).unwrap();
        assert!(buckets.updates.is_empty());
        assert_eq!(buckets.phantoms, vec![id]);
    }
}
