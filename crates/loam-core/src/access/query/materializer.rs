//! Turning fetched rows into registered, stateful objects.

use std::collections::BTreeMap;

use tracing::trace;

use crate::access::object_store::ObjectStore;
use crate::access::snapshot::DataRow;
use crate::error::{Error, Result};
use crate::map::EntityResolver;
use crate::object::{DataObject, ObjectId, PersistenceState, Persistent};
use crate::value::Value;

/// Materializes raw rows into objects registered with one store.
///
/// Existing objects with in-flight local state are left alone: only Hollow
/// objects are populated, unless the query demands a refresh, in which case
/// clean Committed objects absorb the fetched values too. Modified and
/// Deleted objects never lose local edits to a fetch.
pub struct ObjectMaterializer<'a> {
    store: &'a ObjectStore,
    resolver: &'a EntityResolver,
}

impl<'a> ObjectMaterializer<'a> {
    pub fn new(store: &'a ObjectStore, resolver: &'a EntityResolver) -> Self {
        Self { store, resolver }
    }

    /// Materialize a list of rows fetched for `entity_name`, returning ids
    /// in row order.
    pub fn materialize(
        &self,
        entity_name: &str,
        rows: &[DataRow],
        refresh: bool,
    ) -> Result<Vec<ObjectId>> {
        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            ids.push(self.materialize_row(entity_name, row, refresh)?);
        }
        Ok(ids)
    }

    /// Materialize one row.
    pub fn materialize_row(
        &self,
        entity_name: &str,
        row: &DataRow,
        refresh: bool,
    ) -> Result<ObjectId> {
        let base = self.resolver.obj_entity(entity_name)?;
        // Rows of an inheritance tree all arrive under the root entity; the
        // discriminating qualifier picks the concrete subtype.
        let entity = self
            .resolver
            .resolve_subtype(base, &|column| row.get(column).cloned());
        let db = self.resolver.db_entity_for(entity)?;

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
        let id = ObjectId::new(entity.name.clone(), key);

        // Joint-prefetch rows carry prefixed child columns; only base
        // columns belong in the snapshot.
        let base_row = DataRow::new(
            row.values()
                .iter()
                .filter(|(column, _)| !column.contains('.'))
                .map(|(column, value)| (column.clone(), value.clone()))
                .collect(),
        );
        let partial = entity
            .attributes
            .iter()
            .any(|a| !base_row.contains_column(&a.db_attribute));

        let populate = match self.store.object_state(&id) {
            None => {
                let object = DataObject::new(entity.name.clone());
                self.store.register_node(id.clone(), Box::new(object));
                true
            }
            Some(PersistenceState::Hollow) => true,
            Some(PersistenceState::Committed) => refresh,
            Some(_) => false,
        };
        if !populate {
            return Ok(id);
        }

        self.store.snapshot_cache().put_snapshot(id.clone(), base_row.clone());
        let version = self
            .store
            .snapshot_cache()
            .get_cached_snapshot(&id)
            .map(|r| r.version())
            .unwrap_or_else(|| base_row.version());

        let state = if partial {
            PersistenceState::Hollow
        } else {
            PersistenceState::Committed
        };
        self.store.with_object(&id, |object| {
            for attribute in &entity.attributes {
                if let Some(value) = base_row.get(&attribute.db_attribute) {
                    object.write_property(&attribute.name, value.clone());
                }
            }
            object.set_snapshot_version(version);
            object.set_persistence_state(state);
        });
        trace!(id = %id, ?state, "materialized row");
        Ok(id)
    }

    /// Register ids resolved without a fetch as Hollow placeholders. Already
    /// registered ids are left untouched.
    pub fn materialize_hollow(&self, ids: &[ObjectId]) -> Result<()> {
        for id in ids {
            if self.store.object_state(id).is_some() {
                continue;
            }
            // Identity-only resolution is only safe without subtypes; the
            // interceptor that produced these ids already checked.
            self.resolver.obj_entity(id.entity_name())?;
            let mut object = DataObject::new(id.entity_name().to_string());
            object.set_persistence_state(PersistenceState::Hollow);
            self.store.register_node(id.clone(), Box::new(object));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::snapshot_cache::SnapshotCache;
    use crate::map::{DbAttribute, DbEntity, ObjAttribute, ObjEntity};
    use std::sync::Arc;

    fn fixtures() -> (ObjectStore, Arc<EntityResolver>) {
        let mut resolver = EntityResolver::new();
        resolver.add_db_entity(DbEntity::new(
            "ARTIST",
            vec![DbAttribute::pk("ID"), DbAttribute::new("NAME")],
        ));
        resolver.add_obj_entity(
            ObjEntity::new("Artist", "ARTIST").with_attribute(ObjAttribute::new("name", "NAME")),
        );
        let resolver = Arc::new(resolver);
        let store = ObjectStore::new(
            Arc::new(SnapshotCache::with_defaults()),
            Arc::clone(&resolver),
        );
        (store, resolver)
    }

    fn row(id: i64, name: &str) -> DataRow {
        DataRow::from_pairs([
            ("ID".to_string(), Value::Int64(id)),
            ("NAME".to_string(), Value::from(name)),
        ])
    }

    #[test]
    fn test_full_row_becomes_committed() {
        let (store, resolver) = fixtures();
        let materializer = ObjectMaterializer::new(&store, &resolver);
        let ids = materializer
            .materialize("Artist", &[row(1, "Dali")], false)
            .unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(
            store.object_state(&ids[0]),
            Some(PersistenceState::Committed)
        );
        assert_eq!(
            store.read_property(&ids[0], "name"),
            Some(Value::from("Dali"))
        );
        assert!(store
            .snapshot_cache()
            .get_cached_snapshot(&ids[0])
            .is_some());
    }

    #[test]
    fn test_partial_row_stays_hollow() {
        let (store, resolver) = fixtures();
        let materializer = ObjectMaterializer::new(&store, &resolver);
        let partial = DataRow::from_pairs([("ID".to_string(), Value::Int64(1))]);
        let ids = materializer
            .materialize("Artist", &[partial], false)
            .unwrap();
        assert_eq!(store.object_state(&ids[0]), Some(PersistenceState::Hollow));
    }

    #[test]
    fn test_modified_object_keeps_local_edits() {
        let (store, resolver) = fixtures();
        let materializer = ObjectMaterializer::new(&store, &resolver);
        let ids = materializer
            .materialize("Artist", &[row(1, "Dali")], false)
            .unwrap();
        store
            .record_property_changed(&ids[0], "name", Value::from("local"))
            .unwrap();

        materializer
            .materialize("Artist", &[row(1, "fetched")], true)
            .unwrap();
        assert_eq!(
            store.read_property(&ids[0], "name"),
            Some(Value::from("local"))
        );
    }

    #[test]
    fn test_refresh_overwrites_committed() {
        let (store, resolver) = fixtures();
        let materializer = ObjectMaterializer::new(&store, &resolver);
        let ids = materializer
            .materialize("Artist", &[row(1, "Dali")], false)
            .unwrap();
        materializer
            .materialize("Artist", &[row(1, "fetched")], true)
            .unwrap();
        assert_eq!(
            store.read_property(&ids[0], "name"),
            Some(Value::from("fetched"))
        );
    }
}
