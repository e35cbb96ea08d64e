//! Name-based lookup facade over the mapping metadata.

use std::collections::HashMap;
use std::sync::Arc;

use super::entity::{DbEntity, ObjEntity};
use super::relationship::{DbRelationship, ObjRelationship};
use crate::error::{Error, Result};

/// Read-only registry of entities and relationships.
///
/// The resolver is shared across sessions and must be stable for the
/// duration of one commit. Missing lookups are mapping errors: they indicate
/// a configuration defect, not a runtime condition.
#[derive(Debug, Default)]
pub struct EntityResolver {
    obj_entities: HashMap<String, Arc<ObjEntity>>,
    db_entities: HashMap<String, Arc<DbEntity>>,
}

impl EntityResolver {
    /// Create an empty resolver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an object entity.
    pub fn add_obj_entity(&mut self, entity: ObjEntity) {
        self.obj_entities.insert(entity.name.clone(), Arc::new(entity));
    }

    /// Register a table.
    pub fn add_db_entity(&mut self, entity: DbEntity) {
        self.db_entities.insert(entity.name.clone(), Arc::new(entity));
    }

    /// Look up an object entity by name.
    pub fn obj_entity(&self, name: &str) -> Result<&Arc<ObjEntity>> {
        self.obj_entities
            .get(name)
            .ok_or_else(|| Error::Mapping(format!("unknown entity '{name}'")))
    }

    /// Look up a table by name.
    pub fn db_entity(&self, name: &str) -> Result<&Arc<DbEntity>> {
        self.db_entities
            .get(name)
            .ok_or_else(|| Error::Mapping(format!("unknown table '{name}'")))
    }

    /// The table an object entity maps onto.
    pub fn db_entity_for(&self, obj_entity: &ObjEntity) -> Result<&Arc<DbEntity>> {
        self.db_entity(&obj_entity.db_entity)
    }

    /// All registered tables.
    pub fn db_entities(&self) -> impl Iterator<Item = &Arc<DbEntity>> {
        self.db_entities.values()
    }

    /// All registered object entities.
    pub fn obj_entities(&self) -> impl Iterator<Item = &Arc<ObjEntity>> {
        self.obj_entities.values()
    }

    /// Resolve a database relationship by entity and name.
    pub fn db_relationship(&self, entity: &str, name: &str) -> Result<&DbRelationship> {
        let db = self.db_entity(entity)?;
        db.relationship(name)
            .ok_or_else(|| Error::Mapping(format!("unknown relationship '{entity}.{name}'")))
    }

    /// Resolve the reverse of a database relationship, if mapped.
    pub fn reverse_db_relationship(
        &self,
        relationship: &DbRelationship,
    ) -> Option<&DbRelationship> {
        let reverse_name = relationship.reverse_name.as_deref()?;
        self.db_entities
            .get(&relationship.target_entity)
            .and_then(|e| e.relationship(reverse_name))
    }

    /// Resolve the reverse of an object relationship, if mapped.
    pub fn reverse_obj_relationship(
        &self,
        relationship: &ObjRelationship,
    ) -> Option<&ObjRelationship> {
        let reverse_name = relationship.reverse_name.as_deref()?;
        self.obj_entities
            .get(&relationship.target_entity)
            .and_then(|e| e.relationship(reverse_name))
    }

    /// Direct subtypes of an entity within an inheritance tree.
    pub fn subtypes(&self, entity: &str) -> Vec<&Arc<ObjEntity>> {
        self.obj_entities
            .values()
            .filter(|e| e.super_entity.as_deref() == Some(entity))
            .collect()
    }

    /// Whether an entity has mapped subtypes. Identity-only resolution of a
    /// related object is unsafe when it does: the row must be fetched to
    /// discriminate the concrete subtype.
    pub fn has_subtypes(&self, entity: &str) -> bool {
        self.obj_entities
            .values()
            .any(|e| e.super_entity.as_deref() == Some(entity))
    }

    /// Find the most specific entity matching a row in an inheritance tree
    /// rooted at `entity`. Falls back to the root when no subtype qualifier
    /// matches.
    pub fn resolve_subtype<'a>(
        &'a self,
        entity: &'a Arc<ObjEntity>,
        get: &impl Fn(&str) -> Option<crate::value::Value>,
    ) -> &'a Arc<ObjEntity> {
        for sub in self.subtypes(&entity.name) {
            if sub.matches_qualifier(get) {
                // Recurse for deeper trees.
                return self.resolve_subtype_inner(sub, get);
            }
        }
        entity
    }

    fn resolve_subtype_inner<'a>(
        &'a self,
        entity: &'a Arc<ObjEntity>,
        get: &impl Fn(&str) -> Option<crate::value::Value>,
    ) -> &'a Arc<ObjEntity> {
        for sub in self.subtypes(&entity.name) {
            if sub.matches_qualifier(get) {
                return self.resolve_subtype_inner(sub, get);
            }
        }
        entity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::{DbAttribute, ObjAttribute};
    use crate::value::Value;

    fn resolver_with_inheritance() -> EntityResolver {
        let mut resolver = EntityResolver::new();
        resolver.add_db_entity(DbEntity::new(
            "EMPLOYEE",
            vec![DbAttribute::pk("ID"), DbAttribute::new("TYPE")],
        ));
        resolver.add_obj_entity(
            ObjEntity::new("Employee", "EMPLOYEE")
                .with_attribute(ObjAttribute::new("kind", "TYPE")),
        );
        resolver.add_obj_entity(ObjEntity::new("Manager", "EMPLOYEE").with_super_entity(
            "Employee",
            "TYPE",
            Value::from("M"),
        ));
        resolver
    }

    #[test]
    fn test_missing_entity_is_mapping_error() {
        let resolver = EntityResolver::new();
        let err = resolver.obj_entity("Nope").unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_subtype_resolution() {
        let resolver = resolver_with_inheritance();
        let root = resolver.obj_entity("Employee").unwrap();

        let get_m = |c: &str| (c == "TYPE").then(|| Value::from("M"));
        assert_eq!(resolver.resolve_subtype(root, &get_m).name, "Manager");

        let get_e = |c: &str| (c == "TYPE").then(|| Value::from("E"));
        assert_eq!(resolver.resolve_subtype(root, &get_e).name, "Employee");

        assert!(resolver.has_subtypes("Employee"));
        assert!(!resolver.has_subtypes("Manager"));
    }
}
