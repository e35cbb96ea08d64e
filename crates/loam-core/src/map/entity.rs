//! Entity metadata: tables, columns, and their object-level projections.

use serde::{Deserialize, Serialize};

use super::relationship::{DbRelationship, ObjRelationship};
use crate::value::Value;

/// A physical table column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbAttribute {
    /// Column name.
    pub name: String,
    /// Whether this column is part of the primary key.
    pub primary_key: bool,
    /// Whether the column is NOT NULL.
    pub mandatory: bool,
    /// Whether the database generates this column's value on insert.
    pub generated: bool,
}

impl DbAttribute {
    /// Create a plain column.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: false,
            mandatory: false,
            generated: false,
        }
    }

    /// Create a primary key column.
    pub fn pk(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: true,
            mandatory: true,
            generated: false,
        }
    }

    /// Create a database-generated primary key column.
    pub fn generated_pk(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: true,
            mandatory: true,
            generated: true,
        }
    }

    /// Mark the column NOT NULL.
    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }
}

/// A physical table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbEntity {
    /// Table name.
    pub name: String,
    /// Columns in declaration order.
    pub attributes: Vec<DbAttribute>,
    /// Outgoing relationships.
    pub relationships: Vec<DbRelationship>,
}

impl DbEntity {
    /// Create a table with the given columns.
    pub fn new(name: impl Into<String>, attributes: Vec<DbAttribute>) -> Self {
        Self {
            name: name.into(),
            attributes,
            relationships: Vec::new(),
        }
    }

    /// Add an outgoing relationship.
    pub fn with_relationship(mut self, relationship: DbRelationship) -> Self {
        self.relationships.push(relationship);
        self
    }

    /// Look up a column by name.
    pub fn attribute(&self, name: &str) -> Option<&DbAttribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Look up a relationship by name.
    pub fn relationship(&self, name: &str) -> Option<&DbRelationship> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// Primary key column names, in declaration order.
    pub fn primary_key_names(&self) -> Vec<&str> {
        self.attributes
            .iter()
            .filter(|a| a.primary_key)
            .map(|a| a.name.as_str())
            .collect()
    }

    /// Database-generated primary key columns.
    pub fn generated_pk_attributes(&self) -> Vec<&DbAttribute> {
        self.attributes
            .iter()
            .filter(|a| a.primary_key && a.generated)
            .collect()
    }
}

/// An object-level property mapped onto one column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjAttribute {
    /// Property name on the object.
    pub name: String,
    /// Column the property maps to.
    pub db_attribute: String,
    /// Whether this attribute participates in optimistic locking: its
    /// last-known value is appended to update qualifiers.
    pub lock: bool,
}

impl ObjAttribute {
    /// Map a property onto a column.
    pub fn new(name: impl Into<String>, db_attribute: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            db_attribute: db_attribute.into(),
            lock: false,
        }
    }

    /// Mark the attribute as an optimistic lock column.
    pub fn with_lock(mut self) -> Self {
        self.lock = true;
        self
    }
}

/// An object entity: the object-level projection of one table, optionally
/// part of an inheritance tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjEntity {
    /// Entity name.
    pub name: String,
    /// The table this entity maps onto.
    pub db_entity: String,
    /// Mapped properties.
    pub attributes: Vec<ObjAttribute>,
    /// Object-level relationships.
    pub relationships: Vec<ObjRelationship>,
    /// Super-entity in an inheritance tree, if any.
    pub super_entity: Option<String>,
    /// Discriminating column/value pair selecting rows of this subtype
    /// within a shared table. Entities without one match any row.
    pub subtype_qualifier: Option<(String, Value)>,
}

impl ObjEntity {
    /// Create an entity mapped onto a table.
    pub fn new(name: impl Into<String>, db_entity: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            db_entity: db_entity.into(),
            attributes: Vec::new(),
            relationships: Vec::new(),
            super_entity: None,
            subtype_qualifier: None,
        }
    }

    /// Add a mapped property.
    pub fn with_attribute(mut self, attribute: ObjAttribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Add a relationship.
    pub fn with_relationship(mut self, relationship: ObjRelationship) -> Self {
        self.relationships.push(relationship);
        self
    }

    /// Declare this entity a subtype of another, discriminated by a column
    /// value.
    pub fn with_super_entity(
        mut self,
        super_entity: impl Into<String>,
        qualifier_column: impl Into<String>,
        qualifier_value: Value,
    ) -> Self {
        self.super_entity = Some(super_entity.into());
        self.subtype_qualifier = Some((qualifier_column.into(), qualifier_value));
        self
    }

    /// Look up a property by name.
    pub fn attribute(&self, name: &str) -> Option<&ObjAttribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Look up a relationship by name.
    pub fn relationship(&self, name: &str) -> Option<&ObjRelationship> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// Properties flagged for optimistic locking.
    pub fn lock_attributes(&self) -> impl Iterator<Item = &ObjAttribute> {
        self.attributes.iter().filter(|a| a.lock)
    }

    /// Whether a row with the given column value matches this entity's
    /// subtype qualifier.
    pub fn matches_qualifier(&self, get: impl Fn(&str) -> Option<Value>) -> bool {
        match &self.subtype_qualifier {
            None => true,
            Some((column, expected)) => get(column).as_ref() == Some(expected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_key_names() {
        let entity = DbEntity::new(
            "PAINTING",
            vec![
                DbAttribute::generated_pk("ID"),
                DbAttribute::new("TITLE"),
                DbAttribute::new("ARTIST_ID"),
            ],
        );
        assert_eq!(entity.primary_key_names(), vec!["ID"]);
        assert_eq!(entity.generated_pk_attributes().len(), 1);
    }

    #[test]
    fn test_subtype_qualifier_match() {
        let entity = ObjEntity::new("Manager", "EMPLOYEE").with_super_entity(
            "Employee",
            "TYPE",
            Value::from("M"),
        );
        assert!(entity.matches_qualifier(|c| {
            assert_eq!(c, "TYPE");
            Some(Value::from("M"))
        }));
        assert!(!entity.matches_qualifier(|_| Some(Value::from("E"))));
        assert!(!entity.matches_qualifier(|_| None));
    }
}
