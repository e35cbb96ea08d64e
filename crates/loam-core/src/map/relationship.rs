//! Relationship metadata: database joins and object-level arcs.

use serde::{Deserialize, Serialize};

/// Behavior applied to related objects when the source object is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeleteRule {
    /// Do nothing to related objects.
    NoAction,
    /// Clear the inverse relationship on related objects.
    Nullify,
    /// Refuse the delete while related objects exist.
    Deny,
    /// Recursively delete related objects.
    Cascade,
}

/// A single column pairing within a database relationship.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbJoin {
    /// Column on the source table.
    pub source: String,
    /// Column on the target table.
    pub target: String,
}

impl DbJoin {
    /// Create a join between a source and target column.
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// A directed relationship between two database tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbRelationship {
    /// Relationship name, unique within the source entity.
    pub name: String,
    /// Source table name.
    pub source_entity: String,
    /// Target table name.
    pub target_entity: String,
    /// Whether the target side holds many rows per source row.
    pub to_many: bool,
    /// Whether the target's primary key is propagated from the source
    /// (master/detail mapping — the target depends on the source for its
    /// key, inverting the usual insert order).
    pub to_dependent_pk: bool,
    /// Column pairings.
    pub joins: Vec<DbJoin>,
    /// Name of the reverse relationship on the target entity, if mapped.
    pub reverse_name: Option<String>,
}

impl DbRelationship {
    /// Create a to-one relationship.
    pub fn to_one(
        name: impl Into<String>,
        source_entity: impl Into<String>,
        target_entity: impl Into<String>,
        joins: Vec<DbJoin>,
    ) -> Self {
        Self {
            name: name.into(),
            source_entity: source_entity.into(),
            target_entity: target_entity.into(),
            to_many: false,
            to_dependent_pk: false,
            joins,
            reverse_name: None,
        }
    }

    /// Create a to-many relationship.
    pub fn to_many(
        name: impl Into<String>,
        source_entity: impl Into<String>,
        target_entity: impl Into<String>,
        joins: Vec<DbJoin>,
    ) -> Self {
        Self {
            name: name.into(),
            source_entity: source_entity.into(),
            target_entity: target_entity.into(),
            to_many: true,
            to_dependent_pk: false,
            joins,
            reverse_name: None,
        }
    }

    /// Mark the target's primary key as propagated from the source.
    pub fn with_dependent_pk(mut self) -> Self {
        self.to_dependent_pk = true;
        self
    }

    /// Set the reverse relationship name.
    pub fn with_reverse(mut self, reverse: impl Into<String>) -> Self {
        self.reverse_name = Some(reverse.into());
        self
    }

    /// Source columns of all joins, in declaration order.
    pub fn source_columns(&self) -> impl Iterator<Item = &str> {
        self.joins.iter().map(|j| j.source.as_str())
    }
}

/// An object-level relationship ("arc") between two object entities.
///
/// A relationship whose database path spans more than one table relationship
/// is *flattened*: it is implemented through an intermediate join table not
/// exposed in the object model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjRelationship {
    /// Relationship name, unique within the source entity.
    pub name: String,
    /// Source object entity name.
    pub source_entity: String,
    /// Target object entity name.
    pub target_entity: String,
    /// Whether the relationship points at many objects.
    pub to_many: bool,
    /// Delete rule applied when the source object is deleted.
    pub delete_rule: DeleteRule,
    /// Names of the underlying database relationships, in path order.
    pub db_path: Vec<String>,
    /// Name of the reverse object relationship, if mapped.
    pub reverse_name: Option<String>,
}

impl ObjRelationship {
    /// Create an object relationship over a single database relationship.
    pub fn new(
        name: impl Into<String>,
        source_entity: impl Into<String>,
        target_entity: impl Into<String>,
        to_many: bool,
        db_relationship: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            source_entity: source_entity.into(),
            target_entity: target_entity.into(),
            to_many,
            delete_rule: DeleteRule::NoAction,
            db_path: vec![db_relationship.into()],
            reverse_name: None,
        }
    }

    /// Create a flattened relationship spanning a join table.
    pub fn flattened(
        name: impl Into<String>,
        source_entity: impl Into<String>,
        target_entity: impl Into<String>,
        db_path: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            source_entity: source_entity.into(),
            target_entity: target_entity.into(),
            to_many: true,
            delete_rule: DeleteRule::NoAction,
            db_path,
            reverse_name: None,
        }
    }

    /// Set the delete rule.
    pub fn with_delete_rule(mut self, rule: DeleteRule) -> Self {
        self.delete_rule = rule;
        self
    }

    /// Set the reverse relationship name.
    pub fn with_reverse(mut self, reverse: impl Into<String>) -> Self {
        self.reverse_name = Some(reverse.into());
        self
    }

    /// Whether this relationship spans an intermediate join table.
    pub fn is_flattened(&self) -> bool {
        self.db_path.len() > 1
    }

    /// Name of the first database relationship in the path.
    pub fn first_db_relationship(&self) -> &str {
        &self.db_path[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flattened_detection() {
        let plain = ObjRelationship::new("paintings", "Artist", "Painting", true, "paintings");
        assert!(!plain.is_flattened());

        let flat = ObjRelationship::flattened(
            "exhibits",
            "Artist",
            "Gallery",
            vec!["artist_exhibits".into(), "exhibit_gallery".into()],
        );
        assert!(flat.is_flattened());
        assert!(flat.to_many);
    }

    #[test]
    fn test_dependent_pk_builder() {
        let rel = DbRelationship::to_one(
            "detail",
            "ORDER",
            "ORDER_DETAIL",
            vec![DbJoin::new("ID", "ORDER_ID")],
        )
        .with_dependent_pk();
        assert!(rel.to_dependent_pk);
        assert_eq!(rel.source_columns().collect::<Vec<_>>(), vec!["ID"]);
    }
}
