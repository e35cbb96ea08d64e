//! Join-table rows backing flattened relationships.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

use crate::access::batch::BatchValue;
use crate::error::{Error, Result};
use crate::map::{DbRelationship, EntityResolver, ObjRelationship};
use crate::object::ObjectId;

/// Identity of one join-table row touched during a commit.
///
/// Both ends of a bidirectional flattened relationship record the same arc
/// change, so the key compares direction-insensitively when a reverse
/// relationship is mapped; the duplicate collapses to one INSERT or DELETE.
#[derive(Debug, Clone)]
pub struct FlattenedArcKey {
    join_table: String,
    source: ObjectId,
    target: ObjectId,
    bidirectional: bool,
}

impl FlattenedArcKey {
    pub fn new(
        resolver: &EntityResolver,
        relationship: &ObjRelationship,
        source: ObjectId,
        target: ObjectId,
    ) -> Result<Self> {
        let first = resolver.db_relationship(
            &resolver
                .obj_entity(&relationship.source_entity)?
                .db_entity
                .clone(),
            relationship.first_db_relationship(),
        )?;
        Ok(Self {
            join_table: first.target_entity.clone(),
            source,
            target,
            bidirectional: relationship.reverse_name.is_some(),
        })
    }

    /// Target table of the generated batch row.
    pub fn join_table(&self) -> &str {
        &self.join_table
    }

    /// Column values of the join row, keyed from both endpoint ids. Values
    /// whose keys are still pending generation become lazy placeholders.
    pub fn join_snapshot(
        &self,
        resolver: &EntityResolver,
        relationship: &ObjRelationship,
    ) -> Result<BTreeMap<String, BatchValue>> {
        if relationship.db_path.len() != 2 {
            return Err(Error::Mapping(format!(
                "flattened relationship '{}' must cross exactly one join table",
                relationship.name
            )));
        }
        let source_db = resolver
            .obj_entity(&relationship.source_entity)?
            .db_entity
            .clone();
        let first = resolver.db_relationship(&source_db, &relationship.db_path[0])?;
        let second = resolver.db_relationship(&self.join_table, &relationship.db_path[1])?;

        let mut values = BTreeMap::new();
        // source entity -> join table: the join's target column lives on the
        // join table and takes the source id's key.
        push_joins(&mut values, first, &self.source, true);
        // join table -> target entity: the join's source column lives on the
        // join table and takes the target id's key.
        push_joins(&mut values, second, &self.target, false);
        Ok(values)
    }
}

fn push_joins(
    values: &mut BTreeMap<String, BatchValue>,
    relationship: &DbRelationship,
    id: &ObjectId,
    forward: bool,
) {
    for join in &relationship.joins {
        let (column, key_column) = if forward {
            (&join.target, &join.source)
        } else {
            (&join.source, &join.target)
        };
        let value = match id.effective_value(key_column) {
            Some(value) => BatchValue::Literal(value),
            None => BatchValue::Propagated {
                master: id.clone(),
                column: key_column.clone(),
            },
        };
        values.insert(column.clone(), value);
    }
}

impl PartialEq for FlattenedArcKey {
    fn eq(&self, other: &Self) -> bool {
        if self.join_table != other.join_table {
            return false;
        }
        if self.source == other.source && self.target == other.target {
            return true;
        }
        (self.bidirectional || other.bidirectional)
            && self.source == other.target
            && self.target == other.source
    }
}

impl Eq for FlattenedArcKey {}

impl Hash for FlattenedArcKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.join_table.hash(state);
        // Order-insensitive endpoint combination so that reversed duplicates
        // land in the same bucket.
        let mut a = std::collections::hash_map::DefaultHasher::new();
        self.source.hash(&mut a);
        let mut b = std::collections::hash_map::DefaultHasher::new();
        self.target.hash(&mut b);
        state.write_u64(a.finish().wrapping_add(b.finish()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::{DbAttribute, DbEntity, DbJoin, ObjEntity};
    use crate::value::Value;
    use std::collections::HashSet;

    fn resolver() -> EntityResolver {
        let mut resolver = EntityResolver::new();
        resolver.add_db_entity(
            DbEntity::new("ARTIST", vec![DbAttribute::pk("ID")]).with_relationship(
                DbRelationship::to_many(
                    "exhibits",
                    "ARTIST",
                    "ARTIST_EXHIBIT",
                    vec![DbJoin::new("ID", "ARTIST_ID")],
                ),
            ),
        );
        resolver.add_db_entity(
            DbEntity::new(
                "ARTIST_EXHIBIT",
                vec![DbAttribute::pk("ARTIST_ID"), DbAttribute::pk("EXHIBIT_ID")],
            )
            .with_relationship(DbRelationship::to_one(
                "exhibit",
                "ARTIST_EXHIBIT",
                "EXHIBIT",
                vec![DbJoin::new("EXHIBIT_ID", "ID")],
            )),
        );
        resolver.add_db_entity(DbEntity::new("EXHIBIT", vec![DbAttribute::pk("ID")]));
        resolver.add_obj_entity(ObjEntity::new("Artist", "ARTIST"));
        resolver.add_obj_entity(ObjEntity::new("Exhibit", "EXHIBIT"));
        resolver
    }

    fn flattened_rel() -> ObjRelationship {
        ObjRelationship::flattened(
            "exhibits",
            "Artist",
            "Exhibit",
            vec!["exhibits".to_string(), "exhibit".to_string()],
        )
        .with_reverse("artists")
    }

    #[test]
    fn test_bidirectional_keys_collapse() {
        let resolver = resolver();
        let rel = flattened_rel();
        let artist = ObjectId::with_single_key("Artist", "ID", Value::Int64(1));
        let exhibit = ObjectId::with_single_key("Exhibit", "ID", Value::Int64(2));

        let forward =
            FlattenedArcKey::new(&resolver, &rel, artist.clone(), exhibit.clone()).unwrap();
        let reversed = FlattenedArcKey {
            join_table: forward.join_table.clone(),
            source: exhibit,
            target: artist,
            bidirectional: true,
        };

        assert_eq!(forward, reversed);
        let mut set = HashSet::new();
        set.insert(forward);
        assert!(set.contains(&reversed));
    }

    #[test]
    fn test_join_snapshot_columns() {
        let resolver = resolver();
        let rel = flattened_rel();
        let artist = ObjectId::with_single_key("Artist", "ID", Value::Int64(1));
        let exhibit = ObjectId::with_single_key("Exhibit", "ID", Value::Int64(2));

        let key = FlattenedArcKey::new(&resolver, &rel, artist, exhibit).unwrap();
        assert_eq!(key.join_table(), "ARTIST_EXHIBIT");
        let snapshot = key.join_snapshot(&resolver, &rel).unwrap();
        assert_eq!(
            snapshot.get("ARTIST_ID"),
            Some(&BatchValue::Literal(Value::Int64(1)))
        );
        assert_eq!(
            snapshot.get("EXHIBIT_ID"),
            Some(&BatchValue::Literal(Value::Int64(2)))
        );
    }
}
