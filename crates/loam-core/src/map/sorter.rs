//! Foreign-key dependency ordering for commit batches.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tracing::warn;

use super::entity::DbEntity;
use super::resolver::EntityResolver;
use crate::object::ObjectId;

/// Sorts tables (and rows of reflexive tables) so that write operations can
/// run with foreign-key constraints enabled.
///
/// Insert order is parent before child; delete order is the exact reverse.
/// Dependency edges come from to-one relationships: a table referencing
/// another through a foreign key depends on it, and a master table with a
/// dependent-PK detail is depended on by the detail.
#[derive(Debug, Default)]
pub struct EntitySorter;

impl EntitySorter {
    /// Create a sorter.
    pub fn new() -> Self {
        Self
    }

    /// Topologically sort tables by foreign-key dependency.
    ///
    /// With `delete_order` the result is reversed (child before parent).
    /// Cycles other than self-references cannot be ordered; the cyclic
    /// remainder keeps its input order and a warning is logged.
    pub fn sort_db_entities(
        &self,
        resolver: &EntityResolver,
        entities: &mut Vec<Arc<DbEntity>>,
        delete_order: bool,
    ) {
        let names: HashSet<&str> = entities.iter().map(|e| e.name.as_str()).collect();

        // dependencies[t] = set of tables that must be written before t.
        let mut dependencies: HashMap<&str, HashSet<&str>> = HashMap::new();
        for entity in entities.iter() {
            dependencies.entry(&entity.name).or_default();
            for rel in &entity.relationships {
                if rel.target_entity == entity.name || !names.contains(rel.target_entity.as_str())
                {
                    continue;
                }
                if rel.to_dependent_pk {
                    // Detail table's key is propagated from this master.
                    dependencies
                        .entry(rel.target_entity.as_str())
                        .or_default()
                        .insert(&entity.name);
                } else if !rel.to_many {
                    dependencies
                        .entry(&entity.name)
                        .or_default()
                        .insert(rel.target_entity.as_str());
                }
            }
        }
        // Reverse relationships may only be mapped on one side; pick up
        // to-many edges from tables outside the working set as well.
        for entity in resolver.db_entities() {
            for rel in &entity.relationships {
                if rel.to_many
                    && !rel.to_dependent_pk
                    && names.contains(rel.target_entity.as_str())
                    && names.contains(entity.name.as_str())
                    && rel.target_entity != entity.name
                {
                    dependencies
                        .entry(rel.target_entity.as_str())
                        .or_default()
                        .insert(entity.name.as_str());
                }
            }
        }

        // Kahn's algorithm with stable tie-breaking on input order.
        let mut sorted_names: Vec<String> = Vec::with_capacity(entities.len());
        let mut placed: HashSet<String> = HashSet::new();
        let mut remaining: VecDeque<&str> = entities.iter().map(|e| e.name.as_str()).collect();
        loop {
            let before = sorted_names.len();
            let mut deferred: VecDeque<&str> = VecDeque::new();
            while let Some(name) = remaining.pop_front() {
                let deps = dependencies.get(name).expect("all tables seeded");
                if deps.iter().all(|d| placed.contains(*d)) {
                    sorted_names.push(name.to_string());
                    placed.insert(name.to_string());
                } else {
                    deferred.push_back(name);
                }
            }
            remaining = deferred;
            if remaining.is_empty() || sorted_names.len() == before {
                break;
            }
        }
        if sorted_names.len() < entities.len() {
            warn!(
                ordered = sorted_names.len(),
                total = entities.len(),
                "foreign key cycle detected; keeping input order for cyclic tables"
            );
            for entity in entities.iter() {
                if !sorted_names.iter().any(|n| n == &entity.name) {
                    sorted_names.push(entity.name.clone());
                }
            }
        }

        let index: HashMap<&str, usize> = sorted_names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect();
        entities.sort_by_key(|e| index[e.name.as_str()]);
        if delete_order {
            entities.reverse();
        }
    }

    /// Order rows of one reflexive table so that referenced parents come
    /// first. `items` pairs each id with its in-batch parent, if any.
    pub fn sort_objects(
        &self,
        items: Vec<(ObjectId, Option<ObjectId>)>,
        delete_order: bool,
    ) -> Vec<ObjectId> {
        let ids: HashSet<&ObjectId> = items.iter().map(|(id, _)| id).collect();
        let mut children: HashMap<&ObjectId, Vec<&ObjectId>> = HashMap::new();
        let mut pending: HashMap<&ObjectId, usize> = HashMap::new();
        for (id, parent) in &items {
            let blocked = matches!(parent, Some(p) if ids.contains(p) && p != id);
            pending.insert(id, usize::from(blocked));
            if let Some(p) = parent {
                if ids.contains(p) && p != id {
                    children.entry(p).or_default().push(id);
                }
            }
        }

        let mut queue: VecDeque<&ObjectId> = items
            .iter()
            .map(|(id, _)| id)
            .filter(|id| pending[id] == 0)
            .collect();
        let mut sorted: Vec<ObjectId> = Vec::with_capacity(items.len());
        while let Some(id) = queue.pop_front() {
            sorted.push(id.clone());
            for child in children.get(id).into_iter().flatten() {
                let count = pending.get_mut(child).expect("child seeded");
                *count -= 1;
                if *count == 0 {
                    queue.push_back(child);
                }
            }
        }
        // A cycle among rows cannot happen with a single to-one parent arc,
        // but stay total anyway.
        if sorted.len() < items.len() {
            for (id, _) in &items {
                if !sorted.contains(id) {
                    sorted.push(id.clone());
                }
            }
        }
        if delete_order {
            sorted.reverse();
        }
        sorted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::{DbAttribute, DbJoin, DbRelationship};

    fn artist_painting_resolver() -> EntityResolver {
        let mut resolver = EntityResolver::new();
        resolver.add_db_entity(
            DbEntity::new("ARTIST", vec![DbAttribute::generated_pk("ID")]).with_relationship(
                DbRelationship::to_many(
                    "paintings",
                    "ARTIST",
                    "PAINTING",
                    vec![DbJoin::new("ID", "ARTIST_ID")],
                ),
            ),
        );
        resolver.add_db_entity(
            DbEntity::new(
                "PAINTING",
                vec![DbAttribute::generated_pk("ID"), DbAttribute::new("ARTIST_ID")],
            )
            .with_relationship(DbRelationship::to_one(
                "artist",
                "PAINTING",
                "ARTIST",
                vec![DbJoin::new("ARTIST_ID", "ID")],
            )),
        );
        resolver
    }

    #[test]
    fn test_insert_order_parent_first() {
        let resolver = artist_painting_resolver();
        let mut tables = vec![
            resolver.db_entity("PAINTING").unwrap().clone(),
            resolver.db_entity("ARTIST").unwrap().clone(),
        ];
        EntitySorter::new().sort_db_entities(&resolver, &mut tables, false);
        assert_eq!(tables[0].name, "ARTIST");
        assert_eq!(tables[1].name, "PAINTING");
    }

    #[test]
    fn test_delete_order_child_first() {
        let resolver = artist_painting_resolver();
        let mut tables = vec![
            resolver.db_entity("ARTIST").unwrap().clone(),
            resolver.db_entity("PAINTING").unwrap().clone(),
        ];
        EntitySorter::new().sort_db_entities(&resolver, &mut tables, true);
        assert_eq!(tables[0].name, "PAINTING");
        assert_eq!(tables[1].name, "ARTIST");
    }

    #[test]
    fn test_reflexive_object_order() {
        let parent = ObjectId::temporary("Category");
        let child = ObjectId::temporary("Category");
        let grandchild = ObjectId::temporary("Category");
        let items = vec![
            (grandchild.clone(), Some(child.clone())),
            (child.clone(), Some(parent.clone())),
            (parent.clone(), None),
        ];
        let sorted = EntitySorter::new().sort_objects(items.clone(), false);
        assert_eq!(sorted, vec![parent.clone(), child.clone(), grandchild.clone()]);

        let reversed = EntitySorter::new().sort_objects(items, true);
        assert_eq!(reversed, vec![grandchild, child, parent]);
    }
}
