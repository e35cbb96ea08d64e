//! Delete-rule processing at deletion time, not at commit time.

use tracing::trace;

use crate::access::object_store::ObjectStore;
use crate::error::{Error, Result};
use crate::map::{DeleteRule, EntityResolver, ObjRelationship};
use crate::object::{ObjectId, PersistenceState};

/// Source of related objects for rule processing. Deletion must see the
/// object's current relationships, which may require a fetch for targets
/// not yet registered locally.
pub trait RelatedFinder {
    fn related(&self, id: &ObjectId, relationship: &ObjRelationship) -> Vec<ObjectId>;
}

/// Rule source that only consults arcs already registered in the store.
pub struct RegisteredArcs<'a>(pub &'a ObjectStore);

impl RelatedFinder for RegisteredArcs<'_> {
    fn related(&self, id: &ObjectId, relationship: &ObjRelationship) -> Vec<ObjectId> {
        self.0.arc_targets(id, &relationship.name)
    }
}

/// Delete one object, applying each relationship's delete rule.
///
/// Deny rules are checked across every relationship before any state
/// changes: a denied delete leaves the object graph exactly as it was.
/// Then the object transitions to deleted, nullify rules clear reverse
/// arcs, cascade rules recurse, and join-table arcs are removed regardless
/// of rule.
pub fn perform_delete(
    store: &ObjectStore,
    resolver: &EntityResolver,
    finder: &dyn RelatedFinder,
    id: &ObjectId,
) -> Result<()> {
    let Some(state) = store.object_state(id) else {
        return Err(Error::NotManaged(format!("{id} is not registered")));
    };
    if matches!(
        state,
        PersistenceState::Deleted | PersistenceState::Transient
    ) {
        // Already gone; cascades may reach an object twice.
        return Ok(());
    }
    let entity = resolver.obj_entity(id.entity_name())?;

    for relationship in &entity.relationships {
        if relationship.delete_rule != DeleteRule::Deny || relationship.is_flattened() {
            continue;
        }
        let related = finder.related(id, relationship);
        if !related.is_empty() {
            return Err(Error::DeleteDenied {
                relationship: relationship.name.clone(),
                related_count: related.len(),
            });
        }
    }

    store.record_object_deleted(id)?;
    trace!(id = %id, "object deleted, processing delete rules");

    for relationship in &entity.relationships {
        let related = finder.related(id, relationship);
        if relationship.is_flattened() {
            // Join rows vanish with the object no matter the rule.
            for target in related {
                store.record_arc_deleted(id, target, &relationship.name)?;
            }
            continue;
        }
        match relationship.delete_rule {
            DeleteRule::NoAction | DeleteRule::Deny => {}
            DeleteRule::Nullify => {
                let reverse = resolver
                    .reverse_obj_relationship(relationship)
                    .map(|r| r.name.clone());
                for target in related {
                    if let Some(reverse) = &reverse {
                        if store.object_state(&target).is_some() {
                            store.record_arc_deleted(&target, id.clone(), reverse)?;
                        }
                    }
                    store.record_arc_deleted(id, target, &relationship.name)?;
                }
            }
            DeleteRule::Cascade => {
                for target in related {
                    store.record_arc_deleted(id, target.clone(), &relationship.name)?;
                    perform_delete(store, resolver, finder, &target)?;
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::snapshot_cache::SnapshotCache;
    use crate::map::{DbAttribute, DbEntity, DbJoin, DbRelationship, ObjEntity};
    use crate::object::{DataObject, Persistent};
    use crate::value::Value;
    use std::sync::Arc;

    fn fixtures(rule: DeleteRule) -> (ObjectStore, Arc<EntityResolver>) {
        let mut resolver = EntityResolver::new();
        resolver.add_db_entity(
            DbEntity::new("ARTIST", vec![DbAttribute::pk("ID")]).with_relationship(
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
                vec![DbAttribute::pk("ID"), DbAttribute::new("ARTIST_ID")],
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
            ObjEntity::new("Artist", "ARTIST").with_relationship(
                ObjRelationship::new("paintings", "Artist", "Painting", true, "paintings")
                    .with_delete_rule(rule)
                    .with_reverse("artist"),
            ),
        );
        resolver.add_obj_entity(
            ObjEntity::new("Painting", "PAINTING").with_relationship(
                ObjRelationship::new("artist", "Painting", "Artist", false, "artist")
                    .with_delete_rule(DeleteRule::Nullify)
                    .with_reverse("paintings"),
            ),
        );
        let resolver = Arc::new(resolver);
        let store = ObjectStore::new(
            Arc::new(SnapshotCache::with_defaults()),
            Arc::clone(&resolver),
        );
        (store, resolver)
    }

    fn committed_pair(store: &ObjectStore) -> (ObjectId, ObjectId) {
        let artist = ObjectId::with_single_key("Artist", "ID", Value::Int64(1));
        let painting = ObjectId::with_single_key("Painting", "ID", Value::Int64(2));
        let mut a = DataObject::new("Artist");
        a.set_persistence_state(PersistenceState::Committed);
        a.add_arc_target("paintings", painting.clone());
        let mut p = DataObject::new("Painting");
        p.set_persistence_state(PersistenceState::Committed);
        p.add_arc_target("artist", artist.clone());
        store.register_node(artist.clone(), Box::new(a));
        store.register_node(painting.clone(), Box::new(p));
        (artist, painting)
    }

    #[test]
    fn test_deny_leaves_graph_untouched() {
        let (store, resolver) = fixtures(DeleteRule::Deny);
        let (artist, painting) = committed_pair(&store);

        let finder = RegisteredArcs(&store);
        let err = perform_delete(&store, &resolver, &finder, &artist).unwrap_err();
        assert!(matches!(
            err,
            Error::DeleteDenied { ref relationship, related_count: 1 } if relationship == "paintings"
        ));
        // No state change, no recorded diff.
        assert_eq!(
            store.object_state(&artist),
            Some(PersistenceState::Committed)
        );
        assert_eq!(
            store.object_state(&painting),
            Some(PersistenceState::Committed)
        );
        assert!(!store.has_changes());
    }

    #[test]
    fn test_nullify_clears_reverse_arc() {
        let (store, resolver) = fixtures(DeleteRule::Nullify);
        let (artist, painting) = committed_pair(&store);

        let finder = RegisteredArcs(&store);
        perform_delete(&store, &resolver, &finder, &artist).unwrap();
        assert_eq!(store.object_state(&artist), Some(PersistenceState::Deleted));
        // The painting lost its to-one arc and became modified.
        assert_eq!(
            store.object_state(&painting),
            Some(PersistenceState::Modified)
        );
        assert!(store.arc_targets(&painting, "artist").is_empty());
    }

    #[test]
    fn test_cascade_deletes_related() {
        let (store, resolver) = fixtures(DeleteRule::Cascade);
        let (artist, painting) = committed_pair(&store);

        let finder = RegisteredArcs(&store);
        perform_delete(&store, &resolver, &finder, &artist).unwrap();
        assert_eq!(store.object_state(&artist), Some(PersistenceState::Deleted));
        assert_eq!(
            store.object_state(&painting),
            Some(PersistenceState::Deleted)
        );
    }
}
