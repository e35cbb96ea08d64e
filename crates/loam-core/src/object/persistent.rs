//! Live persistent objects.

use std::collections::HashMap;

use super::id::ObjectId;
use super::state::PersistenceState;
use crate::value::Value;

/// Lightweight handle identifying the session that owns an object.
///
/// Objects hold this instead of a strong back-pointer to their context, so
/// the ownership graph stays acyclic: the object store owns objects in an
/// identity-keyed table, and the handle is only used to discriminate
/// self-originated change events and to reject cross-session operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u64);

/// Capability contract the persistence core requires of a domain object.
///
/// The object model's inheritance mechanism is external to this crate; the
/// core only needs by-name property access and persistence-state reporting.
pub trait Persistent: Send {
    /// Entity name this object is an instance of.
    fn entity_name(&self) -> &str;

    /// The object's identity, if registered.
    fn object_id(&self) -> Option<&ObjectId>;

    /// Assign or clear the object's identity.
    fn set_object_id(&mut self, id: Option<ObjectId>);

    /// Current persistence state.
    fn persistence_state(&self) -> PersistenceState;

    /// Set persistence state. Only the object store and the commit pipeline
    /// may call this.
    fn set_persistence_state(&mut self, state: PersistenceState);

    /// Read a property by name.
    fn read_property(&self, name: &str) -> Option<Value>;

    /// Write a property by name.
    fn write_property(&mut self, name: &str, value: Value);

    /// Target ids of a relationship arc (zero or one for to-one arcs).
    fn arc_targets(&self, arc: &str) -> Vec<ObjectId>;

    /// Add a target to a relationship arc.
    fn add_arc_target(&mut self, arc: &str, target: ObjectId);

    /// Remove a target from a relationship arc.
    fn remove_arc_target(&mut self, arc: &str, target: &ObjectId);

    /// Rewrite every arc target equal to `old` to `new`. Called after a
    /// commit promotes a temporary id, so arcs keep pointing at the
    /// re-keyed object.
    fn replace_arc_target(&mut self, old: &ObjectId, new: &ObjectId);

    /// Version of the cached snapshot this object was last merged with.
    fn snapshot_version(&self) -> u64;

    /// Record the snapshot version after a merge or commit.
    fn set_snapshot_version(&mut self, version: u64);

    /// Session owning this object.
    fn session(&self) -> Option<SessionHandle>;

    /// Attach to or detach from a session.
    fn set_session(&mut self, session: Option<SessionHandle>);

    /// Drop loaded data, keeping identity. Used when hollowing an object.
    fn clear_data(&mut self);
}

/// Map-backed implementation of [`Persistent`].
///
/// Properties live in a name-to-value map; relationship arcs in a separate
/// name-to-target-ids map. Applications with generated domain classes can
/// supply their own `Persistent` implementations instead.
#[derive(Debug)]
pub struct DataObject {
    entity: String,
    id: Option<ObjectId>,
    state: PersistenceState,
    values: HashMap<String, Value>,
    arcs: HashMap<String, Vec<ObjectId>>,
    snapshot_version: u64,
    session: Option<SessionHandle>,
}

impl DataObject {
    /// Create a transient object of the given entity.
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            id: None,
            state: PersistenceState::Transient,
            values: HashMap::new(),
            arcs: HashMap::new(),
            snapshot_version: 0,
            session: None,
        }
    }

    /// All property values currently set.
    pub fn values(&self) -> &HashMap<String, Value> {
        &self.values
    }
}

impl Persistent for DataObject {
    fn entity_name(&self) -> &str {
        &self.entity
    }

    fn object_id(&self) -> Option<&ObjectId> {
        self.id.as_ref()
    }

    fn set_object_id(&mut self, id: Option<ObjectId>) {
        self.id = id;
    }

    fn persistence_state(&self) -> PersistenceState {
        self.state
    }

    fn set_persistence_state(&mut self, state: PersistenceState) {
        self.state = state;
    }

    fn read_property(&self, name: &str) -> Option<Value> {
        self.values.get(name).cloned()
    }

    fn write_property(&mut self, name: &str, value: Value) {
        self.values.insert(name.to_string(), value);
    }

    fn arc_targets(&self, arc: &str) -> Vec<ObjectId> {
        self.arcs.get(arc).cloned().unwrap_or_default()
    }

    fn add_arc_target(&mut self, arc: &str, target: ObjectId) {
        let targets = self.arcs.entry(arc.to_string()).or_default();
        if !targets.contains(&target) {
            targets.push(target);
        }
    }

    fn remove_arc_target(&mut self, arc: &str, target: &ObjectId) {
        if let Some(targets) = self.arcs.get_mut(arc) {
            targets.retain(|t| t != target);
        }
    }

    fn replace_arc_target(&mut self, old: &ObjectId, new: &ObjectId) {
        for targets in self.arcs.values_mut() {
            for target in targets.iter_mut() {
                if target == old {
                    *target = new.clone();
                }
            }
        }
    }

    fn snapshot_version(&self) -> u64 {
        self.snapshot_version
    }

    fn set_snapshot_version(&mut self, version: u64) {
        self.snapshot_version = version;
    }

    fn session(&self) -> Option<SessionHandle> {
        self.session
    }

    fn set_session(&mut self, session: Option<SessionHandle>) {
        self.session = session;
    }

    fn clear_data(&mut self) {
        self.values.clear();
        self.arcs.clear();
        self.snapshot_version = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_round_trip() {
        let mut obj = DataObject::new("Artist");
        obj.write_property("name", Value::from("Dali"));
        assert_eq!(obj.read_property("name"), Some(Value::from("Dali")));
        assert_eq!(obj.read_property("missing"), None);
    }

    #[test]
    fn test_arc_targets_deduplicated() {
        let mut obj = DataObject::new("Artist");
        let target = ObjectId::temporary("Painting");
        obj.add_arc_target("paintings", target.clone());
        obj.add_arc_target("paintings", target.clone());
        assert_eq!(obj.arc_targets("paintings").len(), 1);

        obj.remove_arc_target("paintings", &target);
        assert!(obj.arc_targets("paintings").is_empty());
    }

    #[test]
    fn test_clear_data_keeps_identity() {
        let mut obj = DataObject::new("Artist");
        obj.set_object_id(Some(ObjectId::temporary("Artist")));
        obj.write_property("name", Value::from("x"));
        obj.clear_data();
        assert!(obj.object_id().is_some());
        assert!(obj.read_property("name").is_none());
    }
}
