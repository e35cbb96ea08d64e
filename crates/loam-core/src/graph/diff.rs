//! Recorded object mutations.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::object::ObjectId;
use crate::value::Value;

/// One recorded mutation against a single object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GraphOp {
    /// The object was created.
    NodeCreated,
    /// The object was marked deleted.
    NodeRemoved,
    /// The object's identity changed (temporary id promoted, or a key
    /// column rewritten).
    NodeIdChanged {
        /// The new identity.
        to: ObjectId,
    },
    /// A scalar property changed.
    PropertyChanged {
        /// Property name.
        property: String,
        /// Value before the write.
        old_value: Value,
        /// Value after the write.
        new_value: Value,
    },
    /// A relationship arc to a target was created.
    ArcCreated {
        /// Target object id.
        target: ObjectId,
        /// Relationship name.
        arc: String,
    },
    /// A relationship arc to a target was deleted.
    ArcDeleted {
        /// Target object id.
        target: ObjectId,
        /// Relationship name.
        arc: String,
    },
}

/// Typed visitor over graph operations.
///
/// Handlers receive operations in recorded order. All methods default to
/// no-ops so a handler only implements the kinds it cares about.
pub trait GraphChangeHandler {
    /// An object was created.
    fn node_created(&mut self, _id: &ObjectId) {}
    /// An object was marked deleted.
    fn node_removed(&mut self, _id: &ObjectId) {}
    /// An object's identity changed.
    fn node_id_changed(&mut self, _from: &ObjectId, _to: &ObjectId) {}
    /// A scalar property changed.
    fn property_changed(&mut self, _id: &ObjectId, _property: &str, _old: &Value, _new: &Value) {}
    /// An arc was created.
    fn arc_created(&mut self, _source: &ObjectId, _target: &ObjectId, _arc: &str) {}
    /// An arc was deleted.
    fn arc_deleted(&mut self, _source: &ObjectId, _target: &ObjectId, _arc: &str) {}
}

/// Net scalar change for one property: first-seen original value and the
/// last written value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyChange {
    /// Value before the first recorded write.
    pub old_value: Value,
    /// Value after the last recorded write.
    pub new_value: Value,
}

/// Net arc change after cancellation of create/delete pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArcChange {
    /// Relationship name.
    pub arc: String,
    /// Target object id.
    pub target: ObjectId,
    /// True for a surviving create, false for a surviving delete.
    pub created: bool,
}

/// Per-object accumulator of mutations since the last clean state.
///
/// Operations are append-only within one commit cycle and discarded
/// wholesale on rollback or successful commit. Scalar reads are
/// last-write-wins with the original value retained; arc create/delete
/// pairs for the same (arc, target) cancel each other, which collapses
/// substitute-then-delete sequences to the delete of the original target.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectDiff {
    created: bool,
    deleted: bool,
    ops: Vec<GraphOp>,
    originals: BTreeMap<String, Value>,
    current: BTreeMap<String, Value>,
}

impl ObjectDiff {
    /// Create an empty diff.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one operation.
    pub fn record(&mut self, op: GraphOp) {
        match &op {
            GraphOp::NodeCreated => self.created = true,
            GraphOp::NodeRemoved => self.deleted = true,
            GraphOp::PropertyChanged {
                property,
                old_value,
                new_value,
            } => {
                self.originals
                    .entry(property.clone())
                    .or_insert_with(|| old_value.clone());
                self.current.insert(property.clone(), new_value.clone());
            }
            _ => {}
        }
        self.ops.push(op);
    }

    /// Whether the object was recorded as created.
    pub fn is_created(&self) -> bool {
        self.created
    }

    /// Whether the object was recorded as deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Net scalar changes, excluding properties written back to their
    /// original value.
    pub fn property_changes(&self) -> BTreeMap<String, PropertyChange> {
        self.current
            .iter()
            .filter_map(|(name, new_value)| {
                let old_value = self.originals.get(name).cloned().unwrap_or(Value::Null);
                if &old_value == new_value {
                    None
                } else {
                    Some((
                        name.clone(),
                        PropertyChange {
                            old_value,
                            new_value: new_value.clone(),
                        },
                    ))
                }
            })
            .collect()
    }

    /// Original value of a property, if one was recorded.
    pub fn original_value(&self, property: &str) -> Option<&Value> {
        self.originals.get(property)
    }

    /// Net arc changes after create/delete cancellation, in first-recorded
    /// order.
    pub fn arc_changes(&self) -> Vec<ArcChange> {
        let mut net: Vec<ArcChange> = Vec::new();
        for op in &self.ops {
            match op {
                GraphOp::ArcCreated { target, arc } => {
                    if let Some(pos) = net
                        .iter()
                        .position(|c| !c.created && c.arc == *arc && c.target == *target)
                    {
                        net.remove(pos);
                    } else {
                        net.push(ArcChange {
                            arc: arc.clone(),
                            target: target.clone(),
                            created: true,
                        });
                    }
                }
                GraphOp::ArcDeleted { target, arc } => {
                    if let Some(pos) = net
                        .iter()
                        .position(|c| c.created && c.arc == *arc && c.target == *target)
                    {
                        net.remove(pos);
                    } else {
                        net.push(ArcChange {
                            arc: arc.clone(),
                            target: target.clone(),
                            created: false,
                        });
                    }
                }
                _ => {}
            }
        }
        net
    }

    /// Whether the diff carries no net change.
    pub fn is_empty(&self) -> bool {
        !self.created
            && !self.deleted
            && self.property_changes().is_empty()
            && self.arc_changes().is_empty()
    }

    /// Replay recorded operations through a handler, in recorded order.
    pub fn apply(&self, id: &ObjectId, handler: &mut dyn GraphChangeHandler) {
        for op in &self.ops {
            apply_op(id, op, handler);
        }
    }

    /// Raw recorded operations.
    pub fn ops(&self) -> &[GraphOp] {
        &self.ops
    }
}

fn apply_op(id: &ObjectId, op: &GraphOp, handler: &mut dyn GraphChangeHandler) {
    match op {
        GraphOp::NodeCreated => handler.node_created(id),
        GraphOp::NodeRemoved => handler.node_removed(id),
        GraphOp::NodeIdChanged { to } => handler.node_id_changed(id, to),
        GraphOp::PropertyChanged {
            property,
            old_value,
            new_value,
        } => handler.property_changed(id, property, old_value, new_value),
        GraphOp::ArcCreated { target, arc } => handler.arc_created(id, target, arc),
        GraphOp::ArcDeleted { target, arc } => handler.arc_deleted(id, target, arc),
    }
}

/// Immutable combined diff for a whole pending change set, in recorded
/// order. This is the unit exchanged between tiers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphDiff {
    ops: Vec<(ObjectId, GraphOp)>,
}

impl GraphDiff {
    /// Create an empty diff.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one operation.
    pub fn add(&mut self, id: ObjectId, op: GraphOp) {
        self.ops.push((id, op));
    }

    /// Append every operation of a per-object diff.
    pub fn add_object_diff(&mut self, id: &ObjectId, diff: &ObjectDiff) {
        for op in diff.ops() {
            self.ops.push((id.clone(), op.clone()));
        }
    }

    /// Whether the diff is empty.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of recorded operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Replay all operations through a handler, in recorded order.
    pub fn apply(&self, handler: &mut dyn GraphChangeHandler) {
        for (id, op) in &self.ops {
            apply_op(id, op, handler);
        }
    }

    /// Iterate over recorded operations.
    pub fn iter(&self) -> impl Iterator<Item = &(ObjectId, GraphOp)> {
        self.ops.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_write_wins_keeps_original() {
        let mut diff = ObjectDiff::new();
        diff.record(GraphOp::PropertyChanged {
            property: "name".into(),
            old_value: Value::from("a"),
            new_value: Value::from("b"),
        });
        diff.record(GraphOp::PropertyChanged {
            property: "name".into(),
            old_value: Value::from("b"),
            new_value: Value::from("c"),
        });
        let changes = diff.property_changes();
        let change = &changes["name"];
        assert_eq!(change.old_value, Value::from("a"));
        assert_eq!(change.new_value, Value::from("c"));
    }

    #[test]
    fn test_write_back_to_original_is_phantom() {
        let mut diff = ObjectDiff::new();
        diff.record(GraphOp::PropertyChanged {
            property: "name".into(),
            old_value: Value::from("a"),
            new_value: Value::from("b"),
        });
        diff.record(GraphOp::PropertyChanged {
            property: "name".into(),
            old_value: Value::from("b"),
            new_value: Value::from("a"),
        });
        assert!(diff.property_changes().is_empty());
        assert!(diff.is_empty());
        // The raw ops survive for replay.
        assert_eq!(diff.ops().len(), 2);
    }

    #[test]
    fn test_arc_create_delete_cancels() {
        let target = ObjectId::temporary("Painting");
        let mut diff = ObjectDiff::new();
        diff.record(GraphOp::ArcCreated {
            target: target.clone(),
            arc: "paintings".into(),
        });
        diff.record(GraphOp::ArcDeleted {
            target,
            arc: "paintings".into(),
        });
        assert!(diff.arc_changes().is_empty());
    }

    #[test]
    fn test_substitute_then_delete_keeps_original_delete() {
        let old = ObjectId::with_single_key("Artist", "ID", Value::Int64(1));
        let new = ObjectId::with_single_key("Artist", "ID", Value::Int64(2));
        let mut diff = ObjectDiff::new();
        // Substitute: move the to-one arc from old to new...
        diff.record(GraphOp::ArcDeleted {
            target: old.clone(),
            arc: "artist".into(),
        });
        diff.record(GraphOp::ArcCreated {
            target: new.clone(),
            arc: "artist".into(),
        });
        // ...then delete the arc entirely.
        diff.record(GraphOp::ArcDeleted {
            target: new,
            arc: "artist".into(),
        });
        let net = diff.arc_changes();
        assert_eq!(net.len(), 1);
        assert_eq!(net[0].target, old);
        assert!(!net[0].created);
    }

    #[test]
    fn test_replay_order_preserved() {
        #[derive(Default)]
        struct Recorder(Vec<String>);
        impl GraphChangeHandler for Recorder {
            fn node_created(&mut self, _id: &ObjectId) {
                self.0.push("created".into());
            }
            fn property_changed(
                &mut self,
                _id: &ObjectId,
                property: &str,
                _old: &Value,
                _new: &Value,
            ) {
                self.0.push(format!("prop:{property}"));
            }
        }

        let id = ObjectId::temporary("Artist");
        let mut diff = GraphDiff::new();
        diff.add(id.clone(), GraphOp::NodeCreated);
        diff.add(
            id,
            GraphOp::PropertyChanged {
                property: "name".into(),
                old_value: Value::Null,
                new_value: Value::from("x"),
            },
        );
        let mut recorder = Recorder::default();
        diff.apply(&mut recorder);
        assert_eq!(recorder.0, vec!["created", "prop:name"]);
    }

    #[test]
    fn test_replay_into_fresh_diff_reproduces_net_changes() {
        #[derive(Default)]
        struct ReRecorder(ObjectDiff);
        impl GraphChangeHandler for ReRecorder {
            fn property_changed(
                &mut self,
                _id: &ObjectId,
                property: &str,
                old: &Value,
                new: &Value,
            ) {
                self.0.record(GraphOp::PropertyChanged {
                    property: property.into(),
                    old_value: old.clone(),
                    new_value: new.clone(),
                });
            }
            fn arc_created(&mut self, _source: &ObjectId, target: &ObjectId, arc: &str) {
                self.0.record(GraphOp::ArcCreated {
                    target: target.clone(),
                    arc: arc.into(),
                });
            }
            fn arc_deleted(&mut self, _source: &ObjectId, target: &ObjectId, arc: &str) {
                self.0.record(GraphOp::ArcDeleted {
                    target: target.clone(),
                    arc: arc.into(),
                });
            }
        }

        let id = ObjectId::temporary("Artist");
        let kept = ObjectId::with_single_key("Painting", "ID", Value::Int64(7));
        let cancelled = ObjectId::temporary("Painting");
        let mut diff = ObjectDiff::new();
        diff.record(GraphOp::PropertyChanged {
            property: "name".into(),
            old_value: Value::from("a"),
            new_value: Value::from("b"),
        });
        diff.record(GraphOp::PropertyChanged {
            property: "name".into(),
            old_value: Value::from("b"),
            new_value: Value::from("c"),
        });
        diff.record(GraphOp::ArcCreated {
            target: kept.clone(),
            arc: "paintings".into(),
        });
        diff.record(GraphOp::ArcCreated {
            target: cancelled.clone(),
            arc: "paintings".into(),
        });
        diff.record(GraphOp::ArcDeleted {
            target: cancelled,
            arc: "paintings".into(),
        });

        let mut rerecorder = ReRecorder::default();
        diff.apply(&id, &mut rerecorder);
        assert_eq!(rerecorder.0.property_changes(), diff.property_changes());
        assert_eq!(rerecorder.0.arc_changes(), diff.arc_changes());
        // The surviving net change is the single kept arc.
        let net = rerecorder.0.arc_changes();
        assert_eq!(net.len(), 1);
        assert_eq!(net[0].target, kept);
        assert!(net[0].created);
    }

    #[test]
    fn test_diff_json_round_trip() {
        let id = ObjectId::temporary("Artist");
        let mut diff = GraphDiff::new();
        diff.add(id.clone(), GraphOp::NodeCreated);
        diff.add(
            id.clone(),
            GraphOp::PropertyChanged {
                property: "name".into(),
                old_value: Value::Null,
                new_value: Value::from("Picasso"),
            },
        );
        diff.add(
            id,
            GraphOp::ArcCreated {
                target: ObjectId::temporary("Painting"),
                arc: "paintings".into(),
            },
        );

        let encoded = serde_json::to_string(&diff).unwrap();
        let decoded: GraphDiff = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.len(), diff.len());
        let before: Vec<_> = diff.iter().collect();
        let after: Vec<_> = decoded.iter().collect();
        assert_eq!(after[1].1, before[1].1);
        assert_eq!(after[0].0, before[0].0);
    }
}
