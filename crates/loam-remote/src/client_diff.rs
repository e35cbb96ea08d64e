//! Translation of a server-side commit diff into client-safe form.

use std::collections::HashMap;

use loam_core::graph::{GraphDiff, GraphOp};
use loam_core::object::ObjectId;

/// Rewrite a committed server diff for the client.
///
/// Every id that the commit promoted is rewritten to its permanent form,
/// except in the `NodeIdChanged` ops themselves, which stay keyed by the
/// pre-commit id so the client can re-key its own objects. The result
/// carries only plain values and ids; nothing server-side leaks through.
pub fn translate_for_client(diff: &GraphDiff) -> GraphDiff {
    let promotions: HashMap<ObjectId, ObjectId> = diff
        .iter()
        .filter_map(|(id, op)| match op {
            GraphOp::NodeIdChanged { to } => Some((id.clone(), to.clone())),
            _ => None,
        })
        .collect();
    let resolve = |id: &ObjectId| promotions.get(id).cloned().unwrap_or_else(|| id.clone());

    let mut translated = GraphDiff::new();
    for (id, op) in compact(diff).iter() {
        match op {
            GraphOp::NodeIdChanged { to } => {
                translated.add(id.clone(), GraphOp::NodeIdChanged { to: to.clone() });
            }
            GraphOp::ArcCreated { target, arc } => {
                translated.add(
                    resolve(id),
                    GraphOp::ArcCreated {
                        target: resolve(target),
                        arc: arc.clone(),
                    },
                );
            }
            GraphOp::ArcDeleted { target, arc } => {
                translated.add(
                    resolve(id),
                    GraphOp::ArcDeleted {
                        target: resolve(target),
                        arc: arc.clone(),
                    },
                );
            }
            other => {
                translated.add(resolve(id), other.clone());
            }
        }
    }
    translated
}

/// Drop ops that cancel out within one diff: anything recorded for a node
/// that was both created and removed, and all but the last write per
/// property (keeping the first op's old value).
pub fn compact(diff: &GraphDiff) -> GraphDiff {
    let mut created: Vec<&ObjectId> = Vec::new();
    let mut removed: Vec<&ObjectId> = Vec::new();
    for (id, op) in diff.iter() {
        match op {
            GraphOp::NodeCreated => created.push(id),
            GraphOp::NodeRemoved => removed.push(id),
            _ => {}
        }
    }
    let ephemeral: Vec<&ObjectId> = created
        .iter()
        .filter(|id| removed.contains(id))
        .copied()
        .collect();

    let mut compacted = GraphDiff::new();
    // (position in output, first old value) per (id, property).
    let mut property_slots: HashMap<(ObjectId, String), usize> = HashMap::new();
    let mut out: Vec<(ObjectId, GraphOp)> = Vec::new();

    for (id, op) in diff.iter() {
        if ephemeral.contains(&id) {
            continue;
        }
        if let GraphOp::PropertyChanged {
            property,
            old_value,
            new_value,
        } = op
        {
            let slot_key = (id.clone(), property.clone());
            match property_slots.get(&slot_key) {
                Some(&slot) => {
                    if let (_, GraphOp::PropertyChanged { new_value: existing, .. }) =
                        &mut out[slot]
                    {
                        *existing = new_value.clone();
                    }
                }
                None => {
                    property_slots.insert(slot_key, out.len());
                    out.push((
                        id.clone(),
                        GraphOp::PropertyChanged {
                            property: property.clone(),
                            old_value: old_value.clone(),
                            new_value: new_value.clone(),
                        },
                    ));
                }
            }
            continue;
        }
        if ephemeral.iter().any(|e| match op {
            GraphOp::ArcCreated { target, .. } | GraphOp::ArcDeleted { target, .. } => {
                *e == target
            }
            _ => false,
        }) {
            continue;
        }
        out.push((id.clone(), op.clone()));
    }
    for (id, op) in out {
        compacted.add(id, op);
    }
    compacted
}

#[cfg(test)]
mod tests {
    use super::*;
    use loam_core::value::Value;

    fn temp() -> ObjectId {
        ObjectId::temporary("Artist")
    }

    fn permanent(key: i64) -> ObjectId {
        ObjectId::with_single_key("Artist", "ID", Value::Int64(key))
    }

    #[test]
    fn test_promoted_ids_rewritten_except_in_promotion_op() {
        let t = temp();
        let p = permanent(5);
        let mut diff = GraphDiff::new();
        diff.add(t.clone(), GraphOp::NodeCreated);
        diff.add(
            t.clone(),
            GraphOp::PropertyChanged {
                property: "name".to_string(),
                old_value: Value::Null,
                new_value: Value::from("x"),
            },
        );
        diff.add(t.clone(), GraphOp::NodeIdChanged { to: p.clone() });

        let translated = translate_for_client(&diff);
        let mut saw_promotion = false;
        for (id, op) in translated.iter() {
            match op {
                GraphOp::NodeIdChanged { to } => {
                    assert_eq!(id, &t);
                    assert_eq!(to, &p);
                    saw_promotion = true;
                }
                _ => assert_eq!(id, &p),
            }
        }
        assert!(saw_promotion);
    }

    #[test]
    fn test_create_then_delete_cancels() {
        let t = temp();
        let keeper = permanent(1);
        let mut diff = GraphDiff::new();
        diff.add(t.clone(), GraphOp::NodeCreated);
        diff.add(
            keeper.clone(),
            GraphOp::ArcCreated {
                target: t.clone(),
                arc: "paintings".to_string(),
            },
        );
        diff.add(t.clone(), GraphOp::NodeRemoved);

        let compacted = compact(&diff);
        assert!(compacted.is_empty());
    }

    #[test]
    fn test_repeated_property_writes_collapse() {
        let p = permanent(1);
        let mut diff = GraphDiff::new();
        for (old, new) in [("a", "b"), ("b", "c")] {
            diff.add(
                p.clone(),
                GraphOp::PropertyChanged {
                    property: "name".to_string(),
                    old_value: Value::from(old),
                    new_value: Value::from(new),
                },
            );
        }
        let compacted = compact(&diff);
        let ops: Vec<_> = compacted.iter().collect();
        assert_eq!(ops.len(), 1);
        assert!(matches!(
            &ops[0].1,
            GraphOp::PropertyChanged { old_value, new_value, .. }
                if *old_value == Value::from("a") && *new_value == Value::from("c")
        ));
    }
}
