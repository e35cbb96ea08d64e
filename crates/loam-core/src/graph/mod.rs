//! Change-graph types: per-object diffs and the combined graph diff
//! exchanged between tiers.

mod diff;

pub use diff::{ArcChange, GraphChangeHandler, GraphDiff, GraphOp, ObjectDiff, PropertyChange};
