//! Mapping metadata consumed by the persistence core.
//!
//! Entities, attributes, relationships, and delete rules are supplied by an
//! external mapping layer and are read-only for the duration of a commit.
//! This module defines the in-memory shape of that metadata plus the
//! [`EntityResolver`] lookup facade and the [`EntitySorter`] used by the
//! commit pipeline to order tables by foreign-key dependency.

mod entity;
mod relationship;
mod resolver;
mod sorter;

pub use entity::{DbAttribute, DbEntity, ObjAttribute, ObjEntity};
pub use relationship::{DbJoin, DbRelationship, DeleteRule, ObjRelationship};
pub use resolver::EntityResolver;
pub use sorter::EntitySorter;
