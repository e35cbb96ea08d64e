//! Loam Core - Change-tracking object store, snapshot cache, and commit
//! pipeline.
//!
//! This crate provides the session-level persistence machinery: objects are
//! registered with a [`DataContext`], edits accumulate as graph diffs, and a
//! commit translates the pending diff into ordered batched writes against a
//! [`DataNode`].

pub mod access;
pub mod error;
pub mod graph;
pub mod map;
pub mod object;
pub mod value;

pub use access::batch::{BatchKind, BatchQuery, BatchRow, BatchValue};
pub use access::commit::{perform_delete, CommitBuckets, FlattenedArcKey, FlushAction, RelatedFinder};
pub use access::context::DataContext;
pub use access::event::{Event, EventBus, EventKind, SnapshotEvent, Subscription};
pub use access::node::{
    DataNode, MemoryConnection, MemoryNode, OperationObserver, OpLogEntry, PkGenerator,
};
pub use access::object_store::{ObjectStore, ObjectStoreDelegate};
pub use access::query::{
    CachePolicy, IncrementalList, ObjectIdQuery, PrefetchNode, PrefetchSemantics, Query,
    QueryCache, QueryResponse, RelationshipQuery, SelectQuery,
};
pub use access::snapshot::DataRow;
pub use access::snapshot_cache::{SnapshotCache, SnapshotCacheConfig};
pub use access::transaction::{
    Transaction, TransactionConnection, TransactionDelegate, TxStatus,
};
pub use error::{Error, Result};
pub use graph::{GraphChangeHandler, GraphDiff, GraphOp, ObjectDiff};
pub use map::{
    DbAttribute, DbEntity, DbJoin, DbRelationship, DeleteRule, EntityResolver, EntitySorter,
    ObjAttribute, ObjEntity, ObjRelationship,
};
pub use object::{DataObject, ObjectId, PersistenceState, Persistent, SessionHandle};
pub use value::Value;
