//! The access layer: object store, snapshot cache, commit pipeline, query
//! dispatch, and transactions.

pub mod batch;
pub mod commit;
pub mod context;
pub mod event;
pub mod node;
pub mod object_store;
pub mod query;
pub mod snapshot;
pub mod snapshot_cache;
pub mod transaction;
