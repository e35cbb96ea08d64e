//! The physical execution engine contract.

mod memory;

pub use memory::{MemoryConnection, MemoryNode, OpLogEntry};

use std::collections::BTreeMap;

use crate::access::query::Query;
use crate::access::snapshot::DataRow;
use crate::access::transaction::Transaction;
use crate::error::{Error, Result};
use crate::map::DbEntity;
use crate::object::ObjectId;
use crate::value::Value;

/// Callback object collecting per-operation results from a node.
///
/// Per-operation failures arrive through [`OperationObserver::next_query_exception`];
/// connection-level failures that abort the remaining operations arrive
/// through the separate global channel.
pub trait OperationObserver {
    /// A write operation affected `count` rows.
    fn next_count(&mut self, query: &Query, count: usize);

    /// A fetch produced rows.
    fn next_rows(&mut self, query: &Query, rows: Vec<DataRow>);

    /// A write produced database-generated keys.
    fn next_generated_keys(&mut self, _query: &Query, _keys: Vec<(ObjectId, BTreeMap<String, Value>)>) {
    }

    /// One operation failed; remaining operations on the same connection
    /// were aborted.
    fn next_query_exception(&mut self, query: &Query, error: Error);

    /// The connection itself failed.
    fn next_global_exception(&mut self, error: Error);
}

/// Allocator of fresh primary-key values.
pub trait PkGenerator: Send + Sync {
    /// Return one freshly allocated key value for a table. Failure is fatal
    /// for the insert batch that requested it.
    fn generate_pk(&self, entity: &DbEntity) -> Result<Value>;
}

/// A physical data source: executes an ordered collection of operations and
/// reports results through an observer.
pub trait DataNode: Send + Sync {
    /// Node name, used for routing diagnostics.
    fn name(&self) -> &str;

    /// Execute operations in order inside the given transaction. Errors are
    /// reported through the observer, not returned.
    fn perform_queries(
        &self,
        queries: &[Query],
        observer: &mut dyn OperationObserver,
        tx: &mut Transaction,
    );

    /// The key generator for this node's tables.
    fn pk_generator(&self) -> &dyn PkGenerator;
}
