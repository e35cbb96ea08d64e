//! The channel contract and its parent-side implementation.

use std::sync::Arc;

use tracing::{debug, warn};

use loam_core::access::context::DataContext;
use loam_core::access::query::Query;
use loam_core::error::{Error, Result};
use loam_core::graph::GraphDiff;
use loam_core::object::ObjectId;

use crate::client_diff;

/// What a sync message asks the parent tier to do with the attached diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    /// Discard the parent's pending changes for this child.
    RollbackCascade,
    /// Apply the child's diff to the parent context without committing.
    FlushNoCascade,
    /// Apply the child's diff and commit the parent context.
    FlushCascade,
}

/// A query answered across the channel: the resolved ids, in result order.
/// Row data travels implicitly through the shared snapshot machinery on the
/// serving side; a wire transport would serialize rows alongside.
#[derive(Debug, Clone, Default)]
pub struct RemoteResponse {
    /// Ids of the result objects.
    pub ids: Vec<ObjectId>,
}

/// The two operations a child context needs from its parent tier.
pub trait RemoteChannel: Send + Sync {
    /// Execute a query on the parent tier.
    fn on_query(&self, query: &Query) -> Result<RemoteResponse>;

    /// Apply a child diff. For [`SyncKind::FlushCascade`] the returned diff
    /// carries the server-side changes translated into client-safe form.
    fn on_sync(&self, diff: &GraphDiff, kind: SyncKind) -> Result<GraphDiff>;
}

/// Channel endpoint wrapping a parent-side context.
pub struct ServerChannel {
    context: Arc<DataContext>,
}

impl ServerChannel {
    pub fn new(context: Arc<DataContext>) -> Self {
        Self { context }
    }

    /// The wrapped parent context.
    pub fn context(&self) -> &Arc<DataContext> {
        &self.context
    }
}

impl RemoteChannel for ServerChannel {
    fn on_query(&self, query: &Query) -> Result<RemoteResponse> {
        let ids = match query {
            Query::Select(select) => self.context.perform_query(select)?,
            Query::ObjectId(q) => self
                .context
                .fetch_object(&q.id, q.refresh)?
                .into_iter()
                .collect(),
            Query::Relationship(q) => self
                .context
                .resolve_relationship(&q.source, &q.relationship)?,
            Query::Batch(_) => {
                return Err(Error::Query(
                    "batches travel inside sync diffs, not queries".to_string(),
                ))
            }
        };
        Ok(RemoteResponse { ids })
    }

    fn on_sync(&self, diff: &GraphDiff, kind: SyncKind) -> Result<GraphDiff> {
        debug!(?kind, ops = diff.len(), "sync message received");
        match kind {
            SyncKind::RollbackCascade => {
                self.context.rollback_changes();
                Ok(GraphDiff::new())
            }
            SyncKind::FlushNoCascade => {
                self.context.apply_diff(diff)?;
                Ok(GraphDiff::new())
            }
            SyncKind::FlushCascade => {
                self.context.apply_diff(diff)?;
                match self.context.commit_changes() {
                    Ok(server_diff) => Ok(client_diff::translate_for_client(&server_diff)),
                    Err(error) => {
                        // The child's view is unchanged; the parent keeps
                        // the applied-but-uncommitted diff for inspection.
                        warn!(%error, "cascading commit failed");
                        Err(error)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loam_core::access::snapshot_cache::SnapshotCache;
    use loam_core::map::{DbAttribute, DbEntity, EntityResolver, ObjAttribute, ObjEntity};
    use loam_core::object::PersistenceState;
    use loam_core::value::Value;
    use loam_core::{GraphOp, MemoryNode, ObjectId};

    fn server_channel() -> (ServerChannel, Arc<MemoryNode>) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let mut resolver = EntityResolver::new();
        resolver.add_db_entity(DbEntity::new(
            "ARTIST",
            vec![DbAttribute::generated_pk("ID"), DbAttribute::new("NAME")],
        ));
        resolver.add_obj_entity(
            ObjEntity::new("Artist", "ARTIST").with_attribute(ObjAttribute::new("name", "NAME")),
        );
        let resolver = Arc::new(resolver);
        let node = Arc::new(MemoryNode::new("server", Arc::clone(&resolver)));
        let context = Arc::new(DataContext::new(
            resolver,
            Arc::clone(&node) as Arc<dyn loam_core::DataNode>,
            Arc::new(SnapshotCache::with_defaults()),
        ));
        (ServerChannel::new(context), node)
    }

    #[test]
    fn test_flush_cascade_returns_id_promotion() {
        let (channel, node) = server_channel();

        // A child created one object; its diff arrives over the channel.
        let temp = ObjectId::temporary("Artist");
        let mut diff = GraphDiff::new();
        diff.add(temp.clone(), GraphOp::NodeCreated);
        diff.add(
            temp.clone(),
            GraphOp::PropertyChanged {
                property: "name".to_string(),
                old_value: Value::Null,
                new_value: Value::from("Kahlo"),
            },
        );

        let reply = channel.on_sync(&diff, SyncKind::FlushCascade).unwrap();
        let promoted: Vec<_> = reply
            .iter()
            .filter_map(|(id, op)| match op {
                GraphOp::NodeIdChanged { to } => Some((id.clone(), to.clone())),
                _ => None,
            })
            .collect();
        assert_eq!(promoted.len(), 1);
        assert_eq!(promoted[0].0, temp);
        assert!(!promoted[0].1.is_temporary());
        assert_eq!(node.table_rows("ARTIST").len(), 1);
    }

    #[test]
    fn test_rollback_cascade_discards_pending() {
        let (channel, node) = server_channel();
        let temp = ObjectId::temporary("Artist");
        let mut diff = GraphDiff::new();
        diff.add(temp.clone(), GraphOp::NodeCreated);

        channel.on_sync(&diff, SyncKind::FlushNoCascade).unwrap();
        assert_eq!(
            channel.context().object_store().object_state(&temp),
            Some(PersistenceState::New)
        );

        channel.on_sync(&GraphDiff::new(), SyncKind::RollbackCascade).unwrap();
        assert_eq!(channel.context().object_store().object_state(&temp), None);
        assert!(node.table_rows("ARTIST").is_empty());
    }
}
