//! Abstract query objects.
//!
//! SQL rendering is an adapter concern; the core builds and dispatches
//! these abstract forms and consumes raw rows back.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::access::batch::BatchQuery;
use crate::object::ObjectId;
use crate::value::Value;

/// Result caching policy for a select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Always execute.
    NoCache,
    /// Serve from the query cache when a result is stored under the query's
    /// cache key.
    Cache,
    /// Refresh the cache: evict any stored result, execute, store anew.
    CacheRefresh,
}

/// How a prefetch node's rows are fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchSemantics {
    /// A separate query per prefetch node.
    Disjoint,
    /// A single joined result set with prefix-qualified columns.
    Joint,
}

/// One node of a prefetch tree: eager loading of a relationship alongside
/// the main result.
#[derive(Debug, Clone)]
pub struct PrefetchNode {
    /// Relationship to prefetch, named on the main entity (or the parent
    /// prefetch entity for nested nodes).
    pub relationship: String,
    /// Fetch strategy.
    pub semantics: PrefetchSemantics,
    /// Nested prefetches.
    pub children: Vec<PrefetchNode>,
}

impl PrefetchNode {
    /// Create a disjoint prefetch of one relationship.
    pub fn disjoint(relationship: impl Into<String>) -> Self {
        Self {
            relationship: relationship.into(),
            semantics: PrefetchSemantics::Disjoint,
            children: Vec::new(),
        }
    }

    /// Create a joint prefetch of one relationship.
    pub fn joint(relationship: impl Into<String>) -> Self {
        Self {
            relationship: relationship.into(),
            semantics: PrefetchSemantics::Joint,
            children: Vec::new(),
        }
    }
}

/// A fetch of one entity's rows.
#[derive(Debug, Clone)]
pub struct SelectQuery {
    /// Root object entity.
    pub entity: String,
    /// Conjunction of column equality constraints.
    pub qualifier: BTreeMap<String, Value>,
    /// Optional single-column IN constraint, used by disjoint prefetches.
    pub in_qualifier: Option<(String, Vec<Value>)>,
    /// Caching policy.
    pub cache_policy: CachePolicy,
    /// Cache key for `Cache`/`CacheRefresh` policies and paginated lists.
    pub cache_key: Option<String>,
    /// Page size; zero means not paginated.
    pub page_size: usize,
    /// Whether cached objects must be refreshed from fetched rows.
    pub refresh: bool,
    /// Prefetch tree.
    pub prefetches: Vec<PrefetchNode>,
}

impl SelectQuery {
    /// Select all rows of an entity.
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            qualifier: BTreeMap::new(),
            in_qualifier: None,
            cache_policy: CachePolicy::NoCache,
            cache_key: None,
            page_size: 0,
            refresh: false,
            prefetches: Vec::new(),
        }
    }

    /// Add a column equality constraint.
    pub fn with_qualifier(mut self, column: impl Into<String>, value: Value) -> Self {
        self.qualifier.insert(column.into(), value);
        self
    }

    /// Use the query cache under the given key.
    pub fn cached(mut self, key: impl Into<String>) -> Self {
        self.cache_policy = CachePolicy::Cache;
        self.cache_key = Some(key.into());
        self
    }

    /// Refresh the query cache under the given key.
    pub fn cache_refreshing(mut self, key: impl Into<String>) -> Self {
        self.cache_policy = CachePolicy::CacheRefresh;
        self.cache_key = Some(key.into());
        self
    }

    /// Paginate with the given page size, keyed by `key`.
    pub fn paginated(mut self, page_size: usize, key: impl Into<String>) -> Self {
        self.page_size = page_size;
        self.cache_key = Some(key.into());
        self
    }

    /// Add a prefetch node.
    pub fn with_prefetch(mut self, node: PrefetchNode) -> Self {
        self.prefetches.push(node);
        self
    }

    /// Force refreshing of already-loaded objects.
    pub fn refreshing(mut self) -> Self {
        self.refresh = true;
        self
    }
}

/// Fetch of a single object by identity.
#[derive(Debug, Clone)]
pub struct ObjectIdQuery {
    /// Target identity.
    pub id: ObjectId,
    /// Bypass the snapshot cache and fetch.
    pub refresh: bool,
}

/// Fetch of the objects related to a source object through one
/// relationship.
#[derive(Debug, Clone)]
pub struct RelationshipQuery {
    /// Source object.
    pub source: ObjectId,
    /// Relationship name on the source entity.
    pub relationship: String,
}

/// Any operation a data node can execute.
#[derive(Debug, Clone)]
pub enum Query {
    /// Row fetch.
    Select(SelectQuery),
    /// Identity lookup.
    ObjectId(ObjectIdQuery),
    /// Relationship fetch.
    Relationship(RelationshipQuery),
    /// Batched write.
    Batch(BatchQuery),
}

/// Result of one query: the main row list plus any prefetch sub-results
/// keyed by relationship path. Row lists are shared immutably; a cache hit
/// hands out the same list without copying, and callers cannot mutate it.
#[derive(Debug, Clone, Default)]
pub struct QueryResponse {
    /// Main result rows.
    pub rows: Arc<Vec<crate::access::snapshot::DataRow>>,
    /// Prefetch sub-results by relationship path.
    pub prefetch_rows: BTreeMap<String, Arc<Vec<crate::access::snapshot::DataRow>>>,
    /// Ids resolved without a row fetch (known-FK relationship
    /// interception). The materializer registers these as hollow objects.
    pub resolved_ids: Option<Vec<ObjectId>>,
}
