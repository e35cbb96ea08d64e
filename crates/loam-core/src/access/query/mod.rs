//! Query construction, interception, caching, and materialization.

pub mod action;
pub mod cache;
pub mod incremental;
pub mod materializer;
pub mod prefetch;
pub mod select;

pub use action::QueryAction;
pub use cache::{CachedResult, QueryCache};
pub use incremental::IncrementalList;
pub use materializer::ObjectMaterializer;
pub use select::{
    CachePolicy, ObjectIdQuery, PrefetchNode, PrefetchSemantics, Query, QueryResponse,
    RelationshipQuery, SelectQuery,
};
