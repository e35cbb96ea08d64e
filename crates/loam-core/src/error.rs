//! Core error types.

use thiserror::Error;

use crate::object::PersistenceState;

/// Convenience result alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Persistence core errors.
///
/// The taxonomy separates configuration defects (`Mapping`), caller
/// recoverable constraint conflicts (`DeleteDenied`), lifecycle misuse
/// (`IllegalTransition`, `Transaction`), and physical execution failures
/// (`Query` per operation, `Connection` for connection-level failures that
/// always mark the active transaction rollback-only).
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration defect in the metadata: missing entity, missing primary
    /// key definition, unsupported key generation shape. Non-retryable.
    #[error("mapping error: {0}")]
    Mapping(String),

    /// A delete was blocked by a Deny delete rule. The object's persistence
    /// state has been restored, so the caller may resolve the conflict and
    /// retry.
    #[error("cannot delete: relationship '{relationship}' has deny rule and {related_count} related object(s)")]
    DeleteDenied {
        /// Name of the relationship carrying the Deny rule.
        relationship: String,
        /// Number of related objects that blocked the delete.
        related_count: usize,
    },

    /// An operation targeted an object this store does not own, or an object
    /// with no identity.
    #[error("object not managed by this store: {0}")]
    NotManaged(String),

    /// Illegal persistence state transition.
    #[error("illegal persistence state transition: {from:?} -> {to:?}")]
    IllegalTransition {
        /// State before the attempted transition.
        from: PersistenceState,
        /// Requested target state.
        to: PersistenceState,
    },

    /// Transaction lifecycle misuse or commit/rollback failure.
    #[error("transaction error: {0}")]
    Transaction(String),

    /// A single query or batch failed on a data node. Remaining operations
    /// on the same connection were aborted.
    #[error("query failed: {0}")]
    Query(String),

    /// Connection-level failure reported through the global exception
    /// channel, distinct from per-query failures.
    #[error("connection failure: {0}")]
    Connection(String),

    /// Primary key generation failed for a table.
    #[error("primary key generation failed for '{table}': {reason}")]
    PkGeneration {
        /// Table whose key could not be generated.
        table: String,
        /// Failure detail.
        reason: String,
    },

    /// A temporary id survived to the end of a commit without being resolved
    /// to a permanent id.
    #[error("temporary id not resolved during commit: {0}")]
    UnresolvedId(String),
}

impl Error {
    /// Whether this error indicates a configuration defect that retrying
    /// cannot fix.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Mapping(_) | Error::NotManaged(_) | Error::UnresolvedId(_)
        )
    }
}
