//! The persistence state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a persistent object.
///
/// Transitions are driven exclusively by the object store and the commit
/// pipeline; the legal-transition table lives in [`PersistenceState::can_transition`]
/// so that illegal transitions are rejected at a single point instead of
/// being re-checked ad hoc at every call site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PersistenceState {
    /// Not registered with any store.
    Transient,
    /// Registered, identity known, data not loaded.
    Hollow,
    /// Registered, no database row yet.
    New,
    /// Matches the last known database state.
    Committed,
    /// Local changes pending.
    Modified,
    /// Marked for removal at the next commit.
    Deleted,
}

impl PersistenceState {
    /// Whether a transition from `self` to `to` is legal.
    pub fn can_transition(self, to: PersistenceState) -> bool {
        use PersistenceState::*;
        if self == to {
            return true;
        }
        match (self, to) {
            // Unregistering is always possible.
            (_, Transient) => true,
            // Registration paths.
            (Transient, New) | (Transient, Hollow) => true,
            // Resolving or mutating an unloaded object.
            (Hollow, Committed) | (Hollow, Modified) | (Hollow, Deleted) => true,
            // Steady state and the edits away from it.
            (Committed, Modified) | (Committed, Deleted) | (Committed, Hollow) => true,
            // Commit, rollback, and delete of locally edited objects.
            (Modified, Committed) | (Modified, Deleted) | (Modified, Hollow) => true,
            // New objects commit or are discarded.
            (New, Committed) | (New, Deleted) => true,
            // Deleted objects roll back, or have their prior state restored
            // after a denied delete.
            (Deleted, Hollow) | (Deleted, Committed) | (Deleted, Modified) | (Deleted, New) => {
                true
            }
            _ => false,
        }
    }

    /// Validate a transition, returning the target state.
    pub fn transition(self, to: PersistenceState) -> crate::error::Result<PersistenceState> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(crate::error::Error::IllegalTransition { from: self, to })
        }
    }

    /// Whether the object carries uncommitted changes in this state.
    pub fn is_dirty(self) -> bool {
        matches!(
            self,
            PersistenceState::New | PersistenceState::Modified | PersistenceState::Deleted
        )
    }

    /// Whether the object is attached to a store in this state.
    pub fn is_registered(self) -> bool {
        self != PersistenceState::Transient
    }
}
