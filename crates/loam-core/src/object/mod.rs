//! Object identity and the persistence state machine.

mod id;
mod persistent;
mod state;

pub use id::ObjectId;
pub use persistent::{DataObject, Persistent, SessionHandle};
pub use state::PersistenceState;
