//! Change-event dispatch.
//!
//! Subscriptions are typed closures keyed by an enumerated event kind.
//! Dispatch snapshots the subscriber list under the lock and invokes the
//! callbacks after releasing it, so publishing never blocks on a listener
//! while a lock is held. A commit thread already holding the object-store
//! lock can therefore post events safely.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::access::snapshot::DataRow;
use crate::object::{ObjectId, SessionHandle};

/// Kinds of events the core publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The snapshot cache applied row changes.
    SnapshotsChanged,
    /// A transaction committed.
    TransactionCommitted,
    /// A transaction rolled back.
    TransactionRolledBack,
}

/// A snapshot-change notification.
#[derive(Debug, Clone, Default)]
pub struct SnapshotEvent {
    /// Session that posted the change, used by stores to discriminate
    /// self-originated events from peer events.
    pub posted_by: Option<SessionHandle>,
    /// Applied column-level deltas per id.
    pub updated: HashMap<ObjectId, DataRow>,
    /// Ids whose rows were deleted.
    pub deleted: Vec<ObjectId>,
    /// Ids whose rows were explicitly invalidated.
    pub invalidated: Vec<ObjectId>,
    /// Ids modified indirectly, e.g. through a reverse relationship.
    pub indirectly_modified: Vec<ObjectId>,
}

/// An event payload.
#[derive(Debug, Clone)]
pub enum Event {
    /// Snapshot cache changes.
    Snapshots(SnapshotEvent),
    /// Transaction lifecycle notification.
    Transaction(EventKind),
}

type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    kind: EventKind,
    id: u64,
}

/// In-process publish/subscribe hub.
///
/// A remote bridge for out-of-process listeners is just another subscriber
/// that forwards events over its own transport.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<HashMap<EventKind, Vec<(u64, Callback)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback for one event kind.
    pub fn subscribe(
        &self,
        kind: EventKind,
        callback: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .entry(kind)
            .or_default()
            .push((id, Arc::new(callback)));
        Subscription { kind, id }
    }

    /// Remove a previously registered callback.
    pub fn unsubscribe(&self, subscription: Subscription) {
        if let Some(list) = self.subscribers.lock().get_mut(&subscription.kind) {
            list.retain(|(id, _)| *id != subscription.id);
        }
    }

    /// Deliver an event to all subscribers of a kind.
    ///
    /// Callbacks run on the publishing thread, after the subscriber lock has
    /// been released.
    pub fn publish(&self, kind: EventKind, event: &Event) {
        let callbacks: Vec<Callback> = {
            let guard = self.subscribers.lock();
            match guard.get(&kind) {
                Some(list) => list.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
                None => return,
            }
        };
        for callback in callbacks {
            callback(event);
        }
    }
}
