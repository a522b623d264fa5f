//! Observer registry for device events.
//!
//! Maps each [`EventKind`] to an ordered list of observers. Registration
//! returns an [`ObserverHandle`] that removes exactly that observer again.
//! Notification works on a snapshot of the list, so observers may register
//! or remove observers (including themselves) while being called.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use uuid::Uuid;

use crate::event::{DeviceEvent, EventKind};

/// Observer callback type
pub type Observer = Arc<dyn Fn(&DeviceEvent) + Send + Sync>;

/// Handle for a registered observer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverHandle {
    kind: EventKind,
    id: Uuid,
}

impl ObserverHandle {
    fn new(kind: EventKind) -> Self {
        Self {
            kind,
            id: Uuid::new_v4(),
        }
    }

    /// Event kind this observer is registered for
    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

impl std::fmt::Display for ObserverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Observer({:?}, {})", self.kind, &self.id.to_string()[..8])
    }
}

/// Registry of per-kind observer lists
#[derive(Default)]
pub struct ObserverRegistry {
    observers: RwLock<HashMap<EventKind, Vec<(ObserverHandle, Observer)>>>,
}

impl ObserverRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an observer for one event kind. Observers of the same kind
    /// are called in registration order.
    pub fn subscribe<F>(&self, kind: EventKind, observer: F) -> ObserverHandle
    where
        F: Fn(&DeviceEvent) + Send + Sync + 'static,
    {
        let handle = ObserverHandle::new(kind);
        self.observers
            .write()
            .entry(kind)
            .or_default()
            .push((handle, Arc::new(observer)));
        tracing::debug!("{} added", handle);
        handle
    }

    /// Remove an observer. Returns true if it was registered.
    pub fn unsubscribe(&self, handle: ObserverHandle) -> bool {
        let mut observers = self.observers.write();
        let Some(list) = observers.get_mut(&handle.kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(h, _)| *h != handle);
        let removed = list.len() != before;
        if removed {
            tracing::debug!("{} removed", handle);
        }
        removed
    }

    /// Number of observers registered for a kind
    pub fn observer_count(&self, kind: EventKind) -> usize {
        self.observers.read().get(&kind).map_or(0, Vec::len)
    }

    /// Remove every observer
    pub fn clear(&self) {
        self.observers.write().clear();
    }

    /// Call every observer registered for the event's kind.
    ///
    /// A panicking observer is logged and skipped; the remaining observers
    /// still run. Returns the number of observers that completed.
    pub fn notify(&self, event: &DeviceEvent) -> usize {
        let snapshot: Vec<Observer> = match self.observers.read().get(&event.kind()) {
            Some(list) => list.iter().map(|(_, o)| Arc::clone(o)).collect(),
            None => return 0,
        };

        let mut completed = 0;
        for observer in snapshot {
            match catch_unwind(AssertUnwindSafe(|| observer(event))) {
                Ok(()) => completed += 1,
                Err(_) => tracing::error!("Observer panicked while handling {}", event),
            }
        }
        completed
    }
}
