//! Shared-state aliases used across the workspace.
//!
//! Built on `parking_lot`, whose locks never poison.

use parking_lot::RwLock;
use std::sync::Arc;

/// Read-mostly state that is replaced as a whole, e.g. the active bus
/// client of the bridge.
pub type ThreadSafeRw<T> = Arc<RwLock<T>>;

/// Create a new `ThreadSafeRw<T>`
#[inline]
pub fn thread_safe_rw<T>(value: T) -> ThreadSafeRw<T> {
    Arc::new(RwLock::new(value))
}
