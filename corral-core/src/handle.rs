//! Typed handle table, replacing raw userdata pointer passthrough.
//!
//! The original system lets worker threads share a single address space and
//! simply passes a native pointer through the wire format, invoking the
//! object's `retain()`/`release()` capability on each hop. In a memory-safe
//! target that's not an option, so this design keeps the actual object in a
//! process-wide registry indexed by an opaque
//! [`HandleId`], with an explicit manual reference count per entry — the
//! same manual `retain`/`release` protocol the original has, rather than
//! Rust's own `Arc::strong_count` (which would only count *Rust-side*
//! clones of the registry's internal `Arc`, not wire-level retains taken by
//! a codec that never keeps the clone it produces).

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// An opaque reference to an object retained in the process-wide
/// [`HandleRegistry`]. Cheap to copy; carries no lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(pub u64);

struct Entry {
    object: Arc<dyn Any + Send + Sync>,
    refcount: u64,
}

/// Process-wide table of reference-counted userdata objects.
///
/// `retain` mirrors a registered type's `retain()` capability: it bumps the
/// entry's manual refcount. `release` mirrors `release()`: it decrements the
/// count and drops the entry (and with it, the last `Arc`, freeing the
/// object) once it reaches zero — the same `THAtomicDecrementRef`-gated
/// destruction the original performs.
#[derive(Default)]
pub struct HandleRegistry {
    next_id: AtomicU64,
    objects: Mutex<HashMap<HandleId, Entry>>,
}

impl HandleRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            objects: Mutex::new(HashMap::new()),
        }
    }

    /// Registers a new object at refcount 1, returning the handle that
    /// refers to it.
    pub fn register<T: Any + Send + Sync>(&self, value: T) -> HandleId {
        let id = HandleId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.objects.lock().insert(
            id,
            Entry {
                object: Arc::new(value),
                refcount: 1,
            },
        );
        id
    }

    /// Looks up a handle without affecting its reference count.
    #[must_use]
    pub fn get(&self, id: HandleId) -> Option<Arc<dyn Any + Send + Sync>> {
        self.objects.lock().get(&id).map(|e| e.object.clone())
    }

    /// `retain()`: bumps the entry's manual refcount, keeping the object
    /// alive across a second handle reference (e.g. sent over a second
    /// channel). Returns `false` if the handle is already gone.
    pub fn retain(&self, id: HandleId) -> bool {
        match self.objects.lock().get_mut(&id) {
            Some(entry) => {
                entry.refcount += 1;
                true
            }
            None => false,
        }
    }

    /// `release()`: decrements the entry's manual refcount, removing it
    /// (and freeing the underlying `Arc`) once it reaches zero. A release
    /// of an unknown handle is a no-op.
    pub fn release(&self, id: HandleId) {
        let mut objects = self.objects.lock();
        if let Some(entry) = objects.get_mut(&id) {
            entry.refcount -= 1;
            if entry.refcount == 0 {
                objects.remove(&id);
            }
        }
    }

    #[must_use]
    pub fn strong_count(&self, id: HandleId) -> u64 {
        self.objects.lock().get(&id).map_or(0, |e| e.refcount)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_release_drops_entry() {
        let reg = HandleRegistry::new();
        let id = reg.register(42i32);
        assert!(reg.get(id).is_some());
        reg.release(id);
        assert!(reg.get(id).is_none());
    }

    #[test]
    fn unknown_handle_resolves_to_none() {
        let reg = HandleRegistry::new();
        assert!(reg.get(HandleId(999)).is_none());
    }

    #[test]
    fn retain_increments_and_release_decrements_manual_refcount() {
        let reg = HandleRegistry::new();
        let id = reg.register(7i32);
        assert_eq!(reg.strong_count(id), 1);
        assert!(reg.retain(id));
        assert_eq!(reg.strong_count(id), 2);
        reg.release(id);
        assert_eq!(reg.strong_count(id), 1);
        assert!(reg.get(id).is_some());
        reg.release(id);
        assert!(reg.get(id).is_none());
    }

    #[test]
    fn retain_on_unknown_handle_returns_false() {
        let reg = HandleRegistry::new();
        assert!(!reg.retain(HandleId(12345)));
    }
}
