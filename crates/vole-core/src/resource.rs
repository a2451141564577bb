use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

// Trackable resources
//
// A trackable resource is any object that owns exactly one native allocation
// which automatic memory management will never reclaim. The tracker does not
// know what the allocation is; it only needs three things from the object:
//
//   1. a stable identity (ResourceId) to key its bookkeeping on
//   2. whether the allocation has already been released
//   3. a way to release the allocation, at most once
//
// The tracker keeps resources as `Rc<dyn Disposable>` in per-scope arenas, so
// a resource stays reachable by the scope that owns it even after every user
// handle to it has been dropped. That is what lets a closing scope release
// intermediates nobody holds anymore.

/// Process-unique identity of a trackable resource.
///
/// Ids are handed out by a global monotonic counter, so ordering by id is
/// ordering by creation time. Scopes dispose in that order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl ResourceId {
    /// Allocate a fresh id.
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        ResourceId(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for ResourceId {
    fn default() -> Self {
        Self::next()
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "resource#{}", self.0)
    }
}

/// An object wrapping one native allocation that must be released exactly once.
///
/// Implementations must make [`release`](Disposable::release) idempotent: the
/// first call frees the native handle and flips the disposed flag, every later
/// call returns `false` and does nothing. `release` must not call back into the
/// scope manager; the manager does its own bookkeeping around it.
pub trait Disposable {
    /// Identity used by the tracker.
    fn resource_id(&self) -> ResourceId;

    /// True once the native handle has been released.
    fn is_disposed(&self) -> bool;

    /// Release the native handle. Returns `true` if this call released it.
    fn release(&self) -> bool;

    /// Short type name used in log lines.
    fn kind(&self) -> &'static str {
        "resource"
    }
}

/// Shared reference to a trackable resource, as stored in scope arenas.
pub type TrackedRef = Rc<dyn Disposable>;
