use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use crate::manager;
use crate::resource::{ResourceId, TrackedRef};
use crate::stats::ScopeStats;

// Scope — A region whose native resources are released together
//
// `Scope` is a small copyable handle. The scope's actual state (its arena of
// live resources, its parent link, its counters) lives in a `ScopeFrame`
// owned by the thread's `ScopeStack`. Keeping the handle separate from the
// frame means user code can hold on to a `Scope` after it closed; any later
// use of it fails cleanly with `Error::ScopeClosed` instead of touching freed
// state.
//
// Scope ids come from a global counter and are never reused, so a handle from
// one thread can never alias a scope opened on another.

/// Handle to a dispose scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Scope(u64);

impl Scope {
    pub(crate) fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Scope(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    // Convenience methods routed through the calling thread's scope stack.

    /// Close this scope, disposing everything still live in it.
    /// Fails unless this is the innermost open scope.
    pub fn close(self) -> Result<ScopeStats> {
        manager::close_scope(self)
    }

    /// True while the scope is open on the calling thread.
    pub fn is_open(self) -> bool {
        manager::is_open(self)
    }

    /// The enclosing scope, or `None` if this scope sits on the implicit root.
    pub fn parent(self) -> Result<Option<Scope>> {
        manager::parent_of(self)
    }

    /// Current counters of this scope.
    pub fn stats(self) -> Result<ScopeStats> {
        manager::scope_stats(self)
    }

    /// True if `resource` is currently owned by this scope.
    pub fn contains(self, resource: &TrackedRef) -> bool {
        manager::owner_of(resource) == Some(self)
    }

    /// Dispose every live resource in this scope without closing it.
    pub fn dispose_everything(self) -> Result<usize> {
        manager::dispose_everything(self)
    }

    /// Dispose every live resource in this scope except those in `keep`.
    pub fn dispose_everything_but(self, keep: &[TrackedRef]) -> Result<usize> {
        manager::dispose_everything_but(self, keep)
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scope#{}", self.0)
    }
}

/// State of one open scope: its parent link, its arena and its counters.
///
/// The arena is keyed by `ResourceId`, which is allocated in creation order,
/// so iterating it visits resources oldest first.
pub(crate) struct ScopeFrame {
    pub(crate) scope: Scope,
    pub(crate) parent: Option<Scope>,
    pub(crate) live: BTreeMap<ResourceId, TrackedRef>,
    pub(crate) stats: ScopeStats,
}

impl ScopeFrame {
    pub(crate) fn new(parent: Option<Scope>) -> Self {
        ScopeFrame {
            scope: Scope::next(),
            parent,
            live: BTreeMap::new(),
            stats: ScopeStats::default(),
        }
    }

    pub(crate) fn snapshot(&self) -> ScopeStats {
        ScopeStats {
            live: self.live.len(),
            ..self.stats
        }
    }
}
