// Statistics — Counters for leak detection and test assertions
//
// Three levels of counters are kept:
//
//   ScopeStats   — one per scope, frozen and returned when the scope closes
//   ThreadStats  — cumulative for the calling thread's scope stack
//   ProcessStats — cumulative across every thread (atomics)
//
// Moving a resource between scopes never changes the thread or process
// totals, only the per-scope attached/detached counts. So the identities are:
//
//   scope:          created + attached == disposed + detached + live
//   thread/process: created == disposed + live

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for a single scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScopeStats {
    /// Resources registered into this scope at creation.
    pub created: u64,
    /// Resources moved into this scope from elsewhere.
    pub attached: u64,
    /// Resources moved out of this scope (promoted or detached).
    pub detached: u64,
    /// Resources disposed while owned by this scope.
    pub disposed: u64,
    /// Resources currently owned by this scope.
    pub live: usize,
}

impl ScopeStats {
    /// Resources that entered this scope, by creation or by move.
    pub fn entered(&self) -> u64 {
        self.created + self.attached
    }

    /// Resources that left this scope, by disposal or by move.
    pub fn left(&self) -> u64 {
        self.disposed + self.detached
    }

    pub fn is_consistent(&self) -> bool {
        self.entered() == self.left() + self.live as u64
    }
}

impl fmt::Display for ScopeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "created={} attached={} detached={} disposed={} live={}",
            self.created, self.attached, self.detached, self.disposed, self.live
        )
    }
}

/// Cumulative counters for one thread's scope stack.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadStats {
    /// Resources registered while some scope was open.
    pub created_in_scope: u64,
    /// Resources registered on the implicit root (no scope open).
    pub created_outside_scope: u64,
    /// Resources disposed while owned by a scope (explicitly or by its close).
    pub disposed_in_scope: u64,
    /// Resources disposed while untracked.
    pub disposed_outside_scope: u64,
    /// Moves that gave a resource a new owning scope.
    pub attached: u64,
    /// Moves that took a resource away from its owning scope.
    pub detached: u64,
    /// Resources already live when the counters were last reset.
    pub carried_over: u64,
    /// Resources currently owned by an open scope.
    pub live_in_scopes: usize,
    /// Resources currently live but untracked.
    pub live_untracked: usize,
    /// Number of open scopes.
    pub open_scopes: usize,
}

impl ThreadStats {
    pub fn created(&self) -> u64 {
        self.created_in_scope + self.created_outside_scope
    }

    pub fn disposed(&self) -> u64 {
        self.disposed_in_scope + self.disposed_outside_scope
    }

    pub fn live(&self) -> usize {
        self.live_in_scopes + self.live_untracked
    }

    /// `created == disposed + live`, counting resources carried over a reset
    /// as created.
    pub fn is_consistent(&self) -> bool {
        self.carried_over + self.created() == self.disposed() + self.live() as u64
    }
}

impl fmt::Display for ThreadStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "created={} (in scope {}, outside {}) disposed={} (in scope {}, outside {}) live={} (tracked {}, untracked {}) scopes={}",
            self.created(),
            self.created_in_scope,
            self.created_outside_scope,
            self.disposed(),
            self.disposed_in_scope,
            self.disposed_outside_scope,
            self.live(),
            self.live_in_scopes,
            self.live_untracked,
            self.open_scopes,
        )
    }
}

// Process-wide counters

static PROCESS_CREATED: AtomicU64 = AtomicU64::new(0);
static PROCESS_DISPOSED: AtomicU64 = AtomicU64::new(0);

pub(crate) fn record_created() {
    PROCESS_CREATED.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn record_disposed() {
    PROCESS_DISPOSED.fetch_add(1, Ordering::Relaxed);
}

/// Snapshot of the process-wide counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessStats {
    pub created: u64,
    pub disposed: u64,
}

impl ProcessStats {
    pub fn live(&self) -> u64 {
        self.created.saturating_sub(self.disposed)
    }
}

impl fmt::Display for ProcessStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "created={} disposed={} live={}",
            self.created,
            self.disposed,
            self.live()
        )
    }
}

/// Read the process-wide counters.
///
/// The two loads are not a single atomic snapshot; under concurrent activity
/// on other threads `disposed` can briefly run ahead of what `created` shows,
/// which `live()` clamps to zero.
pub fn process_stats() -> ProcessStats {
    let created = PROCESS_CREATED.load(Ordering::Relaxed);
    let disposed = PROCESS_DISPOSED.load(Ordering::Relaxed);
    ProcessStats { created, disposed }
}
