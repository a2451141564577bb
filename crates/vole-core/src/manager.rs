// Manager — The calling thread's scope stack
//
// Every thread lazily gets its own ScopeStack, created from
// `TrackerConfig::from_env()` on first use. The functions in this module are
// thin wrappers that borrow that stack for the duration of one bookkeeping
// operation.
//
// RE-ENTRANCY:
//
//   Releasing a native handle never calls back into the manager, but dropping
//   the last `Rc` of a resource may (a wrapper that was never disposed
//   releases itself on drop and reports it). So whenever an operation removes
//   resources from an arena, the removed `Rc`s are handed out of the borrow
//   and dropped only after the stack is released.
//
// Scopes and resources belong to the thread that created them. Handing a
// resource to another thread crosses an ownership boundary this module does
// not arbitrate; there it is simply unknown.

use std::cell::RefCell;

use crate::config::TrackerConfig;
use crate::error::Result;
use crate::resource::{ResourceId, TrackedRef};
use crate::scope::Scope;
use crate::stack::ScopeStack;
use crate::stats::{ScopeStats, ThreadStats};

thread_local! {
    static STACK: RefCell<ScopeStack> = RefCell::new(ScopeStack::new(TrackerConfig::from_env()));
}

/// Run `f` with the calling thread's scope stack.
///
/// `f` must not call other functions of this module.
pub fn with_stack<R>(f: impl FnOnce(&mut ScopeStack) -> R) -> R {
    STACK.with(|stack| f(&mut stack.borrow_mut()))
}

/// Replace the calling thread's configuration.
pub fn configure(config: TrackerConfig) {
    with_stack(|s| s.set_config(config));
}

pub fn config() -> TrackerConfig {
    with_stack(|s| *s.config())
}

// Queries

/// Innermost open scope of the calling thread.
pub fn current_scope() -> Option<Scope> {
    with_stack(|s| s.current())
}

/// Number of open scopes on the calling thread.
pub fn depth() -> usize {
    with_stack(|s| s.depth())
}

pub fn is_open(scope: Scope) -> bool {
    with_stack(|s| s.is_open(scope))
}

pub fn parent_of(scope: Scope) -> Result<Option<Scope>> {
    with_stack(|s| s.parent_of(scope))
}

pub fn owner_of(resource: &TrackedRef) -> Option<Scope> {
    owner_of_id(resource.resource_id())
}

pub fn owner_of_id(id: ResourceId) -> Option<Scope> {
    with_stack(|s| s.owner_of(id))
}

pub fn scope_stats(scope: Scope) -> Result<ScopeStats> {
    with_stack(|s| s.scope_stats(scope))
}

/// Open scopes from outermost to innermost with their current counters.
pub fn open_scopes() -> Vec<(Scope, ScopeStats)> {
    with_stack(|s| {
        s.open_scopes()
            .into_iter()
            .filter_map(|scope| s.scope_stats(scope).ok().map(|stats| (scope, stats)))
            .collect()
    })
}

/// Cumulative counters of the calling thread.
pub fn stats() -> ThreadStats {
    with_stack(|s| s.stats())
}

pub fn reset_stats() {
    with_stack(|s| s.reset_stats());
}

// Registration and disposal

/// Register a newly created resource with the innermost open scope.
pub fn register_on_current(resource: TrackedRef) -> Result<Option<Scope>> {
    with_stack(|s| s.register_on_current(resource))
}

/// Forget a resource that released its own handle. Idempotent.
pub fn mark_as_disposed(id: ResourceId) -> bool {
    let (known, _removed) = with_stack(|s| s.forget_disposed(id));
    known
}

/// Release a resource and forget it. Returns `true` if this call released it.
pub fn dispose(resource: &TrackedRef) -> bool {
    let released = resource.release();
    mark_as_disposed(resource.resource_id());
    released
}

/// Bookkeeping for a resource released from its own `Drop`.
///
/// Silently skipped when the stack is unavailable: during thread teardown, or
/// when the drop happens inside another bookkeeping operation.
pub fn notify_dropped(id: ResourceId) {
    let _ = STACK.try_with(|stack| {
        if let Ok(mut stack) = stack.try_borrow_mut() {
            stack.mark_as_disposed(id);
        } else {
            log::warn!("{} dropped while the scope stack was busy; not counted", id);
        }
    });
}

// Scope lifecycle

/// Open a new scope nested in the current one.
pub fn new_scope() -> Scope {
    with_stack(|s| s.new_scope())
}

/// Close the innermost scope, disposing everything still live in it.
pub fn close_scope(scope: Scope) -> Result<ScopeStats> {
    let (stats, released) = with_stack(|s| s.close_frame(scope))?;
    drop(released);
    Ok(stats)
}

/// Close `scope`, first closing any scopes still open inside it when the
/// thread's configuration allows it.
pub(crate) fn close_unwinding(scope: Scope) -> Result<ScopeStats> {
    if config().unwind_nested {
        while let Some(top) = current_scope() {
            if top == scope || !is_open(scope) {
                break;
            }
            log::warn!("closing {} left open inside {}", top, scope);
            close_scope(top)?;
        }
    }
    close_scope(scope)
}

/// Dispose every live resource of `scope` without closing it.
pub fn dispose_everything(scope: Scope) -> Result<usize> {
    let released = with_stack(|s| s.dispose_everything_except(scope, &[]))?;
    Ok(released.len())
}

/// Dispose every live resource of `scope` except those in `keep`.
pub fn dispose_everything_but(scope: Scope, keep: &[TrackedRef]) -> Result<usize> {
    let keep: Vec<ResourceId> = keep.iter().map(|r| r.resource_id()).collect();
    let released = with_stack(|s| s.dispose_everything_except(scope, &keep))?;
    Ok(released.len())
}

// Ownership moves

/// Move `resource` to the parent of its owning scope. See [`ScopeStack::move_to_outer`].
pub fn move_to_outer(resource: &TrackedRef) -> Result<Option<Scope>> {
    with_stack(|s| s.move_to_outer(resource))
}

/// Move `resource` to `target`, wherever it sits on the stack.
pub fn move_to_other(target: Scope, resource: &TrackedRef) -> Result<()> {
    with_stack(|s| s.move_to_other(target, resource))
}

/// Give an ownerless resource to `scope`.
pub fn attach(scope: Scope, resource: &TrackedRef) -> Result<()> {
    with_stack(|s| s.attach(scope, resource))
}

/// Take `resource` out of the scope system without releasing it.
pub fn detach(resource: &TrackedRef) -> Result<Option<Scope>> {
    with_stack(|s| s.detach(resource))
}
