// Tests for the thread-local manager, guards and the Scoped cascade.
//
// Every test runs on its own thread, so each starts from a fresh scope stack.

use std::cell::Cell;
use std::rc::Rc;

use vole_core::{
    manager, with_scope, with_scope_escaping, Disposable, Error, ResourceId, Scope, ScopeGuard,
    Scoped, TrackedRef, TrackerConfig,
};

// Minimal trackable resource

struct Buffer {
    id: ResourceId,
    disposed: Cell<bool>,
    releases: Cell<u32>,
}

impl Disposable for Buffer {
    fn resource_id(&self) -> ResourceId {
        self.id
    }
    fn is_disposed(&self) -> bool {
        self.disposed.get()
    }
    fn release(&self) -> bool {
        if self.disposed.replace(true) {
            return false;
        }
        self.releases.set(self.releases.get() + 1);
        true
    }
    fn kind(&self) -> &'static str {
        "buffer"
    }
}

/// User-facing handle, registered on creation like a real wrapper.
#[derive(Clone)]
struct Handle(Rc<Buffer>);

impl Handle {
    fn new() -> Self {
        let buffer = Rc::new(Buffer {
            id: ResourceId::next(),
            disposed: Cell::new(false),
            releases: Cell::new(0),
        });
        manager::register_on_current(buffer.clone()).expect("register");
        Handle(buffer)
    }

    fn releases(&self) -> u32 {
        self.0.releases.get()
    }
}

impl Scoped for Handle {
    fn tracked(&self) -> Vec<TrackedRef> {
        vec![self.0.clone()]
    }
}

/// Two handles plus one of its own, like a packed result.
struct Bundle {
    left: Handle,
    right: Handle,
    own: Handle,
}

impl Bundle {
    fn new() -> Self {
        Bundle {
            left: Handle::new(),
            right: Handle::new(),
            own: Handle::new(),
        }
    }
}

impl Scoped for Bundle {
    fn tracked(&self) -> Vec<TrackedRef> {
        let mut all = self.left.tracked();
        all.extend(self.right.tracked());
        all.extend(self.own.tracked());
        all
    }
}

// Basic routing

#[test]
fn test_registration_routes_to_innermost_scope() {
    let outer = manager::new_scope();
    let a = Handle::new();
    let inner = manager::new_scope();
    let b = Handle::new();
    assert_eq!(a.owning_scope(), Some(outer));
    assert_eq!(b.owning_scope(), Some(inner));
    assert_eq!(inner.parent().unwrap(), Some(outer));
    assert_eq!(outer.parent().unwrap(), None);
    manager::close_scope(inner).unwrap();
    manager::close_scope(outer).unwrap();
    assert!(a.is_disposed() && b.is_disposed());
}

#[test]
fn test_created_outside_scope_is_untracked() {
    manager::reset_stats();
    let h = Handle::new();
    assert_eq!(h.owning_scope(), None);
    let stats = manager::stats();
    assert_eq!(stats.created_outside_scope, 1);
    assert_eq!(stats.live_untracked, 1);
    h.dispose();
    assert_eq!(manager::stats().disposed_outside_scope, 1);
    assert!(manager::stats().is_consistent());
}

// Property: no double free

#[test]
fn test_dispose_twice_releases_once() {
    let scope = manager::new_scope();
    let h = Handle::new();
    h.dispose();
    let after_first = manager::scope_stats(scope).unwrap();
    h.dispose();
    assert_eq!(h.releases(), 1);
    assert_eq!(manager::scope_stats(scope).unwrap(), after_first);
    let closed = scope.close().unwrap();
    assert_eq!(closed.disposed, 1);
    assert_eq!(h.releases(), 1);
}

// Property: closing disposes everything not promoted

#[test]
fn test_close_disposes_all_but_promoted() {
    let outer = manager::new_scope();
    let inner = manager::new_scope();
    let handles: Vec<Handle> = (0..6).map(|_| Handle::new()).collect();
    handles[1].move_to_outer().unwrap();
    handles[4].move_to_other(outer).unwrap();

    let stats = inner.close().unwrap();
    assert_eq!(stats.created, 6);
    assert_eq!(stats.detached, 2);
    assert_eq!(stats.disposed, 4);
    assert_eq!(stats.live, 0);
    assert!(stats.is_consistent());

    for (i, h) in handles.iter().enumerate() {
        let promoted = i == 1 || i == 4;
        assert_eq!(h.is_disposed(), !promoted, "handle {i}");
        if promoted {
            assert_eq!(h.owning_scope(), Some(outer));
        }
    }
    assert_eq!(outer.stats().unwrap().live, 2);
    outer.close().unwrap();
    assert!(handles.iter().all(|h| h.is_disposed()));
}

// Property: LIFO enforcement

#[test]
fn test_lifo_enforced() {
    let a = manager::new_scope();
    let b = manager::new_scope();
    match manager::close_scope(a) {
        Err(Error::OrderingViolation { scope, top }) => {
            assert_eq!(scope, a);
            assert_eq!(top, b);
        }
        other => panic!("expected ordering violation, got {other:?}"),
    }
    assert!(a.is_open() && b.is_open());
    b.close().unwrap();
    a.close().unwrap();
    assert_eq!(manager::depth(), 0);
}

#[test]
fn test_closed_scope_rejects_use() {
    let scope = manager::new_scope();
    scope.close().unwrap();
    assert!(!scope.is_open());
    assert!(matches!(scope.stats(), Err(Error::ScopeClosed { .. })));
    let h = Handle::new();
    assert!(matches!(
        h.move_to_other(scope),
        Err(Error::ScopeClosed { .. })
    ));
    h.dispose();
}

// Property: promotion preserves liveness across nested helpers

#[test]
fn test_promotion_survives_nested_helper() {
    let result = with_scope(|outer| {
        let kept = with_scope(|_| {
            let scratch = Handle::new();
            let kept = Handle::new();
            kept.move_to_outer()?;
            assert!(!scratch.is_disposed());
            Ok::<_, Error>((scratch, kept))
        })?;
        let (scratch, kept) = kept;
        assert!(scratch.is_disposed());
        assert!(!kept.is_disposed());
        assert_eq!(kept.owning_scope(), Some(outer));
        Ok::<_, Error>(kept)
    })
    .unwrap();
    // The outer helper did not promote it, so it is gone now.
    assert!(result.is_disposed());
}

#[test]
fn test_with_scope_escaping_promotes_result() {
    let outer = ScopeGuard::new();
    let (kept, bundle) = with_scope_escaping(|_| {
        let _scratch = Handle::new();
        Ok::<_, Error>((Handle::new(), Bundle::new()))
    })
    .unwrap();
    assert!(!kept.is_disposed());
    assert!(!bundle.is_disposed());
    assert_eq!(kept.owning_scope(), Some(outer.scope()));
    assert_eq!(bundle.left.owning_scope(), Some(outer.scope()));
    let stats = outer.close().unwrap();
    assert_eq!(stats.attached, 4);
    assert_eq!(stats.disposed, 4);
}

#[test]
fn test_escaping_does_not_promote_outer_inputs() {
    let outer = manager::new_scope();
    let input = Handle::new();
    let returned = with_scope_escaping(|_| Ok::<_, Error>(input.clone())).unwrap();
    assert_eq!(returned.owning_scope(), Some(outer));
    outer.close().unwrap();
    assert!(input.is_disposed());
}

// Property: error path still cleans up

#[derive(Debug)]
enum TrainError {
    Diverged,
    #[allow(dead_code)]
    Tracker(Error),
}

impl From<Error> for TrainError {
    fn from(e: Error) -> Self {
        TrainError::Tracker(e)
    }
}

#[test]
fn test_error_in_body_propagates_after_cleanup() {
    let mut created = Vec::new();
    let outcome: Result<(), TrainError> = with_scope(|_| {
        for step in 0..5 {
            created.push(Handle::new());
            if step == 2 {
                return Err(TrainError::Diverged);
            }
        }
        Ok(())
    });
    assert!(matches!(outcome, Err(TrainError::Diverged)));
    assert_eq!(created.len(), 3);
    assert!(created.iter().all(|h| h.is_disposed()));
    assert_eq!(manager::depth(), 0);
}

fn explode() -> Result<(), Error> {
    panic!("kernel blew up")
}

#[test]
fn test_panic_in_body_still_cleans_up() {
    let survivor = Rc::new(std::cell::RefCell::new(Vec::<Handle>::new()));
    let collected = survivor.clone();
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        with_scope(|_| {
            collected.borrow_mut().push(Handle::new());
            collected.borrow_mut().push(Handle::new());
            explode()?;
            Ok::<(), Error>(())
        })
    }));
    assert!(outcome.is_err());
    assert!(survivor.borrow().iter().all(|h| h.is_disposed()));
    assert_eq!(manager::depth(), 0);
}

// Guard behavior

#[test]
fn test_guard_unwinds_nested_scopes() {
    let guard = ScopeGuard::new();
    let leaked = manager::new_scope();
    let h = Handle::new();
    assert_eq!(h.owning_scope(), Some(leaked));
    guard.close().unwrap();
    assert!(!leaked.is_open());
    assert!(h.is_disposed());
}

#[test]
fn test_guard_reports_nested_scope_without_unwinding() {
    manager::configure(TrackerConfig::default().with_unwind_nested(false));
    let guard = ScopeGuard::new();
    let outer = guard.scope();
    let leaked = manager::new_scope();
    assert!(matches!(
        guard.close(),
        Err(Error::OrderingViolation { .. })
    ));
    // Nothing was reordered: both scopes are still open.
    assert!(leaked.is_open() && outer.is_open());
    leaked.close().unwrap();
    outer.close().unwrap();
    manager::configure(TrackerConfig::default());
}

#[test]
fn test_guard_drop_closes_scope() {
    let scope;
    let h;
    {
        let guard = ScopeGuard::new();
        scope = guard.scope();
        h = Handle::new();
    }
    assert!(!scope.is_open());
    assert!(h.is_disposed());
}

// Untracked resources, attach and detach

#[test]
fn test_untracked_resource_moves_are_explicit() {
    let root = Handle::new();
    // Promoting an untracked resource is a no-op.
    root.move_to_outer().unwrap();
    assert_eq!(root.owning_scope(), None);

    let scope = manager::new_scope();
    // Moving it to a scope attaches it.
    root.move_to_other(scope).unwrap();
    assert_eq!(root.owning_scope(), Some(scope));

    // Detaching hands it back to the caller.
    root.detach_from_scope().unwrap();
    scope.close().unwrap();
    assert!(!root.is_disposed());

    // Disposing an untracked resource works and is counted once.
    root.dispose();
    root.dispose();
    assert_eq!(root.releases(), 1);
}

#[test]
fn test_attach_requires_no_owner() {
    let a = manager::new_scope();
    let h = Handle::new();
    assert!(matches!(h.attach_to(a), Err(Error::AlreadyRegistered { .. })));
    h.detach_from_scope().unwrap();
    h.attach_to(a).unwrap();
    assert_eq!(h.owning_scope(), Some(a));
    a.close().unwrap();
    assert!(h.is_disposed());
}

#[test]
fn test_moving_disposed_resource_is_error() {
    let _scope = ScopeGuard::new();
    let h = Handle::new();
    h.dispose();
    assert!(matches!(h.move_to_outer(), Err(Error::Disposed { .. })));
    assert!(matches!(h.detach_from_scope(), Err(Error::Disposed { .. })));
    assert_eq!(h.owning_scope(), None);
}

#[test]
fn test_double_registration_fails_loudly() {
    let _scope = ScopeGuard::new();
    let h = Handle::new();
    let err = manager::register_on_current(h.0.clone()).unwrap_err();
    assert!(err.is_misuse());
    assert!(matches!(err, Error::AlreadyRegistered { .. }));
}

#[test]
fn test_require_scope_config() {
    manager::configure(TrackerConfig::default().with_require_scope(true));
    let buffer = Rc::new(Buffer {
        id: ResourceId::next(),
        disposed: Cell::new(false),
        releases: Cell::new(0),
    });
    let err = manager::register_on_current(buffer).unwrap_err();
    assert!(matches!(err, Error::NoActiveScope { .. }));
    manager::configure(TrackerConfig::default());
}

// Composite cascade

#[test]
fn test_bundle_cascades_every_part() {
    let outer = manager::new_scope();
    let inner = manager::new_scope();
    let bundle = Bundle::new();
    bundle.move_to_outer().unwrap();
    for part in [&bundle.left, &bundle.right, &bundle.own] {
        assert_eq!(part.owning_scope(), Some(outer));
    }
    inner.close().unwrap();
    assert!(!bundle.is_disposed());
    bundle.dispose();
    assert!(bundle.is_disposed());
    assert_eq!(outer.stats().unwrap().live, 0);
    outer.close().unwrap();
}

#[test]
fn test_move_to_other_of_follows_target_owner() {
    let outer = manager::new_scope();
    let anchor = Handle::new();
    let inner = manager::new_scope();
    let bundle = Bundle::new();
    bundle.move_to_other_of(&anchor).unwrap();
    assert_eq!(bundle.owning_scope(), Some(outer));
    inner.close().unwrap();

    let untracked = {
        let h = Handle::new();
        h.detach_from_scope().unwrap();
        h
    };
    bundle.move_to_other_of(&untracked).unwrap();
    assert_eq!(bundle.owning_scope(), None);
    outer.close().unwrap();
    assert!(!bundle.is_disposed());
    bundle.dispose();
    untracked.dispose();
}

// Extended scope operations

#[test]
fn test_dispose_everything_keeps_scope_open() {
    let scope = ScopeGuard::new();
    let a = Handle::new();
    let b = Handle::new();
    let c = Handle::new();
    assert_eq!(scope.scope().dispose_everything_but(&b.tracked()).unwrap(), 2);
    assert!(a.is_disposed() && c.is_disposed() && !b.is_disposed());
    assert!(scope.scope().is_open());
    assert_eq!(scope.scope().dispose_everything().unwrap(), 1);
    assert!(b.is_disposed());
    let d = Handle::new();
    assert_eq!(d.owning_scope(), Some(scope.scope()));
}

#[test]
fn test_open_scopes_listing() {
    let a: Scope = manager::new_scope();
    let _h = Handle::new();
    let b = manager::new_scope();
    let listed = manager::open_scopes();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].0, a);
    assert_eq!(listed[0].1.live, 1);
    assert_eq!(listed[1].0, b);
    b.close().unwrap();
    a.close().unwrap();
}
