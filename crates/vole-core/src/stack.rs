use std::collections::{HashMap, HashSet};

use crate::config::TrackerConfig;
use crate::error::{Error, Result};
use crate::resource::{ResourceId, TrackedRef};
use crate::scope::{Scope, ScopeFrame};
use crate::stats::{self, ScopeStats, ThreadStats};

// ScopeStack — The bookkeeping behind dispose scopes
//
// A ScopeStack is an explicit context value: it owns the chain of open scope
// frames for one thread plus an index of which scope owns which resource.
// `manager` keeps one per thread in thread-local storage, but a ScopeStack can
// also be created and driven directly, e.g. by an embedder that wants to pass
// the context around instead of relying on ambient state.
//
// OWNERSHIP MODEL:
//
//   frames:    Vec<ScopeFrame>              index 0 = outermost open scope
//   owners:    ResourceId → Scope           only for resources owned by a frame
//   untracked: {ResourceId}                 live resources on the implicit root
//
//   Every live resource this stack knows about is in exactly one of
//   `owners` or `untracked`. A resource in `owners` is in exactly one frame's
//   arena, the one its entry names. Disposed resources are in neither.
//
// Promotion is "remove from one arena, insert into another". Nothing else
// moves, and nothing is ever copied.

/// Per-thread chain of open dispose scopes and the resources they own.
pub struct ScopeStack {
    config: TrackerConfig,
    frames: Vec<ScopeFrame>,
    owners: HashMap<ResourceId, Scope>,
    untracked: HashSet<ResourceId>,
    counters: ThreadStats,
}

impl Default for ScopeStack {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

impl ScopeStack {
    pub fn new(config: TrackerConfig) -> Self {
        ScopeStack {
            config,
            frames: Vec::new(),
            owners: HashMap::new(),
            untracked: HashSet::new(),
            counters: ThreadStats::default(),
        }
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: TrackerConfig) {
        self.config = config;
    }

    // Queries

    /// The innermost open scope, or `None` on the implicit root.
    pub fn current(&self) -> Option<Scope> {
        self.frames.last().map(|f| f.scope)
    }

    /// Number of open scopes.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_open(&self, scope: Scope) -> bool {
        self.position(scope).is_some()
    }

    /// Open scopes from outermost to innermost.
    pub fn open_scopes(&self) -> Vec<Scope> {
        self.frames.iter().map(|f| f.scope).collect()
    }

    pub fn parent_of(&self, scope: Scope) -> Result<Option<Scope>> {
        Ok(self.frame(scope)?.parent)
    }

    /// The scope owning `id`, or `None` if the resource is untracked or unknown.
    pub fn owner_of(&self, id: ResourceId) -> Option<Scope> {
        self.owners.get(&id).copied()
    }

    /// True if this stack knows the resource as live (tracked or untracked).
    pub fn is_registered(&self, id: ResourceId) -> bool {
        self.owners.contains_key(&id) || self.untracked.contains(&id)
    }

    pub fn scope_stats(&self, scope: Scope) -> Result<ScopeStats> {
        Ok(self.frame(scope)?.snapshot())
    }

    /// Cumulative counters for this stack.
    pub fn stats(&self) -> ThreadStats {
        ThreadStats {
            live_in_scopes: self.owners.len(),
            live_untracked: self.untracked.len(),
            open_scopes: self.frames.len(),
            ..self.counters
        }
    }

    /// Zero the cumulative counters. Resources live right now are recorded
    /// as carried over so the counters stay consistent.
    pub fn reset_stats(&mut self) {
        self.counters = ThreadStats {
            carried_over: (self.owners.len() + self.untracked.len()) as u64,
            ..ThreadStats::default()
        };
    }

    // Registration

    /// Attach a newly created resource to the innermost open scope.
    ///
    /// Returns the owning scope, or `None` when no scope is open and the
    /// resource stays untracked on the implicit root.
    pub fn register_on_current(&mut self, resource: TrackedRef) -> Result<Option<Scope>> {
        let id = resource.resource_id();
        if resource.is_disposed() {
            return Err(Error::Disposed { resource: id });
        }
        self.ensure_unregistered(id)?;

        let owner = match self.frames.last_mut() {
            Some(frame) => {
                frame.stats.created += 1;
                frame.live.insert(id, resource.clone());
                self.owners.insert(id, frame.scope);
                self.counters.created_in_scope += 1;
                Some(frame.scope)
            }
            None => {
                if self.config.require_scope {
                    return Err(Error::NoActiveScope { resource: id });
                }
                self.untracked.insert(id);
                self.counters.created_outside_scope += 1;
                None
            }
        };
        stats::record_created();

        if self.config.trace_disposals {
            log::trace!(
                "registered {} {} on {}",
                resource.kind(),
                id,
                owner.map_or_else(|| "root".to_string(), |s| s.to_string())
            );
        }
        Ok(owner)
    }

    // Scope lifecycle

    /// Open a new scope nested in the current one.
    pub fn new_scope(&mut self) -> Scope {
        let frame = ScopeFrame::new(self.current());
        let scope = frame.scope;
        log::debug!(
            "opened {} (parent {}, depth {})",
            scope,
            frame
                .parent
                .map_or_else(|| "root".to_string(), |s| s.to_string()),
            self.frames.len() + 1
        );
        self.frames.push(frame);
        scope
    }

    /// Close the innermost scope, releasing everything still live in it in
    /// creation order. Returns the scope's final counters.
    pub fn close_scope(&mut self, scope: Scope) -> Result<ScopeStats> {
        let (stats, _released) = self.close_frame(scope)?;
        Ok(stats)
    }

    /// `close_scope`, handing back the released resources so the caller can
    /// drop them after it stops borrowing the stack.
    pub(crate) fn close_frame(&mut self, scope: Scope) -> Result<(ScopeStats, Vec<TrackedRef>)> {
        let top = match self.frames.last() {
            Some(frame) => frame.scope,
            None => return Err(Error::ScopeClosed { scope }),
        };
        if top != scope {
            if self.is_open(scope) {
                return Err(Error::OrderingViolation { scope, top });
            }
            return Err(Error::ScopeClosed { scope });
        }

        let Some(mut frame) = self.frames.pop() else {
            return Err(Error::ScopeClosed { scope });
        };
        let released = Self::release_all(
            &mut frame,
            &mut self.owners,
            &mut self.counters,
            self.config.trace_disposals,
            |_| false,
        );
        let stats = frame.snapshot();
        log::debug!("closed {} ({})", scope, stats);
        Ok((stats, released))
    }

    /// Release every live resource of an open scope without closing it.
    pub fn dispose_everything(&mut self, scope: Scope) -> Result<usize> {
        Ok(self.dispose_everything_except(scope, &[])?.len())
    }

    /// Release every live resource of an open scope except those in `keep`.
    pub fn dispose_everything_but(&mut self, scope: Scope, keep: &[TrackedRef]) -> Result<usize> {
        let keep: Vec<ResourceId> = keep.iter().map(|r| r.resource_id()).collect();
        Ok(self.dispose_everything_except(scope, &keep)?.len())
    }

    pub(crate) fn dispose_everything_except(
        &mut self,
        scope: Scope,
        keep: &[ResourceId],
    ) -> Result<Vec<TrackedRef>> {
        let index = self
            .position(scope)
            .ok_or(Error::ScopeClosed { scope })?;
        Ok(Self::release_all(
            &mut self.frames[index],
            &mut self.owners,
            &mut self.counters,
            self.config.trace_disposals,
            |id| keep.contains(&id),
        ))
    }

    fn release_all(
        frame: &mut ScopeFrame,
        owners: &mut HashMap<ResourceId, Scope>,
        counters: &mut ThreadStats,
        trace: bool,
        keep: impl Fn(ResourceId) -> bool,
    ) -> Vec<TrackedRef> {
        let doomed: Vec<ResourceId> = frame.live.keys().copied().filter(|id| !keep(*id)).collect();
        let mut released = Vec::with_capacity(doomed.len());
        for id in doomed {
            let Some(resource) = frame.live.remove(&id) else {
                continue;
            };
            owners.remove(&id);
            // A resource that released itself without reporting it is still
            // counted here, once.
            resource.release();
            frame.stats.disposed += 1;
            counters.disposed_in_scope += 1;
            stats::record_disposed();
            if trace {
                log::trace!("{} disposed {} {}", frame.scope, resource.kind(), id);
            }
            released.push(resource);
        }
        released
    }

    // Disposal notifications

    /// Forget a resource that released its own native handle.
    ///
    /// Returns `true` if the resource was live in this stack. Calling it again,
    /// or for a resource this stack never saw, does nothing.
    pub fn mark_as_disposed(&mut self, id: ResourceId) -> bool {
        self.forget_disposed(id).0
    }

    pub(crate) fn forget_disposed(&mut self, id: ResourceId) -> (bool, Option<TrackedRef>) {
        if let Some(owner) = self.owners.remove(&id) {
            let mut removed = None;
            if let Some(frame) = self.frames.iter_mut().find(|f| f.scope == owner) {
                removed = frame.live.remove(&id);
                frame.stats.disposed += 1;
            }
            self.counters.disposed_in_scope += 1;
            stats::record_disposed();
            if self.config.trace_disposals {
                log::trace!("{} marked {} disposed", owner, id);
            }
            return (true, removed);
        }
        if self.untracked.remove(&id) {
            self.counters.disposed_outside_scope += 1;
            stats::record_disposed();
            if self.config.trace_disposals {
                log::trace!("marked untracked {} disposed", id);
            }
            return (true, None);
        }
        (false, None)
    }

    /// Release a resource and forget it. Returns `true` if this call released
    /// the native handle; disposing twice is a no-op.
    pub fn dispose(&mut self, resource: &TrackedRef) -> bool {
        let released = resource.release();
        self.mark_as_disposed(resource.resource_id());
        released
    }

    // Ownership moves

    /// Move a resource from its owning scope to that scope's parent.
    ///
    /// Untracked resources are left alone. A resource owned by the outermost
    /// open scope becomes untracked. Returns the new owner.
    pub fn move_to_outer(&mut self, resource: &TrackedRef) -> Result<Option<Scope>> {
        let id = resource.resource_id();
        if resource.is_disposed() {
            return Err(Error::Disposed { resource: id });
        }
        let Some(owner) = self.owner_of(id) else {
            return Ok(None);
        };
        let parent = self.frame(owner)?.parent;
        let entry = self.take_owned(id, resource)?;
        match parent {
            Some(outer) => {
                self.insert_owned(outer, id, entry)?;
                log::trace!("moved {} from {} to {}", id, owner, outer);
            }
            None => {
                self.untracked.insert(id);
                log::trace!("moved {} from {} to root", id, owner);
            }
        }
        Ok(parent)
    }

    /// Move a resource to an arbitrary open scope. An untracked resource is
    /// attached to `target`.
    pub fn move_to_other(&mut self, target: Scope, resource: &TrackedRef) -> Result<()> {
        let id = resource.resource_id();
        if resource.is_disposed() {
            return Err(Error::Disposed { resource: id });
        }
        if !self.is_open(target) {
            return Err(Error::ScopeClosed { scope: target });
        }
        match self.owner_of(id) {
            Some(owner) if owner == target => Ok(()),
            Some(owner) => {
                let entry = self.take_owned(id, resource)?;
                self.insert_owned(target, id, entry)?;
                log::trace!("moved {} from {} to {}", id, owner, target);
                Ok(())
            }
            None => self.attach(target, resource),
        }
    }

    /// Give an ownerless resource to `scope`.
    ///
    /// A resource this stack has never seen is adopted: it counts as created
    /// on this thread and as attached to the scope.
    pub fn attach(&mut self, scope: Scope, resource: &TrackedRef) -> Result<()> {
        let id = resource.resource_id();
        if resource.is_disposed() {
            return Err(Error::Disposed { resource: id });
        }
        if let Some(owner) = self.owner_of(id) {
            return Err(Error::AlreadyRegistered {
                resource: id,
                owner: Some(owner),
            });
        }
        if !self.is_open(scope) {
            return Err(Error::ScopeClosed { scope });
        }
        if !self.untracked.remove(&id) {
            self.counters.created_in_scope += 1;
            stats::record_created();
        }
        self.insert_owned(scope, id, resource.clone())
    }

    /// Remove a resource from its owning scope without releasing it; it
    /// becomes untracked. Returns the previous owner.
    pub fn detach(&mut self, resource: &TrackedRef) -> Result<Option<Scope>> {
        let id = resource.resource_id();
        if resource.is_disposed() {
            return Err(Error::Disposed { resource: id });
        }
        let Some(owner) = self.owner_of(id) else {
            return Ok(None);
        };
        self.take_owned(id, resource)?;
        self.untracked.insert(id);
        log::trace!("detached {} from {}", id, owner);
        Ok(Some(owner))
    }

    // Internals

    fn ensure_unregistered(&self, id: ResourceId) -> Result<()> {
        if let Some(owner) = self.owner_of(id) {
            return Err(Error::AlreadyRegistered {
                resource: id,
                owner: Some(owner),
            });
        }
        if self.untracked.contains(&id) {
            return Err(Error::AlreadyRegistered {
                resource: id,
                owner: None,
            });
        }
        Ok(())
    }

    fn position(&self, scope: Scope) -> Option<usize> {
        self.frames.iter().rposition(|f| f.scope == scope)
    }

    fn frame(&self, scope: Scope) -> Result<&ScopeFrame> {
        self.frames
            .iter()
            .rev()
            .find(|f| f.scope == scope)
            .ok_or(Error::ScopeClosed { scope })
    }

    fn frame_mut(&mut self, scope: Scope) -> Result<&mut ScopeFrame> {
        self.frames
            .iter_mut()
            .rev()
            .find(|f| f.scope == scope)
            .ok_or(Error::ScopeClosed { scope })
    }

    /// Remove `id` from its owner's arena, counting it as detached there.
    fn take_owned(&mut self, id: ResourceId, resource: &TrackedRef) -> Result<TrackedRef> {
        let owner = self
            .owners
            .remove(&id)
            .ok_or_else(|| Error::msg(format!("{id} has no owning scope")))?;
        let frame = self.frame_mut(owner)?;
        let entry = frame.live.remove(&id).unwrap_or_else(|| resource.clone());
        frame.stats.detached += 1;
        self.counters.detached += 1;
        Ok(entry)
    }

    /// Insert `id` into `scope`'s arena, counting it as attached there.
    fn insert_owned(&mut self, scope: Scope, id: ResourceId, entry: TrackedRef) -> Result<()> {
        let frame = self.frame_mut(scope)?;
        frame.live.insert(id, entry);
        frame.stats.attached += 1;
        self.owners.insert(id, scope);
        self.counters.attached += 1;
        Ok(())
    }
}

impl Drop for ScopeStack {
    fn drop(&mut self) {
        if self.frames.is_empty() {
            return;
        }
        let live: usize = self.frames.iter().map(|f| f.live.len()).sum();
        log::warn!(
            "scope stack torn down with {} open scope(s) still owning {} live resource(s)",
            self.frames.len(),
            live
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Disposable;
    use std::cell::Cell;
    use std::rc::Rc;

    struct Probe {
        id: ResourceId,
        disposed: Cell<bool>,
        releases: Cell<u32>,
    }

    impl Disposable for Probe {
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
    }

    fn probe() -> (Rc<Probe>, TrackedRef) {
        let p = Rc::new(Probe {
            id: ResourceId::next(),
            disposed: Cell::new(false),
            releases: Cell::new(0),
        });
        let r: TrackedRef = p.clone();
        (p, r)
    }

    #[test]
    fn test_register_without_scope_is_untracked() {
        let mut stack = ScopeStack::default();
        let (_, r) = probe();
        assert_eq!(stack.register_on_current(r.clone()).unwrap(), None);
        assert!(stack.is_registered(r.resource_id()));
        assert_eq!(stack.owner_of(r.resource_id()), None);
        assert_eq!(stack.stats().created_outside_scope, 1);
    }

    #[test]
    fn test_require_scope_rejects_root_registration() {
        let mut stack = ScopeStack::new(TrackerConfig::default().with_require_scope(true));
        let (_, r) = probe();
        let err = stack.register_on_current(r).unwrap_err();
        assert!(matches!(err, Error::NoActiveScope { .. }));
        assert_eq!(stack.stats().created(), 0);
    }

    #[test]
    fn test_double_registration_fails() {
        let mut stack = ScopeStack::default();
        let scope = stack.new_scope();
        let (_, r) = probe();
        stack.register_on_current(r.clone()).unwrap();
        let err = stack.register_on_current(r.clone()).unwrap_err();
        assert!(matches!(err, Error::AlreadyRegistered { owner: Some(s), .. } if s == scope));
        // Still owned once
        assert_eq!(stack.scope_stats(scope).unwrap().live, 1);
    }

    #[test]
    fn test_close_releases_in_creation_order() {
        let mut stack = ScopeStack::default();
        let scope = stack.new_scope();
        let probes: Vec<_> = (0..4).map(|_| probe()).collect();
        for (_, r) in &probes {
            stack.register_on_current(r.clone()).unwrap();
        }
        let (stats, released) = stack.close_frame(scope).unwrap();
        let order: Vec<ResourceId> = released.iter().map(|r| r.resource_id()).collect();
        let expected: Vec<ResourceId> = probes.iter().map(|(p, _)| p.id).collect();
        assert_eq!(order, expected);
        assert_eq!(stats.disposed, 4);
        assert_eq!(stats.live, 0);
        assert!(probes.iter().all(|(p, _)| p.releases.get() == 1));
        assert_eq!(stack.depth(), 0);
    }

    #[test]
    fn test_close_out_of_order_is_ordering_violation() {
        let mut stack = ScopeStack::default();
        let a = stack.new_scope();
        let b = stack.new_scope();
        let err = stack.close_scope(a).unwrap_err();
        assert!(matches!(err, Error::OrderingViolation { scope, top } if scope == a && top == b));
        assert!(stack.is_open(a));
        stack.close_scope(b).unwrap();
        stack.close_scope(a).unwrap();
        assert!(matches!(
            stack.close_scope(a),
            Err(Error::ScopeClosed { .. })
        ));
    }

    #[test]
    fn test_mark_as_disposed_is_idempotent() {
        let mut stack = ScopeStack::default();
        let scope = stack.new_scope();
        let (p, r) = probe();
        stack.register_on_current(r.clone()).unwrap();
        assert!(stack.dispose(&r));
        assert!(!stack.dispose(&r));
        assert!(!stack.mark_as_disposed(p.id));
        assert_eq!(p.releases.get(), 1);
        let stats = stack.scope_stats(scope).unwrap();
        assert_eq!(stats.disposed, 1);
        assert_eq!(stats.live, 0);
    }

    #[test]
    fn test_move_to_outer_from_outermost_detaches() {
        let mut stack = ScopeStack::default();
        let outer = stack.new_scope();
        let inner = stack.new_scope();
        let (_, r) = probe();
        stack.register_on_current(r.clone()).unwrap();

        assert_eq!(stack.move_to_outer(&r).unwrap(), Some(outer));
        assert_eq!(stack.owner_of(r.resource_id()), Some(outer));
        stack.close_scope(inner).unwrap();
        assert!(!r.is_disposed());

        assert_eq!(stack.move_to_outer(&r).unwrap(), None);
        assert_eq!(stack.owner_of(r.resource_id()), None);
        assert!(stack.is_registered(r.resource_id()));
        stack.close_scope(outer).unwrap();
        assert!(!r.is_disposed());

        // Already on the root: nothing to do.
        assert_eq!(stack.move_to_outer(&r).unwrap(), None);
    }

    #[test]
    fn test_move_disposed_resource_fails() {
        let mut stack = ScopeStack::default();
        let _scope = stack.new_scope();
        let (_, r) = probe();
        stack.register_on_current(r.clone()).unwrap();
        stack.dispose(&r);
        assert!(matches!(stack.move_to_outer(&r), Err(Error::Disposed { .. })));
        assert!(matches!(stack.detach(&r), Err(Error::Disposed { .. })));
    }

    #[test]
    fn test_move_to_other_skips_levels() {
        let mut stack = ScopeStack::default();
        let grandparent = stack.new_scope();
        let _parent = stack.new_scope();
        let _child = stack.new_scope();
        let (_, r) = probe();
        stack.register_on_current(r.clone()).unwrap();
        stack.move_to_other(grandparent, &r).unwrap();
        assert_eq!(stack.owner_of(r.resource_id()), Some(grandparent));
        let gp = stack.scope_stats(grandparent).unwrap();
        assert_eq!(gp.attached, 1);
        assert!(gp.is_consistent());
    }

    #[test]
    fn test_attach_and_detach() {
        let mut stack = ScopeStack::default();
        let (_, r) = probe();
        stack.register_on_current(r.clone()).unwrap();
        let scope = stack.new_scope();
        stack.attach(scope, &r).unwrap();
        assert!(matches!(
            stack.attach(scope, &r),
            Err(Error::AlreadyRegistered { .. })
        ));
        assert_eq!(stack.detach(&r).unwrap(), Some(scope));
        assert_eq!(stack.detach(&r).unwrap(), None);
        stack.close_scope(scope).unwrap();
        assert!(!r.is_disposed());
        assert!(stack.stats().is_consistent());
    }

    #[test]
    fn test_dispose_everything_but_keeps_listed() {
        let mut stack = ScopeStack::default();
        let scope = stack.new_scope();
        let (_, a) = probe();
        let (_, b) = probe();
        let (_, c) = probe();
        for r in [&a, &b, &c] {
            stack.register_on_current(r.clone()).unwrap();
        }
        assert_eq!(stack.dispose_everything_but(scope, &[b.clone()]).unwrap(), 2);
        assert!(a.is_disposed() && c.is_disposed());
        assert!(!b.is_disposed());
        assert!(stack.is_open(scope));
        assert_eq!(stack.scope_stats(scope).unwrap().live, 1);
    }

    #[test]
    fn test_reset_stats_carries_live_resources() {
        let mut stack = ScopeStack::default();
        let (_, r) = probe();
        stack.register_on_current(r.clone()).unwrap();
        stack.reset_stats();
        let stats = stack.stats();
        assert_eq!(stats.carried_over, 1);
        assert!(stats.is_consistent());
        stack.dispose(&r);
        assert!(stack.stats().is_consistent());
    }
}
