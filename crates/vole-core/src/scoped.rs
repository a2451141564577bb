use crate::error::Result;
use crate::manager;
use crate::resource::{Disposable, TrackedRef};
use crate::scope::Scope;

/// The dispose-scope contract, shared by single resources and composites.
///
/// An implementor only lists the tracked allocations it is made of; every
/// operation then cascades over that list. A composite (several tensors that
/// came out of one native call, plus the native object that produced them)
/// lists its sub-resources first and its own allocation last, so cascading
/// operations finish with the composite itself.
///
/// The cascades are not transactional. If an operation fails part-way, the
/// parts already handled stay handled; that is a bug in the caller.
pub trait Scoped {
    /// Every tracked allocation of this value.
    fn tracked(&self) -> Vec<TrackedRef>;

    /// The scope owning this value's own allocation.
    fn owning_scope(&self) -> Option<Scope> {
        self.tracked().last().and_then(manager::owner_of)
    }

    /// True when every allocation has been released.
    fn is_disposed(&self) -> bool {
        self.tracked().iter().all(|r| Disposable::is_disposed(&**r))
    }

    /// Release every allocation. Disposing twice is a no-op.
    fn dispose(&self) {
        for resource in self.tracked() {
            manager::dispose(&resource);
        }
    }

    /// Promote every allocation one scope outwards. Allocations owned by the
    /// outermost scope leave the scope system.
    fn move_to_outer(&self) -> Result<()> {
        for resource in self.tracked() {
            manager::move_to_outer(&resource)?;
        }
        Ok(())
    }

    /// Move every allocation to `scope`.
    fn move_to_other(&self, scope: Scope) -> Result<()> {
        for resource in self.tracked() {
            manager::move_to_other(scope, &resource)?;
        }
        Ok(())
    }

    /// Move every allocation to the scope owning `other`, or out of the scope
    /// system if `other` is untracked.
    fn move_to_other_of<O>(&self, other: &O) -> Result<()>
    where
        O: Scoped + ?Sized,
        Self: Sized,
    {
        match other.owning_scope() {
            Some(scope) => self.move_to_other(scope),
            None => self.detach_from_scope(),
        }
    }

    /// Take every allocation out of the scope system without releasing it.
    fn detach_from_scope(&self) -> Result<()> {
        for resource in self.tracked() {
            manager::detach(&resource)?;
        }
        Ok(())
    }

    /// Give every (ownerless) allocation to `scope`.
    fn attach_to(&self, scope: Scope) -> Result<()> {
        for resource in self.tracked() {
            manager::attach(scope, &resource)?;
        }
        Ok(())
    }
}

impl Scoped for () {
    fn tracked(&self) -> Vec<TrackedRef> {
        Vec::new()
    }
}

impl<T: Scoped + ?Sized> Scoped for &T {
    fn tracked(&self) -> Vec<TrackedRef> {
        (**self).tracked()
    }
}

impl<T: Scoped> Scoped for [T] {
    fn tracked(&self) -> Vec<TrackedRef> {
        self.iter().flat_map(|item| item.tracked()).collect()
    }
}

impl<T: Scoped> Scoped for Vec<T> {
    fn tracked(&self) -> Vec<TrackedRef> {
        self.as_slice().tracked()
    }
}

impl<T: Scoped> Scoped for Option<T> {
    fn tracked(&self) -> Vec<TrackedRef> {
        self.as_ref().map(|v| v.tracked()).unwrap_or_default()
    }
}

impl<A: Scoped, B: Scoped> Scoped for (A, B) {
    fn tracked(&self) -> Vec<TrackedRef> {
        let mut all = self.0.tracked();
        all.extend(self.1.tracked());
        all
    }
}

impl<A: Scoped, B: Scoped, C: Scoped> Scoped for (A, B, C) {
    fn tracked(&self) -> Vec<TrackedRef> {
        let mut all = self.0.tracked();
        all.extend(self.1.tracked());
        all.extend(self.2.tracked());
        all
    }
}
