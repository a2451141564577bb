use std::marker::PhantomData;

use crate::error::{Error, Result};
use crate::manager;
use crate::scope::Scope;
use crate::scoped::Scoped;
use crate::stats::ScopeStats;

// Scoped acquisition
//
// ScopeGuard opens a scope on construction and closes it when dropped, so the
// close runs on every exit path: normal return, early `?` return, and panic
// unwinding. `with_scope` and `with_scope_escaping` are the closure-shaped
// front ends most code should use.
//
// ERRORS:
//
//   An error returned by the body always wins. The scope is closed first; if
//   closing fails too, that failure is logged and the body's error is
//   returned untouched. On the success path a close failure is returned.

/// RAII handle for one dispose scope.
///
/// The guard is tied to the thread that opened it.
#[must_use = "the scope is closed as soon as the guard is dropped"]
pub struct ScopeGuard {
    scope: Scope,
    closed: bool,
    _thread: PhantomData<*const ()>,
}

impl ScopeGuard {
    /// Open a new scope nested in the calling thread's current one.
    pub fn new() -> Self {
        ScopeGuard {
            scope: manager::new_scope(),
            closed: false,
            _thread: PhantomData,
        }
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Promote the parts of `value` owned by this scope to its parent.
    ///
    /// Parts owned elsewhere (an outer scope, or nobody) are left where they
    /// are, so returning an input unchanged never moves it further out.
    pub fn keep<T: Scoped + ?Sized>(&self, value: &T) -> Result<()> {
        for resource in value.tracked() {
            if manager::owner_of(&resource) == Some(self.scope) {
                manager::move_to_outer(&resource)?;
            }
        }
        Ok(())
    }

    /// Close the scope now, disposing everything still live in it.
    pub fn close(mut self) -> Result<ScopeStats> {
        self.closed = true;
        manager::close_unwinding(self.scope)
    }
}

impl Default for ScopeGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = manager::close_unwinding(self.scope) {
            log::error!("failed to close {} on drop: {}", self.scope, e);
        }
    }
}

impl std::fmt::Debug for ScopeGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeGuard")
            .field("scope", &self.scope)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Run `body` inside a fresh scope and close the scope afterwards.
///
/// Anything created inside and not promoted (with
/// [`Scoped::move_to_outer`] / [`Scoped::move_to_other`]) is disposed when
/// `body` returns, fails or panics. The body's result is returned unchanged.
///
/// # Example
/// ```ignore
/// let total = with_scope(|_| {
///     let a = Tensor::ones(&[3], &lib)?;
///     let b = a.mul_scalar(2.0)?;   // intermediate, disposed on close
///     let sum = b.add(&a)?;
///     sum.move_to_outer()?;         // survives
///     Ok::<_, vole_core::Error>(sum)
/// })?;
/// ```
pub fn with_scope<T, E, F>(body: F) -> std::result::Result<T, E>
where
    F: FnOnce(Scope) -> std::result::Result<T, E>,
    E: From<Error>,
{
    let guard = ScopeGuard::new();
    let outcome = body(guard.scope());
    finish(guard, outcome)
}

/// Like [`with_scope`], but the body's returned value escapes: whatever part
/// of it this scope owns is promoted to the enclosing scope before closing.
pub fn with_scope_escaping<T, E, F>(body: F) -> std::result::Result<T, E>
where
    T: Scoped,
    F: FnOnce(Scope) -> std::result::Result<T, E>,
    E: From<Error>,
{
    let guard = ScopeGuard::new();
    let outcome = body(guard.scope()).and_then(|value| {
        guard.keep(&value)?;
        Ok(value)
    });
    finish(guard, outcome)
}

fn finish<T, E>(guard: ScopeGuard, outcome: std::result::Result<T, E>) -> std::result::Result<T, E>
where
    E: From<Error>,
{
    let scope = guard.scope();
    match outcome {
        Ok(value) => {
            guard.close()?;
            Ok(value)
        }
        Err(err) => {
            if let Err(cleanup) = guard.close() {
                log::error!("{} could not be closed after its body failed: {}", scope, cleanup);
            }
            Err(err)
        }
    }
}
