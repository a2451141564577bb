use crate::resource::ResourceId;
use crate::scope::Scope;

/// All errors that can occur within Vole.
///
/// Tracker misuse (ordering violations, double registration, stale handles)
/// and native-library failures share one enum so that a scoped computation
/// can propagate any of them with `?`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Tried to close a scope that is not the innermost open scope of this thread.
    #[error("scope ordering violation: cannot close {scope} while {top} is the innermost open scope")]
    OrderingViolation { scope: Scope, top: Scope },

    /// A resource was registered while the tracker already knows about it.
    #[error("resource {resource} is already registered (owner: {})", fmt_owner(.owner))]
    AlreadyRegistered {
        resource: ResourceId,
        owner: Option<Scope>,
    },

    /// The resource's native handle has been released.
    #[error("resource {resource} has already been disposed")]
    Disposed { resource: ResourceId },

    /// The scope is closed, or was never opened on this thread.
    #[error("scope {scope} is not open on this thread")]
    ScopeClosed { scope: Scope },

    /// A resource was created with no open scope while `require_scope` is set.
    #[error("resource {resource} created outside of any dispose scope")]
    NoActiveScope { resource: ResourceId },

    /// The native library does not know this handle.
    #[error("invalid native handle {0:#x}")]
    InvalidHandle(u64),

    /// Operand shapes do not agree.
    #[error("shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch { expected: Vec<usize>, got: Vec<usize> },

    /// Element count mismatch when creating from a slice.
    #[error("element count mismatch: shape {shape:?} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Vec<usize>,
        expected: usize,
        got: usize,
    },

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

fn fmt_owner(owner: &Option<Scope>) -> String {
    match owner {
        Some(scope) => scope.to_string(),
        None => "untracked".to_string(),
    }
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    /// True for the errors that indicate a structural bug in the caller
    /// rather than a data problem.
    pub fn is_misuse(&self) -> bool {
        matches!(
            self,
            Error::OrderingViolation { .. }
                | Error::AlreadyRegistered { .. }
                | Error::Disposed { .. }
                | Error::ScopeClosed { .. }
        )
    }
}

/// Convenience Result type used throughout Vole.
pub type Result<T> = std::result::Result<T, Error>;

/// Early return with a formatted error message.
/// Usage: `bail!("cannot pack {} sequences", n)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
