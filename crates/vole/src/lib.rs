//! # Vole
//!
//! Deterministic release of native tensor memory through nested dispose
//! scopes.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust
//! use vole::prelude::*;
//!
//! let lib = NativeLib::new();
//! let y = with_scope(|_| {
//!     let x = Tensor::randn(&[4, 4], &lib)?;
//!     let y = x.matmul(&x)?.relu()?;   // x@x is released on close
//!     y.move_to_outer()?;
//!     Ok::<_, Error>(y)
//! })
//! .unwrap();
//! assert!(!y.is_disposed());
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `vole-core` | Scope stack, thread-local manager, guards, `Scoped` cascade, counters |
//! | `vole-native` | Native handle table, `Tensor`, `PackedSequence` |
//!
//! ## Modules
//!
//! - [`diagnostics`] — Tracker reports and leak checks

/// Re-export core types.
pub use vole_core::{
    bail, manager, process_stats, with_scope, with_scope_escaping, Disposable, Error,
    ProcessStats, ResourceId, Result, Scope, ScopeGuard, ScopeStack, ScopeStats, Scoped,
    ThreadStats, TrackedRef, TrackerConfig,
};

/// Re-export native tensors.
pub use vole_native::{pack_sequence, LibStats, NativeHandle, NativeLib, PackedSequence, Tensor};

/// Diagnostics — tracker reports, leak checks.
pub mod diagnostics;

/// Prelude: import this for the most common types.
pub mod prelude {
    pub use crate::diagnostics::{format_bytes, LeakCheck, LeakSummary, TrackerReport};
    pub use crate::{
        manager, pack_sequence, with_scope, with_scope_escaping, Error, NativeLib,
        PackedSequence, Result, Scope, ScopeGuard, Scoped, Tensor, TrackerConfig,
    };
}
