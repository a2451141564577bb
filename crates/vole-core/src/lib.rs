//! # vole-core
//!
//! Scope-based lifetime tracking for native-backed resources.
//!
//! Native tensor buffers are invisible to Rust's ownership of the wrapper
//! objects that point at them: a wrapper can be cloned, stored in a graph,
//! or simply forgotten, and the buffer must still be released exactly once.
//! This crate tracks every such resource created while a dispose scope is
//! open and releases whatever is still live when the scope closes.
//!
//! This crate provides:
//! - [`Disposable`] — the leaf contract of a resource owning one native handle
//! - [`Scope`] / [`ScopeStack`] — nested scopes and the per-thread stack of them
//! - [`manager`] — the calling thread's stack (register, move, close, query)
//! - [`ScopeGuard`], [`with_scope`], [`with_scope_escaping`] — scoped acquisition
//! - [`Scoped`] — cascading scope operations for single and composite resources
//! - [`ScopeStats`] / [`ThreadStats`] / [`ProcessStats`] — leak-detection counters
// - Resource: identity + disposed flag + idempotent release
// - Scope: handle to a frame (arena of live resources + parent link)
// - ScopeStack: the bookkeeping, usable as an explicit context value
// - manager: thread-local ScopeStack, the ambient entry point used by wrappers
// - guard: RAII close on every exit path

pub mod config;
pub mod error;
pub mod guard;
pub mod manager;
pub mod resource;
pub mod scope;
pub mod scoped;
pub mod stack;
pub mod stats;

pub use config::TrackerConfig;
pub use error::{Error, Result};
pub use guard::{with_scope, with_scope_escaping, ScopeGuard};
pub use resource::{Disposable, ResourceId, TrackedRef};
pub use scope::Scope;
pub use scoped::Scoped;
pub use stack::ScopeStack;
pub use stats::{process_stats, ProcessStats, ScopeStats, ThreadStats};
