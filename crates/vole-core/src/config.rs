use std::env;
use std::sync::OnceLock;

/// Behavior switches for a thread's scope stack.
///
/// Each thread starts from [`TrackerConfig::from_env`]; use
/// [`manager::configure`](crate::manager::configure) to replace it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerConfig {
    /// Fail registration with `NoActiveScope` when no scope is open, instead of
    /// leaving the resource untracked.
    pub require_scope: bool,
    /// When a guard closes its scope, first close nested scopes that were left
    /// open inside it. When false the ordering violation is reported instead.
    pub unwind_nested: bool,
    /// Emit a `trace!` line for every registration and disposal.
    pub trace_disposals: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            require_scope: false,
            unwind_nested: true,
            trace_disposals: false,
        }
    }
}

impl TrackerConfig {
    /// Defaults, overridden by `VOLE_REQUIRE_SCOPE`, `VOLE_UNWIND_NESTED` and
    /// `VOLE_TRACE_DISPOSALS`. The environment is read once per process.
    pub fn from_env() -> Self {
        static FROM_ENV: OnceLock<TrackerConfig> = OnceLock::new();
        *FROM_ENV.get_or_init(|| {
            let defaults = TrackerConfig::default();
            TrackerConfig {
                require_scope: env_flag("VOLE_REQUIRE_SCOPE").unwrap_or(defaults.require_scope),
                unwind_nested: env_flag("VOLE_UNWIND_NESTED").unwrap_or(defaults.unwind_nested),
                trace_disposals: env_flag("VOLE_TRACE_DISPOSALS")
                    .unwrap_or(defaults.trace_disposals),
            }
        })
    }

    pub fn with_require_scope(mut self, require_scope: bool) -> Self {
        self.require_scope = require_scope;
        self
    }

    pub fn with_unwind_nested(mut self, unwind_nested: bool) -> Self {
        self.unwind_nested = unwind_nested;
        self
    }

    pub fn with_trace_disposals(mut self, trace_disposals: bool) -> Self {
        self.trace_disposals = trace_disposals;
        self
    }
}

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

fn env_flag(name: &str) -> Option<bool> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => Some(parse_bool(&value)),
        _ => None,
    }
}
