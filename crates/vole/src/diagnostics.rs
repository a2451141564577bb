// =============================================================================
// Diagnostics — Tracker reports and leak checks
// =============================================================================

use std::fmt;

use vole_core::{manager, process_stats, Error, ProcessStats, Result, Scope, ScopeStats, ThreadStats};
use vole_native::{LibStats, NativeLib};

// ---------------------------------------------------------------------------
// TrackerReport — pretty-printable snapshot of every counter
// ---------------------------------------------------------------------------

/// A snapshot of the calling thread's tracker, the process-wide counters and
/// optionally one native library, printed with `Display`.
///
/// # Example
/// ```
/// use vole::diagnostics::TrackerReport;
/// use vole::{NativeLib, Tensor, ScopeGuard};
///
/// let lib = NativeLib::new();
/// let guard = ScopeGuard::new();
/// let _t = Tensor::ones(&[2, 2], &lib).unwrap();
/// let report = TrackerReport::with_native(&lib);
/// assert_eq!(report.scopes.len(), 1);
/// assert!(report.is_consistent());
/// println!("{}", report);
/// guard.close().unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct TrackerReport {
    pub thread: ThreadStats,
    pub process: ProcessStats,
    /// Open scopes, outermost first.
    pub scopes: Vec<(Scope, ScopeStats)>,
    pub native: Option<LibStats>,
}

impl TrackerReport {
    /// Capture the tracker counters only.
    pub fn capture() -> Self {
        TrackerReport {
            thread: manager::stats(),
            process: process_stats(),
            scopes: manager::open_scopes(),
            native: None,
        }
    }

    /// Capture the tracker counters plus `lib`'s allocation counters.
    pub fn with_native(lib: &NativeLib) -> Self {
        TrackerReport {
            native: Some(lib.stats()),
            ..Self::capture()
        }
    }

    /// True when the thread counters and every open scope balance.
    pub fn is_consistent(&self) -> bool {
        self.thread.is_consistent() && self.scopes.iter().all(|(_, s)| s.is_consistent())
    }
}

impl fmt::Display for TrackerReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "═".repeat(62);
        writeln!(f, "╔{rule}╗")?;
        writeln!(f, "║ {:<60} ║", "Vole Tracker Report")?;
        writeln!(f, "╠{rule}╣")?;
        writeln!(f, "║ {:<16} {:>10} {:>10} {:>10} {:>10} ║", "", "Created", "Disposed", "Live", "Moved")?;
        writeln!(f, "╠{rule}╣")?;
        writeln!(
            f,
            "║ {:<16} {:>10} {:>10} {:>10} {:>10} ║",
            "thread",
            self.thread.created(),
            self.thread.disposed(),
            self.thread.live(),
            self.thread.attached + self.thread.detached
        )?;
        writeln!(
            f,
            "║ {:<16} {:>10} {:>10} {:>10} {:>10} ║",
            "  untracked",
            self.thread.created_outside_scope,
            self.thread.disposed_outside_scope,
            self.thread.live_untracked,
            "-"
        )?;
        writeln!(
            f,
            "║ {:<16} {:>10} {:>10} {:>10} {:>10} ║",
            "process",
            self.process.created,
            self.process.disposed,
            self.process.live(),
            "-"
        )?;
        if !self.scopes.is_empty() {
            writeln!(f, "╠{rule}╣")?;
            for (depth, (scope, stats)) in self.scopes.iter().enumerate() {
                let label = format!("{}{}", "  ".repeat(depth), scope);
                writeln!(
                    f,
                    "║ {:<16} {:>10} {:>10} {:>10} {:>10} ║",
                    truncate_str(&label, 16),
                    stats.created,
                    stats.disposed,
                    stats.live,
                    stats.attached + stats.detached
                )?;
            }
        }
        if let Some(native) = &self.native {
            writeln!(f, "╠{rule}╣")?;
            writeln!(
                f,
                "║ {:<16} {:>10} {:>10} {:>10} {:>10} ║",
                "native handles",
                native.allocations,
                native.releases,
                native.live_handles,
                "-"
            )?;
            writeln!(
                f,
                "║ {:<60} ║",
                format!(
                    "live native memory: {}  invalid releases: {}",
                    format_bytes(native.live_bytes),
                    native.invalid_releases
                )
            )?;
        }
        writeln!(f, "╚{rule}╝")?;
        Ok(())
    }
}

fn truncate_str(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let head: String = s.chars().take(max - 1).collect();
        format!("{head}…")
    } else {
        s.to_string()
    }
}

/// Format bytes into a human-readable string (B, KB, MB, GB).
pub fn format_bytes(bytes: usize) -> String {
    const KB: usize = 1024;
    const MB: usize = 1024 * KB;
    const GB: usize = 1024 * MB;
    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

// ---------------------------------------------------------------------------
// LeakCheck — compare two points in time
// ---------------------------------------------------------------------------

/// What happened between [`LeakCheck::start`] and [`LeakCheck::finish`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeakSummary {
    pub created: u64,
    pub disposed: u64,
    /// Resources created in the window and still live at its end.
    pub leaked: u64,
    /// Native handles allocated in the window and still live at its end.
    pub native_leaked: usize,
}

impl LeakSummary {
    pub fn is_clean(&self) -> bool {
        self.leaked == 0 && self.native_leaked == 0
    }
}

impl fmt::Display for LeakSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "created={} disposed={} leaked={} native_leaked={}",
            self.created, self.disposed, self.leaked, self.native_leaked
        )
    }
}

/// Snapshot-and-compare leak detector for the calling thread.
///
/// The window must not contain a call to `manager::reset_stats`.
///
/// # Example
/// ```
/// use vole::diagnostics::LeakCheck;
/// use vole::{with_scope, Error, NativeLib, Tensor};
///
/// let lib = NativeLib::new();
/// let check = LeakCheck::with_native(&lib);
/// with_scope(|_| {
///     let a = Tensor::ones(&[8], &lib)?;
///     let _b = a.mul_scalar(2.0)?;
///     Ok::<_, Error>(())
/// })
/// .unwrap();
/// check.assert_clean().unwrap();
/// ```
pub struct LeakCheck {
    start: ThreadStats,
    native: Option<(NativeLib, usize)>,
}

impl LeakCheck {
    /// Start watching the tracker counters.
    pub fn start() -> Self {
        LeakCheck {
            start: manager::stats(),
            native: None,
        }
    }

    /// Start watching the tracker counters and `lib`'s live handles.
    pub fn with_native(lib: &NativeLib) -> Self {
        LeakCheck {
            native: Some((lib.clone(), lib.stats().live_handles)),
            ..Self::start()
        }
    }

    /// Compare the current counters with the starting point.
    pub fn finish(&self) -> LeakSummary {
        let now = manager::stats();
        let created = now.created().saturating_sub(self.start.created());
        let disposed = now.disposed().saturating_sub(self.start.disposed());
        let native_leaked = self
            .native
            .as_ref()
            .map(|(lib, before)| lib.stats().live_handles.saturating_sub(*before))
            .unwrap_or(0);
        LeakSummary {
            created,
            disposed,
            leaked: created.saturating_sub(disposed),
            native_leaked,
        }
    }

    /// Fail if anything created since the start is still live.
    pub fn assert_clean(&self) -> Result<LeakSummary> {
        let summary = self.finish();
        if !summary.is_clean() {
            log::warn!("leak check failed: {}", summary);
            return Err(Error::msg(format!("resources leaked: {summary}")));
        }
        Ok(summary)
    }
}
