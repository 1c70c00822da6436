//! Scope timers for evaluator hot paths.
//!
//! With the `profiler` feature enabled, each [`eval_scope`] guard records a call and its
//! exclusive wall time (time not spent in nested scopes) into a thread-local table. Without the
//! feature the guard is an empty struct and every call compiles away.

#[cfg(feature = "profiler")]
use std::cell::RefCell;
#[cfg(feature = "profiler")]
use std::collections::BTreeMap;
use std::time::Duration;
#[cfg(feature = "profiler")]
use std::time::Instant;

/// Aggregated timings for one scope name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScopeStats {
    pub calls: u64,
    pub exclusive: Duration,
    pub inclusive: Duration,
}

#[cfg(feature = "profiler")]
struct GuardFrame {
    name: &'static str,
    start: Instant,
    child_time: Duration,
}

#[cfg(feature = "profiler")]
thread_local! {
    static ACTIVE_GUARDS: RefCell<Vec<GuardFrame>> = const { RefCell::new(Vec::new()) };
    static TABLE: RefCell<BTreeMap<&'static str, ScopeStats>> =
        const { RefCell::new(BTreeMap::new()) };
}

pub struct ScopeGuard {
    #[cfg(feature = "profiler")]
    name: &'static str,
}

#[inline(always)]
pub fn eval_scope(name: &'static str) -> ScopeGuard {
    #[cfg(feature = "profiler")]
    {
        ACTIVE_GUARDS.with(|stack| {
            stack.borrow_mut().push(GuardFrame {
                name,
                start: Instant::now(),
                child_time: Duration::ZERO,
            });
        });
        ScopeGuard { name }
    }
    #[cfg(not(feature = "profiler"))]
    {
        let _ = name;
        ScopeGuard {}
    }
}

#[cfg(feature = "profiler")]
impl Drop for ScopeGuard {
    fn drop(&mut self) {
        ACTIVE_GUARDS.with(|stack| {
            let mut stack = stack.borrow_mut();
            let Some(frame) = stack.pop() else {
                return;
            };
            debug_assert!(frame.name == self.name, "scope guard stack corrupted");

            let elapsed = frame.start.elapsed();
            let exclusive = elapsed.saturating_sub(frame.child_time);
            TABLE.with(|table| {
                let mut table = table.borrow_mut();
                let stats = table.entry(frame.name).or_default();
                stats.calls = stats.calls.saturating_add(1);
                stats.exclusive = stats.exclusive.saturating_add(exclusive);
                stats.inclusive = stats.inclusive.saturating_add(elapsed);
            });

            if let Some(parent) = stack.last_mut() {
                parent.child_time = parent.child_time.saturating_add(elapsed);
            }
        });
    }
}

/// Drains the calling thread's table. Always empty without the `profiler` feature.
pub fn take_report() -> Vec<(&'static str, ScopeStats)> {
    #[cfg(feature = "profiler")]
    {
        TABLE.with(|table| std::mem::take(&mut *table.borrow_mut()).into_iter().collect())
    }
    #[cfg(not(feature = "profiler"))]
    {
        Vec::new()
    }
}

/// Renders a report as an aligned text table.
pub fn format_report(rows: &[(&'static str, ScopeStats)]) -> String {
    let width = rows.iter().map(|(name, _)| name.len()).max().unwrap_or(5).max(5);
    let mut out = format!(
        "{:<width$}  {:>8}  {:>12}  {:>12}\n",
        "scope", "calls", "excl_us", "incl_us"
    );
    for (name, stats) in rows {
        out.push_str(&format!(
            "{:<width$}  {:>8}  {:>12}  {:>12}\n",
            name,
            stats.calls,
            stats.exclusive.as_micros(),
            stats.inclusive.as_micros()
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_formats_one_row_per_scope() {
        let rows = [(
            "ExpressionEvaluator::bind",
            ScopeStats {
                calls: 3,
                exclusive: Duration::from_micros(40),
                inclusive: Duration::from_micros(90),
            },
        )];
        let text = format_report(&rows);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("scope"));
        assert!(lines[1].starts_with("ExpressionEvaluator::bind"));
        assert!(lines[1].ends_with("90"));
    }

    #[test]
    fn guards_record_calls_when_enabled() {
        let _ = take_report();
        {
            let _outer = eval_scope("outer");
            let _inner = eval_scope("inner");
        }
        let report = take_report();
        if cfg!(feature = "profiler") {
            let names: Vec<&str> = report.iter().map(|(name, _)| *name).collect();
            assert_eq!(names, vec!["inner", "outer"]);
            assert!(report.iter().all(|(_, stats)| stats.calls == 1));
        } else {
            assert!(report.is_empty());
        }
    }
}
