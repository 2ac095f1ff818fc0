//! Safety monitor: periodic sampling of runtime signals to report a coarse
//! health verdict (`spec.md` §4.3).
//!
//! Grounded on Design Notes §9 ("Goroutine/task leak detection ... the
//! implementer may substitute a task-count probe exposed by the
//! runtime"): we sample `tokio::runtime::Handle::metrics()` instead of
//! inventing our own task-tracking registry.

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use parking_lot::Mutex;

const MAX_RECENT_ENTRIES: usize = 100;
const RACE_OBSERVATION_THRESHOLD: u64 = 10;
const LEAK_COUNT_THRESHOLD: u64 = 1000;
const TASK_GROWTH_FACTOR: u64 = 3;

#[derive(Debug, Clone, Copy)]
pub struct SampleEntry {
    pub at: Instant,
    pub count: u64,
}

struct RecentEntries {
    deadlocks: VecDeque<SampleEntry>,
    races: VecDeque<SampleEntry>,
    leaks: VecDeque<SampleEntry>,
}

impl RecentEntries {
    fn new() -> Self {
        Self {
            deadlocks: VecDeque::new(),
            races: VecDeque::new(),
            leaks: VecDeque::new(),
        }
    }

    fn push(queue: &mut VecDeque<SampleEntry>, entry: SampleEntry) {
        queue.push_back(entry);
        if queue.len() > MAX_RECENT_ENTRIES {
            queue.pop_front();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    Unhealthy,
}

/// Observes task growth / leak / deadlock signals and exposes a health
/// verdict. Baseline task count is sampled once at construction.
pub struct SafetyMonitor {
    baseline_tasks: u64,
    live_tasks: AtomicU64,
    recent: Mutex<RecentEntries>,
}

impl SafetyMonitor {
    /// `baseline_tasks` should be sampled from the runtime at startup by
    /// the caller (e.g. via `tokio::runtime::Handle::current().metrics()`);
    /// kept as a parameter here so the monitor itself has no hard
    /// dependency on a live Tokio runtime, which keeps it trivially
    /// testable.
    pub fn new(baseline_tasks: u64) -> Self {
        Self {
            baseline_tasks: baseline_tasks.max(1),
            live_tasks: AtomicU64::new(baseline_tasks),
            recent: Mutex::new(RecentEntries::new()),
        }
    }

    pub fn record_live_tasks(&self, count: u64) {
        self.live_tasks.store(count, Ordering::Relaxed);
    }

    pub fn record_deadlock(&self) {
        let mut recent = self.recent.lock();
        RecentEntries::push(
            &mut recent.deadlocks,
            SampleEntry {
                at: Instant::now(),
                count: 1,
            },
        );
    }

    pub fn record_race_observation(&self) {
        let mut recent = self.recent.lock();
        let count = recent.races.len() as u64 + 1;
        RecentEntries::push(
            &mut recent.races,
            SampleEntry {
                at: Instant::now(),
                count,
            },
        );
    }

    pub fn record_leak(&self, count: u64) {
        let mut recent = self.recent.lock();
        RecentEntries::push(
            &mut recent.leaks,
            SampleEntry {
                at: Instant::now(),
                count,
            },
        );
    }

    /// `spec.md` §4.3: unhealthy when any of:
    /// deadlock entry exists; race observations > 10; any leak count >
    /// 1000; live-task count > 3x baseline.
    pub fn verdict(&self) -> Verdict {
        let recent = self.recent.lock();
        if !recent.deadlocks.is_empty() {
            return Verdict::Unhealthy;
        }
        if recent.races.len() as u64 > RACE_OBSERVATION_THRESHOLD {
            return Verdict::Unhealthy;
        }
        if recent.leaks.iter().any(|e| e.count > LEAK_COUNT_THRESHOLD) {
            return Verdict::Unhealthy;
        }
        let live = self.live_tasks.load(Ordering::Relaxed);
        if live > self.baseline_tasks * TASK_GROWTH_FACTOR {
            return Verdict::Unhealthy;
        }
        Verdict::Healthy
    }

    pub fn is_healthy(&self) -> bool {
        self.verdict() == Verdict::Healthy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn healthy_by_default() {
        let monitor = SafetyMonitor::new(10);
        assert_eq!(monitor.verdict(), Verdict::Healthy);
    }

    #[test]
    fn any_deadlock_marks_unhealthy() {
        let monitor = SafetyMonitor::new(10);
        monitor.record_deadlock();
        assert_eq!(monitor.verdict(), Verdict::Unhealthy);
    }

    #[test]
    fn race_observations_over_threshold_marks_unhealthy() {
        let monitor = SafetyMonitor::new(10);
        for _ in 0..11 {
            monitor.record_race_observation();
        }
        assert_eq!(monitor.verdict(), Verdict::Unhealthy);
    }

    #[test]
    fn leak_count_over_threshold_marks_unhealthy() {
        let monitor = SafetyMonitor::new(10);
        monitor.record_leak(1001);
        assert_eq!(monitor.verdict(), Verdict::Unhealthy);
    }

    #[test]
    fn task_growth_over_3x_baseline_marks_unhealthy() {
        let monitor = SafetyMonitor::new(10);
        monitor.record_live_tasks(31);
        assert_eq!(monitor.verdict(), Verdict::Unhealthy);
        monitor.record_live_tasks(29);
        assert_eq!(monitor.verdict(), Verdict::Healthy);
    }
}
