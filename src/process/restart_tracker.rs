//! Per-channel restart-attempt bookkeeping (spec.md §4.8: "after 5 consecutive
//! failures within 10 min the channel enters `error`"). Grounded on the teacher's
//! `scheduler/actor/restart_tracker.rs` (a `HashMap<String, History>` of failure
//! timestamps per actor), with the policy itself simplified from the teacher's
//! exponential-backoff curve to spec.md's fixed threshold/window rule.

use std::collections::HashMap;
use std::time::{Duration, Instant};

struct History {
    failures_within_window: Vec<Instant>,
}

/// Tracks consecutive-failure counts per channel within a rolling window.
pub struct RestartTracker {
    max_failures: u32,
    window: Duration,
    history: HashMap<String, History>,
}

impl RestartTracker {
    pub fn new(max_failures: u32, window: Duration) -> Self {
        Self { max_failures, window, history: HashMap::new() }
    }

    /// Records a failure for `channel_id` and returns `true` if this pushes the
    /// channel over the budget (5 failures within the window by default), at which
    /// point the caller should stop restarting automatically.
    pub fn record_failure(&mut self, channel_id: &str) -> bool {
        let now = Instant::now();
        let entry = self.history.entry(channel_id.to_string()).or_insert_with(|| History { failures_within_window: Vec::new() });
        entry.failures_within_window.retain(|at| now.duration_since(*at) <= self.window);
        entry.failures_within_window.push(now);
        entry.failures_within_window.len() as u32 >= self.max_failures
    }

    /// Called once a channel starts cleanly again — clears its failure history so a
    /// later unrelated failure starts counting from zero.
    pub fn reset(&mut self, channel_id: &str) {
        self.history.remove(channel_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exceeds_budget_after_max_failures_within_window() {
        let mut tracker = RestartTracker::new(3, Duration::from_secs(600));
        assert!(!tracker.record_failure("ch-1"));
        assert!(!tracker.record_failure("ch-1"));
        assert!(tracker.record_failure("ch-1"));
    }

    #[test]
    fn reset_clears_history() {
        let mut tracker = RestartTracker::new(2, Duration::from_secs(600));
        assert!(tracker.record_failure("ch-1"));
        tracker.reset("ch-1");
        assert!(!tracker.record_failure("ch-1"));
    }

    #[test]
    fn failures_outside_window_do_not_count() {
        let mut tracker = RestartTracker::new(2, Duration::from_millis(10));
        assert!(!tracker.record_failure("ch-1"));
        std::thread::sleep(Duration::from_millis(20));
        assert!(!tracker.record_failure("ch-1"));
    }
}
