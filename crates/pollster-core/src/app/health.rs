//! HealthMonitor - 連続エラーのバジェットとラッチされる liveness

use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Counts consecutive failures of the agent.
///
/// Once the count goes beyond `max_error_allowed` the monitor latches
/// unhealthy and stays so until [`HealthMonitor::reset`]. A negative budget
/// disables the latch.
#[derive(Debug)]
pub struct HealthMonitor {
    max_error_allowed: i64,
    consecutive_errors: AtomicU64,
    total_errors: AtomicU64,
    initialized: AtomicBool,
    failed: AtomicBool,
}

impl HealthMonitor {
    pub fn new(max_error_allowed: i64) -> Self {
        Self {
            max_error_allowed,
            consecutive_errors: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            initialized: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }
    }

    /// Records a failure. Returns `true` when this failure exhausted the budget.
    pub fn record_error(&self, error: &dyn Display) -> bool {
        let consecutive = self.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
        self.total_errors.fetch_add(1, Ordering::SeqCst);

        if self.max_error_allowed < 0 {
            tracing::warn!(%error, consecutive, "failure recorded (error budget disabled)");
            return false;
        }

        tracing::warn!(
            %error,
            consecutive,
            max_error_allowed = self.max_error_allowed,
            "failure recorded"
        );
        if consecutive as i64 > self.max_error_allowed {
            let first = !self.failed.swap(true, Ordering::SeqCst);
            if first {
                tracing::error!(
                    consecutive,
                    "too many consecutive errors, agent is now unhealthy"
                );
            }
            return first;
        }
        false
    }

    pub fn record_success(&self) {
        self.consecutive_errors.store(0, Ordering::SeqCst);
    }

    /// Latches unhealthy for a reason other than the budget.
    pub fn latch(&self, reason: &str) {
        if !self.failed.swap(true, Ordering::SeqCst) {
            tracing::error!(reason, "liveness latched unhealthy");
        }
    }

    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::SeqCst)
    }

    pub fn consecutive_errors(&self) -> u64 {
        self.consecutive_errors.load(Ordering::SeqCst)
    }

    pub fn total_errors(&self) -> u64 {
        self.total_errors.load(Ordering::SeqCst)
    }

    pub fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::SeqCst);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Clears counters and the latch.
    pub fn reset(&self) {
        self.consecutive_errors.store(0, Ordering::SeqCst);
        self.total_errors.store(0, Ordering::SeqCst);
        self.failed.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn budget_latches_beyond_max() {
        let monitor = HealthMonitor::new(2);

        assert!(!monitor.record_error(&"e1"));
        assert!(!monitor.record_error(&"e2"));
        assert!(!monitor.is_failed());

        assert!(monitor.record_error(&"e3"));
        assert!(monitor.is_failed());

        // latched: later errors do not report again, success does not heal
        assert!(!monitor.record_error(&"e4"));
        monitor.record_success();
        assert!(monitor.is_failed());
    }

    #[test]
    fn success_resets_consecutive_count() {
        let monitor = HealthMonitor::new(2);

        monitor.record_error(&"e1");
        monitor.record_error(&"e2");
        monitor.record_success();
        monitor.record_error(&"e3");
        monitor.record_error(&"e4");

        assert!(!monitor.is_failed());
        assert_eq!(monitor.consecutive_errors(), 2);
        assert_eq!(monitor.total_errors(), 4);
    }

    #[rstest]
    #[case::disabled(-1, 100, false)]
    #[case::zero_budget(0, 1, true)]
    #[case::within(5, 5, false)]
    #[case::beyond(5, 6, true)]
    fn budget_boundaries(#[case] max: i64, #[case] errors: usize, #[case] failed: bool) {
        let monitor = HealthMonitor::new(max);
        for _ in 0..errors {
            monitor.record_error(&"boom");
        }
        assert_eq!(monitor.is_failed(), failed);
    }

    #[test]
    fn reset_clears_the_latch() {
        let monitor = HealthMonitor::new(0);
        monitor.record_error(&"boom");
        assert!(monitor.is_failed());

        monitor.reset();

        assert!(!monitor.is_failed());
        assert_eq!(monitor.consecutive_errors(), 0);
    }
}
