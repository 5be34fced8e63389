//! Per-plan-execution budget
//!
//! One budget is shared by every step of one plan run and by nothing else.
//! Only the executor decrements it. Exhaustion of either allowance stops new
//! dispatch; in-flight steps are never cancelled by the budget.

use crate::agents::BudgetSnapshot;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Remaining time and cost allowance for one plan execution
#[derive(Debug)]
pub struct Budget {
    deadline: Instant,
    cost_remaining: AtomicI64,
}

impl Budget {
    /// Create a budget with the given allowances, starting the clock now
    pub fn new(max_cost_units: i64, max_duration: Duration) -> Self {
        Self {
            deadline: Instant::now() + max_duration,
            cost_remaining: AtomicI64::new(max_cost_units),
        }
    }

    /// Atomically consume cost units; over-consumption saturates at zero on
    /// reads but the debt is recorded so exhaustion is monotonic
    pub fn charge(&self, units: u64) {
        self.cost_remaining
            .fetch_sub(units as i64, Ordering::SeqCst);
    }

    /// Remaining cost units (never negative)
    pub fn remaining_cost(&self) -> i64 {
        self.cost_remaining.load(Ordering::SeqCst).max(0)
    }

    /// Remaining wall-clock time
    pub fn remaining_time(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// True once either allowance has reached zero
    pub fn is_exhausted(&self) -> bool {
        self.cost_remaining.load(Ordering::SeqCst) <= 0 || self.remaining_time().is_zero()
    }

    /// Point-in-time view reported to agents
    pub fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            cost_units: self.remaining_cost(),
            time_ms: self.remaining_time().as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_exhaustion() {
        let budget = Budget::new(10, Duration::from_secs(60));
        assert!(!budget.is_exhausted());

        budget.charge(4);
        assert_eq!(budget.remaining_cost(), 6);

        budget.charge(7);
        assert_eq!(budget.remaining_cost(), 0);
        assert!(budget.is_exhausted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_exhaustion() {
        let budget = Budget::new(100, Duration::from_secs(30));
        assert!(!budget.is_exhausted());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(budget.is_exhausted());
        assert_eq!(budget.remaining_time(), Duration::ZERO);
        // Cost allowance is untouched; time alone exhausts the budget.
        assert_eq!(budget.remaining_cost(), 100);
    }

    #[test]
    fn test_snapshot_reflects_remaining() {
        let budget = Budget::new(25, Duration::from_secs(60));
        budget.charge(5);
        let snapshot = budget.snapshot();
        assert_eq!(snapshot.cost_units, 20);
        assert!(snapshot.time_ms > 0);
    }
}
