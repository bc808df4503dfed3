//! Cooperative loop budgets.
//!
//! A scheduled invocation stops early when its wall-clock deadline passes or its
//! shared remaining-count budget reaches zero. Both are checked between
//! iterations only; nothing is preempted.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

/// Early-exit conditions shared by all worker loops of one invocation.
#[derive(Debug)]
pub struct LoopBudget {
    deadline: Option<Instant>,
    remaining: Option<AtomicI64>,
}

impl LoopBudget {
    /// `max_duration` starts counting now. `count` is the remaining-count budget
    /// (`None` = unbounded).
    pub fn new(max_duration: Option<Duration>, count: Option<u64>) -> Self {
        Self {
            deadline: max_duration.map(|d| Instant::now() + d),
            remaining: count.map(|c| AtomicI64::new(i64::try_from(c).unwrap_or(i64::MAX))),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None, None)
    }

    pub fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Subtract `n` processed items. Returns `false` once the budget is used up.
    pub fn consume(&self, n: usize) -> bool {
        match &self.remaining {
            Some(remaining) => {
                let n = i64::try_from(n).unwrap_or(i64::MAX);
                let before = remaining.fetch_sub(n, Ordering::AcqRel);
                before.saturating_sub(n) > 0
            }
            None => true,
        }
    }

    pub fn exhausted(&self) -> bool {
        self.remaining
            .as_ref()
            .is_some_and(|r| r.load(Ordering::Acquire) <= 0)
    }

    pub fn remaining(&self) -> Option<i64> {
        self.remaining.as_ref().map(|r| r.load(Ordering::Acquire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_budget_runs_down() {
        let budget = LoopBudget::new(None, Some(10));
        assert!(budget.consume(4));
        assert!(budget.consume(5));
        assert!(!budget.exhausted());
        assert!(!budget.consume(1));
        assert!(budget.exhausted());
        assert_eq!(budget.remaining(), Some(0));
    }

    #[test]
    fn overshoot_goes_negative() {
        let budget = LoopBudget::new(None, Some(3));
        assert!(!budget.consume(7));
        assert_eq!(budget.remaining(), Some(-4));
        assert!(budget.exhausted());
    }

    #[test]
    fn unbounded_never_exhausts() {
        let budget = LoopBudget::unbounded();
        assert!(budget.consume(usize::MAX));
        assert!(!budget.exhausted());
        assert!(!budget.deadline_passed());
        assert_eq!(budget.remaining(), None);
    }

    #[test]
    fn zero_duration_deadline_has_passed() {
        let budget = LoopBudget::new(Some(Duration::ZERO), None);
        assert!(budget.deadline_passed());
    }
}
