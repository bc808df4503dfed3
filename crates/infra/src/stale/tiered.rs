//! Tiered stale-record processor.
//!
//! Repeatedly asks a resolver to process one batch of stale rows for a tier until
//! a call returns zero or the invocation's remaining-count budget runs out.
//! Lock contention and unexpected failures end the invocation early; the next
//! scheduled invocation picks up whatever is left.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::ResolveError;
use crate::scheduler::ScheduledJob;
use crate::workers::{run_workers, LoopBudget};

/// Bulk resolution of stale rows for one tier.
pub trait StaleBatchResolver: Send + Sync {
    /// Resolve up to `max_rows` (or an implementation-chosen batch when `None`)
    /// stale rows of `tier` and return how many were resolved.
    fn process_batch(&self, tier: &str, max_rows: Option<usize>) -> Result<usize, ResolveError>;
}

impl<T: StaleBatchResolver + ?Sized> StaleBatchResolver for std::sync::Arc<T> {
    fn process_batch(&self, tier: &str, max_rows: Option<usize>) -> Result<usize, ResolveError> {
        (**self).process_batch(tier, max_rows)
    }
}

/// Why a sweep or publish invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// No work left.
    Drained,
    BudgetExhausted,
    DeadlineReached,
    LockContention,
    Failed,
}

impl StopReason {
    fn rank(self) -> u8 {
        match self {
            StopReason::Drained => 0,
            StopReason::BudgetExhausted => 1,
            StopReason::DeadlineReached => 2,
            StopReason::LockContention => 3,
            StopReason::Failed => 4,
        }
    }

    /// Combine the stop reasons of parallel workers, keeping the most severe.
    pub fn worst(self, other: StopReason) -> StopReason {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

impl core::fmt::Display for StopReason {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            StopReason::Drained => "drained",
            StopReason::BudgetExhausted => "budget_exhausted",
            StopReason::DeadlineReached => "deadline_reached",
            StopReason::LockContention => "lock_contention",
            StopReason::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Tiered processor configuration.
#[derive(Debug, Clone)]
pub struct TieredProcessorConfig {
    pub name: String,
    /// Tier tag passed to the resolver (e.g. `h`, `d`, `M`).
    pub tier: String,
    /// Per-call row cap (`None` = let the resolver decide).
    pub max_rows_per_call: Option<usize>,
    /// Remaining-count budget shared by all worker loops (`None` = unbounded).
    pub budget: Option<u64>,
    pub parallelism: usize,
    pub max_duration: Option<Duration>,
}

impl Default for TieredProcessorConfig {
    fn default() -> Self {
        Self {
            name: "stale-sweep".to_string(),
            tier: "h".to_string(),
            max_rows_per_call: None,
            budget: Some(1000),
            parallelism: 1,
            max_duration: Some(Duration::from_secs(300)),
        }
    }
}

impl TieredProcessorConfig {
    /// Default configuration for `tier`, named `stale-sweep-<tier>`.
    pub fn for_tier(tier: impl Into<String>) -> Self {
        let tier = tier.into();
        Self {
            name: format!("stale-sweep-{tier}"),
            tier,
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_rows_per_call(mut self, max: Option<usize>) -> Self {
        self.max_rows_per_call = max;
        self
    }

    pub fn with_budget(mut self, budget: Option<u64>) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn with_max_duration(mut self, max: Option<Duration>) -> Self {
        self.max_duration = max;
        self
    }
}

/// Outcome of one sweep invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepSummary {
    pub tier: String,
    /// Sum of the counts returned by every resolver call.
    pub processed: u64,
    pub calls: u64,
    pub stopped: StopReason,
}

/// Sweeps one tier of stale rows.
pub struct TieredStaleProcessor<R: StaleBatchResolver> {
    resolver: R,
    config: TieredProcessorConfig,
}

impl<R: StaleBatchResolver> TieredStaleProcessor<R> {
    pub fn new(resolver: R, config: TieredProcessorConfig) -> Self {
        Self { resolver, config }
    }

    pub fn config(&self) -> &TieredProcessorConfig {
        &self.config
    }

    pub fn execute(&self) -> SweepSummary {
        let started = Instant::now();
        let budget = LoopBudget::new(self.config.max_duration, self.config.budget);

        let summary = run_workers(&self.config.name, self.config.parallelism, |worker| {
            self.sweep(worker, &budget)
        })
        .into_iter()
        .fold(
            SweepSummary {
                tier: self.config.tier.clone(),
                processed: 0,
                calls: 0,
                stopped: StopReason::Drained,
            },
            |acc, w| SweepSummary {
                tier: acc.tier,
                processed: acc.processed + w.processed,
                calls: acc.calls + w.calls,
                stopped: acc.stopped.worst(w.stopped),
            },
        );

        info!(
            job = %self.config.name,
            tier = %summary.tier,
            processed = summary.processed,
            calls = summary.calls,
            stopped = %summary.stopped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "stale sweep finished"
        );

        summary
    }

    fn sweep(&self, worker: usize, budget: &LoopBudget) -> SweepSummary {
        let tier = &self.config.tier;
        let mut processed = 0u64;
        let mut calls = 0u64;

        let stopped = loop {
            if budget.deadline_passed() {
                break StopReason::DeadlineReached;
            }
            if budget.exhausted() {
                break StopReason::BudgetExhausted;
            }

            calls += 1;
            match self.resolver.process_batch(tier, self.config.max_rows_per_call) {
                Ok(0) => break StopReason::Drained,
                Ok(n) => {
                    processed += n as u64;
                    debug!(job = %self.config.name, tier = %tier, worker, resolved = n, "stale batch resolved");
                    if !budget.consume(n) {
                        break StopReason::BudgetExhausted;
                    }
                }
                Err(e) if e.is_transient() => {
                    warn!(job = %self.config.name, tier = %tier, worker, error = %e, "lock contention, ending sweep");
                    break StopReason::LockContention;
                }
                Err(e) => {
                    error!(job = %self.config.name, tier = %tier, worker, error = %e, "stale sweep failed");
                    break StopReason::Failed;
                }
            }
        };

        SweepSummary {
            tier: tier.clone(),
            processed,
            calls,
            stopped,
        }
    }
}

impl<R: StaleBatchResolver> ScheduledJob for TieredStaleProcessor<R> {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn run(&self) {
        self.execute();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    /// Replays a fixed script of results, then returns 0.
    struct Scripted {
        results: Mutex<VecDeque<Result<usize, ResolveError>>>,
        seen: Mutex<Vec<(String, Option<usize>)>>,
    }

    impl Scripted {
        fn new(results: Vec<Result<usize, ResolveError>>) -> Self {
            Self {
                results: Mutex::new(results.into()),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl StaleBatchResolver for Scripted {
        fn process_batch(&self, tier: &str, max_rows: Option<usize>) -> Result<usize, ResolveError> {
            self.seen.lock().unwrap().push((tier.to_string(), max_rows));
            self.results.lock().unwrap().pop_front().unwrap_or(Ok(0))
        }
    }

    fn config() -> TieredProcessorConfig {
        TieredProcessorConfig::for_tier("d")
            .with_budget(None)
            .with_max_duration(None)
    }

    #[test]
    fn processed_is_the_sum_of_non_zero_returns() {
        let resolver = Scripted::new(vec![Ok(5), Ok(3), Ok(7), Ok(0), Ok(9)]);
        let processor = TieredStaleProcessor::new(resolver, config().with_max_rows_per_call(Some(10)));

        let summary = processor.execute();

        assert_eq!(summary.processed, 15);
        assert_eq!(summary.calls, 4);
        assert_eq!(summary.stopped, StopReason::Drained);
        assert_eq!(summary.tier, "d");
        let seen = processor.resolver.seen.lock().unwrap();
        assert!(seen.iter().all(|(t, cap)| t == "d" && *cap == Some(10)));
    }

    #[test]
    fn stops_when_budget_reaches_zero() {
        let resolver = Scripted::new(vec![Ok(4), Ok(4), Ok(4), Ok(4)]);
        let processor = TieredStaleProcessor::new(resolver, config().with_budget(Some(10)));

        let summary = processor.execute();

        assert_eq!(summary.processed, 12);
        assert_eq!(summary.calls, 3);
        assert_eq!(summary.stopped, StopReason::BudgetExhausted);
    }

    #[test]
    fn lock_conflict_ends_the_invocation_quietly() {
        let resolver = Scripted::new(vec![
            Ok(2),
            Err(ResolveError::LockConflict("deadlock detected".into())),
            Ok(50),
        ]);
        let processor = TieredStaleProcessor::new(resolver, config());

        let summary = processor.execute();

        assert_eq!(summary.processed, 2);
        assert_eq!(summary.stopped, StopReason::LockContention);
    }

    #[test]
    fn unexpected_error_is_not_propagated() {
        let resolver = Scripted::new(vec![Err(ResolveError::Failed("relation missing".into()))]);
        let summary = TieredStaleProcessor::new(resolver, config()).execute();
        assert_eq!(summary.processed, 0);
        assert_eq!(summary.stopped, StopReason::Failed);
    }

    #[test]
    fn passed_deadline_makes_no_calls() {
        let resolver = Scripted::new(vec![Ok(1)]);
        let processor =
            TieredStaleProcessor::new(resolver, config().with_max_duration(Some(Duration::ZERO)));
        let summary = processor.execute();
        assert_eq!(summary.calls, 0);
        assert_eq!(summary.stopped, StopReason::DeadlineReached);
    }

    /// Resolves `batch` rows per call out of a shared pool.
    struct Pool {
        left: AtomicU64,
        batch: u64,
    }

    impl StaleBatchResolver for Pool {
        fn process_batch(&self, _tier: &str, _max_rows: Option<usize>) -> Result<usize, ResolveError> {
            let taken = self
                .left
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| {
                    Some(left.saturating_sub(self.batch))
                })
                .map(|before| before.min(self.batch))
                .unwrap_or(0);
            Ok(taken as usize)
        }
    }

    #[test]
    fn parallel_workers_share_one_budget() {
        let resolver = Pool {
            left: AtomicU64::new(1_000),
            batch: 10,
        };
        let processor = TieredStaleProcessor::new(
            resolver,
            config().with_parallelism(4).with_budget(Some(100)),
        );

        let summary = processor.execute();

        assert_eq!(summary.stopped, StopReason::BudgetExhausted);
        // Each worker can overshoot by at most one batch.
        assert!(summary.processed >= 100 && summary.processed < 100 + 4 * 10);
        assert_eq!(
            processor.resolver.left.load(Ordering::Acquire),
            1_000 - summary.processed
        );
    }

    #[test]
    fn parallel_workers_drain_the_tier() {
        let resolver = Pool {
            left: AtomicU64::new(95),
            batch: 10,
        };
        let processor = TieredStaleProcessor::new(resolver, config().with_parallelism(3));
        let summary = processor.execute();
        assert_eq!(summary.processed, 95);
        assert_eq!(summary.stopped, StopReason::Drained);
    }

    #[test]
    fn worst_stop_reason_wins() {
        assert_eq!(StopReason::Drained.worst(StopReason::Failed), StopReason::Failed);
        assert_eq!(
            StopReason::LockContention.worst(StopReason::BudgetExhausted),
            StopReason::LockContention
        );
    }
}
