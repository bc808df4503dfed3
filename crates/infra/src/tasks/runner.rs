//! Parallel job runner.
//!
//! One invocation drives `parallelism` independent worker loops against a claim
//! store. Each loop claims one task at a time, dispatches it through the handler
//! registry and settles the claim according to the handler's outcome:
//!
//! | outcome | log level | claim |
//! |---|---|---|
//! | `Success` | debug | complete (delete) |
//! | `Retry` | info | release |
//! | `Fatal` | error | complete (delete) |
//! | unhandled type | warn | complete (delete) |
//! | handler panic | error | release |
//!
//! A worker stops when its claim returns nothing, the deadline passes, its
//! iteration cap is reached, or the store fails. When a worker claims a task it
//! already retried during this invocation, it keeps that claim open (parked) and
//! claims again, so the task no longer shadows the work queued behind it. Parked
//! claims are released when the worker stops.

use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use reckon_core::TaskId;

use super::registry::{Dispatch, TaskHandlerRegistry};
use super::store::{ClaimStore, ClaimedTask};
use super::types::TaskOutcome;
use crate::error::StoreError;
use crate::scheduler::ScheduledJob;
use crate::workers::{panic_message, run_workers, LoopBudget};

/// Job runner configuration.
#[derive(Debug, Clone)]
pub struct JobRunnerConfig {
    /// Name for logging and worker thread names.
    pub name: String,
    /// Number of independent worker loops.
    pub parallelism: usize,
    /// Per-worker claim cap for one invocation (`None` = unbounded).
    pub max_iterations: Option<usize>,
    /// Wall-clock budget for one invocation (`None` = unbounded).
    pub max_duration: Option<Duration>,
}

impl Default for JobRunnerConfig {
    fn default() -> Self {
        Self {
            name: "task-runner".to_string(),
            parallelism: 2,
            max_iterations: Some(1000),
            max_duration: Some(Duration::from_secs(300)),
        }
    }
}

impl JobRunnerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn with_max_iterations(mut self, max: Option<usize>) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn with_max_duration(mut self, max: Option<Duration>) -> Self {
        self.max_duration = max;
        self
    }
}

/// Counters for one invocation, summed over all workers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobRunSummary {
    pub claimed: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub failed: u64,
    /// Tasks drained because no handler exists for their type.
    pub discarded: u64,
    /// Worker loops that ran to completion.
    pub workers: usize,
}

impl JobRunSummary {
    fn merge(mut self, other: JobRunSummary) -> Self {
        self.claimed += other.claimed;
        self.succeeded += other.succeeded;
        self.retried += other.retried;
        self.failed += other.failed;
        self.discarded += other.discarded;
        self.workers += other.workers;
        self
    }
}

/// Claims tasks from a store and runs them through a handler registry.
pub struct ParallelJobRunner<S: ClaimStore> {
    store: S,
    registry: TaskHandlerRegistry,
    config: JobRunnerConfig,
}

impl<S: ClaimStore> ParallelJobRunner<S> {
    pub fn new(store: S, registry: TaskHandlerRegistry, config: JobRunnerConfig) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &JobRunnerConfig {
        &self.config
    }

    pub fn registry(&self) -> &TaskHandlerRegistry {
        &self.registry
    }

    /// Run one invocation. Never fails; problems are logged and end the affected
    /// worker loop only.
    pub fn execute(&self) -> JobRunSummary {
        let started = Instant::now();
        let budget = LoopBudget::new(self.config.max_duration, None);

        debug!(
            job = %self.config.name,
            parallelism = self.config.parallelism,
            handlers = ?self.registry.registered_types(),
            "task run started"
        );

        let summary = run_workers(&self.config.name, self.config.parallelism, |worker| {
            self.worker_loop(worker, &budget)
        })
        .into_iter()
        .fold(JobRunSummary::default(), JobRunSummary::merge);

        info!(
            job = %self.config.name,
            claimed = summary.claimed,
            succeeded = summary.succeeded,
            retried = summary.retried,
            failed = summary.failed,
            discarded = summary.discarded,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "task run finished"
        );

        summary
    }

    fn worker_loop(&self, worker: usize, budget: &LoopBudget) -> JobRunSummary {
        let name = &self.config.name;
        let mut summary = JobRunSummary {
            workers: 1,
            ..Default::default()
        };
        let mut retried: HashSet<TaskId> = HashSet::new();
        let mut parked: Vec<ClaimedTask> = Vec::new();
        let mut iterations = 0usize;

        loop {
            if budget.deadline_passed() {
                debug!(job = %name, worker, "deadline reached");
                break;
            }
            if self.config.max_iterations.is_some_and(|max| iterations >= max) {
                debug!(job = %name, worker, iterations, "iteration cap reached");
                break;
            }
            iterations += 1;

            let claimed = match self.store.claim() {
                Ok(Some(claimed)) => claimed,
                Ok(None) => break,
                Err(e) => {
                    error!(job = %name, worker, error = %e, "failed to claim task");
                    break;
                }
            };

            if retried.contains(&claimed.id()) {
                debug!(job = %name, worker, task_id = %claimed.id(), "parking retried task");
                parked.push(claimed);
                continue;
            }

            summary.claimed += 1;
            if let Some(id) = self.run_one(claimed, &mut summary) {
                retried.insert(id);
            }
        }

        for claimed in parked {
            settle(name, claimed.id(), claimed.release());
        }

        summary
    }

    /// Dispatch one claimed task and settle its claim. Returns the task id when the
    /// task was left in the store for a retry.
    fn run_one(&self, claimed: ClaimedTask, summary: &mut JobRunSummary) -> Option<TaskId> {
        let name = &self.config.name;
        let task = claimed.task();
        let task_id = task.id;
        let account_id = task.account_id;
        let task_type = task.task_type;

        let dispatched = panic::catch_unwind(AssertUnwindSafe(|| self.registry.dispatch(task)));

        match dispatched {
            Ok(Dispatch::Handled(TaskOutcome::Success)) => {
                debug!(job = %name, task_id = %task_id, task_type = %task_type, "task succeeded");
                summary.succeeded += 1;
                settle(name, task_id, claimed.complete());
                None
            }
            Ok(Dispatch::Handled(TaskOutcome::Retry(reason))) => {
                info!(
                    job = %name,
                    task_id = %task_id,
                    account_id = %account_id,
                    task_type = %task_type,
                    reason = %reason,
                    "task will be retried"
                );
                summary.retried += 1;
                settle(name, task_id, claimed.release());
                Some(task_id)
            }
            Ok(Dispatch::Handled(TaskOutcome::Fatal(reason))) => {
                error!(
                    job = %name,
                    task_id = %task_id,
                    account_id = %account_id,
                    task_type = %task_type,
                    reason = %reason,
                    "task failed permanently, deleting"
                );
                summary.failed += 1;
                settle(name, task_id, claimed.complete());
                None
            }
            Ok(Dispatch::Unhandled) => {
                warn!(
                    job = %name,
                    task_id = %task_id,
                    task_type = %task_type,
                    "no handler for task type, discarding"
                );
                summary.discarded += 1;
                settle(name, task_id, claimed.complete());
                None
            }
            Err(payload) => {
                error!(
                    job = %name,
                    task_id = %task_id,
                    task_type = %task_type,
                    panic = %panic_message(payload.as_ref()),
                    "task handler panicked, releasing claim"
                );
                summary.retried += 1;
                settle(name, task_id, claimed.release());
                Some(task_id)
            }
        }
    }
}

fn settle(name: &str, task_id: TaskId, result: Result<(), StoreError>) {
    match result {
        Ok(()) => {}
        Err(e) if e.is_transient() => {
            warn!(job = %name, task_id = %task_id, error = %e, "lock conflict settling claim")
        }
        Err(e) => error!(job = %name, task_id = %task_id, error = %e, "failed to settle claim"),
    }
}

impl<S: ClaimStore> ScheduledJob for ParallelJobRunner<S> {
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
    use crate::tasks::store::InMemoryClaimStore;
    use crate::tasks::types::{TaskRecord, TaskType};
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use reckon_core::AccountId;
    use std::sync::{Arc, Mutex};

    fn task(task_type: TaskType, minute: i64) -> TaskRecord {
        let base = Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap();
        TaskRecord::new(AccountId::new(), task_type).created_at(base + ChronoDuration::minutes(minute))
    }

    fn config() -> JobRunnerConfig {
        JobRunnerConfig::default()
            .with_name("test-runner")
            .with_parallelism(1)
            .with_max_duration(None)
    }

    #[test]
    fn success_and_fatal_delete_the_task() {
        let store = InMemoryClaimStore::arc();
        store.save(task(TaskType::GenerateInvoice, 1)).unwrap();
        store.save(task(TaskType::DeliverInvoice, 2)).unwrap();

        let mut registry = TaskHandlerRegistry::new();
        registry.register(TaskType::GenerateInvoice, |_| TaskOutcome::Success);
        registry.register(TaskType::DeliverInvoice, |_| TaskOutcome::fatal("no recipient"));

        let runner = ParallelJobRunner::new(store.clone(), registry, config());
        let summary = runner.execute();

        assert_eq!(summary.claimed, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failed, 1);
        assert!(store.is_empty());
        assert_eq!(store.claimed_count(), 0);
    }

    #[test]
    fn retried_task_stays_claimable_for_the_next_invocation() {
        let store = InMemoryClaimStore::arc();
        let id = store.save(task(TaskType::DeliverInvoice, 1)).unwrap();

        let attempts = Arc::new(Mutex::new(0u32));
        let mut registry = TaskHandlerRegistry::new();
        let seen = Arc::clone(&attempts);
        registry.register(TaskType::DeliverInvoice, move |_| {
            let mut n = seen.lock().unwrap();
            *n += 1;
            if *n == 1 {
                TaskOutcome::retry("mail relay unavailable")
            } else {
                TaskOutcome::Success
            }
        });

        let runner = ParallelJobRunner::new(store.clone(), registry, config());

        let first = runner.execute();
        assert_eq!(first.retried, 1);
        assert_eq!(first.claimed, 1);
        assert!(store.get(id).is_some());
        assert_eq!(store.claimed_count(), 0);

        let second = runner.execute();
        assert_eq!(second.succeeded, 1);
        assert!(store.get(id).is_none());
        assert_eq!(*attempts.lock().unwrap(), 2);
    }

    #[test]
    fn retrying_task_does_not_block_the_queue() {
        let store = InMemoryClaimStore::arc();
        let stuck = store.save(task(TaskType::DeliverInvoice, 0)).unwrap();
        for i in 1..=5 {
            store.save(task(TaskType::GenerateInvoice, i)).unwrap();
        }

        let mut registry = TaskHandlerRegistry::new();
        registry.register(TaskType::DeliverInvoice, |_| TaskOutcome::retry("mail relay unavailable"));
        registry.register(TaskType::GenerateInvoice, |_| TaskOutcome::Success);

        let summary = ParallelJobRunner::new(store.clone(), registry, config()).execute();

        assert_eq!(summary.succeeded, 5);
        assert_eq!(summary.retried, 1);
        assert_eq!(store.len(), 1);
        assert!(store.get(stuck).is_some());
        assert_eq!(store.claimed_count(), 0);
    }

    #[test]
    fn poison_records_are_drained() {
        let store = InMemoryClaimStore::arc();
        store.save(task(TaskType::Unknown, 1)).unwrap();
        store.save(task(TaskType::DeliverInvoice, 2)).unwrap();
        let good = store.save(task(TaskType::GenerateInvoice, 3)).unwrap();

        let handled = Arc::new(Mutex::new(Vec::new()));
        let mut registry = TaskHandlerRegistry::new();
        let log = Arc::clone(&handled);
        registry.register(TaskType::GenerateInvoice, move |t| {
            log.lock().unwrap().push(t.id);
            TaskOutcome::Success
        });

        let summary = ParallelJobRunner::new(store.clone(), registry, config()).execute();

        assert_eq!(summary.discarded, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(*handled.lock().unwrap(), vec![good]);
        assert!(store.is_empty());
    }

    #[test]
    fn iteration_cap_is_per_worker() {
        let store = InMemoryClaimStore::arc();
        for i in 0..5 {
            store.save(task(TaskType::GenerateInvoice, i)).unwrap();
        }

        let mut registry = TaskHandlerRegistry::new();
        registry.register(TaskType::GenerateInvoice, |_| TaskOutcome::Success);

        let runner = ParallelJobRunner::new(
            store.clone(),
            registry,
            config().with_max_iterations(Some(2)),
        );
        let summary = runner.execute();

        assert_eq!(summary.succeeded, 2);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn passed_deadline_claims_nothing() {
        let store = InMemoryClaimStore::arc();
        store.save(task(TaskType::GenerateInvoice, 1)).unwrap();

        let mut registry = TaskHandlerRegistry::new();
        registry.register(TaskType::GenerateInvoice, |_| TaskOutcome::Success);

        let runner = ParallelJobRunner::new(
            store.clone(),
            registry,
            config().with_max_duration(Some(Duration::ZERO)),
        );
        let summary = runner.execute();

        assert_eq!(summary.claimed, 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn panicking_handler_releases_the_claim() {
        let store = InMemoryClaimStore::arc();
        let id = store.save(task(TaskType::GenerateInvoice, 1)).unwrap();

        let mut registry = TaskHandlerRegistry::new();
        registry.register(TaskType::GenerateInvoice, |_| panic!("handler bug"));

        let summary = ParallelJobRunner::new(store.clone(), registry, config()).execute();

        assert_eq!(summary.retried, 1);
        assert_eq!(summary.workers, 1);
        assert!(store.get(id).is_some());
        assert_eq!(store.claimed_count(), 0);
    }

    #[test]
    fn parallel_workers_process_each_task_once() {
        let store = InMemoryClaimStore::arc();
        for i in 0..100 {
            store.save(task(TaskType::GenerateInvoice, i)).unwrap();
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut registry = TaskHandlerRegistry::new();
        let log = Arc::clone(&seen);
        registry.register(TaskType::GenerateInvoice, move |t| {
            log.lock().unwrap().push(t.id);
            TaskOutcome::Success
        });

        let runner = ParallelJobRunner::new(store.clone(), registry, config().with_parallelism(4));
        let summary = runner.execute();

        let seen = seen.lock().unwrap();
        let unique: HashSet<_> = seen.iter().copied().collect();
        assert_eq!(seen.len(), 100);
        assert_eq!(unique.len(), 100);
        assert_eq!(summary.succeeded, 100);
        assert_eq!(summary.workers, 4);
        assert!(store.is_empty());
    }

    struct BrokenStore;

    impl ClaimStore for BrokenStore {
        fn claim(&self) -> Result<Option<ClaimedTask>, StoreError> {
            Err(StoreError::storage("connection refused"))
        }

        fn delete(&self, _task_id: TaskId) -> Result<(), StoreError> {
            Ok(())
        }

        fn save(&self, task: TaskRecord) -> Result<TaskId, StoreError> {
            Ok(task.id)
        }
    }

    #[test]
    fn claim_failure_ends_the_worker_quietly() {
        let runner = ParallelJobRunner::new(BrokenStore, TaskHandlerRegistry::new(), config().with_parallelism(3));
        let summary = runner.execute();
        assert_eq!(summary.claimed, 0);
        assert_eq!(summary.workers, 3);
    }
}
