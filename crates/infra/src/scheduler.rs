//! Periodic job scheduler.
//!
//! Each registered job gets its own named thread that invokes it, then waits one
//! poll interval (or until shutdown), and repeats. Invocations of one job never
//! overlap. A job that panics is logged and invoked again on the next tick.
//!
//! Dropping the `SchedulerHandle` without calling `shutdown` also stops the
//! threads after their current invocation, but does not wait for them.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info};

use crate::workers::panic_message;

/// A unit of periodic work. `run` must not fail; problems are logged inside.
pub trait ScheduledJob: Send + Sync {
    fn name(&self) -> &str;

    fn run(&self);
}

impl<T: ScheduledJob + ?Sized> ScheduledJob for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn run(&self) {
        (**self).run()
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Name for logging; prefixes job thread names.
    pub name: String,
    /// Pause between the end of one invocation and the start of the next.
    pub poll_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            name: "reckon-scheduler".to_string(),
            poll_interval: Duration::from_secs(60),
        }
    }
}

impl SchedulerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JobStats {
    pub name: String,
    pub invocations: u64,
    pub panics: u64,
    pub last_duration_ms: u64,
}

/// Scheduler runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub jobs: Vec<JobStats>,
    pub uptime_secs: u64,
}

impl SchedulerStats {
    pub fn job(&self, name: &str) -> Option<&JobStats> {
        self.jobs.iter().find(|j| j.name == name)
    }
}

pub struct JobScheduler {
    config: SchedulerConfig,
    jobs: Vec<Arc<dyn ScheduledJob>>,
}

impl JobScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            config,
            jobs: Vec::new(),
        }
    }

    pub fn add<J: ScheduledJob + 'static>(mut self, job: J) -> Self {
        self.jobs.push(Arc::new(job));
        self
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Start one thread per job.
    pub fn spawn(self) -> SchedulerHandle {
        let stats = Arc::new(Mutex::new(SchedulerStats {
            jobs: self
                .jobs
                .iter()
                .map(|job| JobStats {
                    name: job.name().to_string(),
                    ..Default::default()
                })
                .collect(),
            uptime_secs: 0,
        }));

        let mut shutdown = Vec::with_capacity(self.jobs.len());
        let mut joins = Vec::with_capacity(self.jobs.len());

        for (slot, job) in self.jobs.into_iter().enumerate() {
            let (tx, rx) = mpsc::channel::<()>();
            let stats = Arc::clone(&stats);
            let interval = self.config.poll_interval;
            let thread_name = format!("{}-{}", self.config.name, job.name());

            let spawned = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || job_loop(job, slot, interval, rx, stats));

            match spawned {
                Ok(join) => {
                    shutdown.push(tx);
                    joins.push(join);
                }
                Err(e) => error!(scheduler = %self.config.name, thread = %thread_name, error = %e, "failed to spawn job thread"),
            }
        }

        info!(scheduler = %self.config.name, jobs = joins.len(), "scheduler started");

        SchedulerHandle {
            name: self.config.name,
            shutdown,
            joins,
            stats,
            started: Instant::now(),
        }
    }
}

/// Handle to control a running scheduler.
#[derive(Debug)]
pub struct SchedulerHandle {
    name: String,
    shutdown: Vec<mpsc::Sender<()>>,
    joins: Vec<thread::JoinHandle<()>>,
    stats: Arc<Mutex<SchedulerStats>>,
    started: Instant,
}

impl SchedulerHandle {
    /// Signal every job thread and wait for in-flight invocations to finish.
    pub fn shutdown(self) {
        for tx in &self.shutdown {
            let _ = tx.send(());
        }
        for join in self.joins {
            if join.join().is_err() {
                error!(scheduler = %self.name, "job thread panicked outside an invocation");
            }
        }
        info!(scheduler = %self.name, "scheduler stopped");
    }

    pub fn stats(&self) -> SchedulerStats {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        stats.uptime_secs = self.started.elapsed().as_secs();
        stats
    }
}

fn job_loop(
    job: Arc<dyn ScheduledJob>,
    slot: usize,
    interval: Duration,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<SchedulerStats>>,
) {
    debug!(job = %job.name(), "job thread started");

    loop {
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| job.run()));
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if let Err(payload) = &outcome {
            error!(job = %job.name(), panic = %panic_message(payload.as_ref()), "scheduled job panicked");
        }

        {
            let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = s.jobs.get_mut(slot) {
                entry.invocations += 1;
                entry.last_duration_ms = elapsed_ms;
                if outcome.is_err() {
                    entry.panics += 1;
                }
            }
        }

        match shutdown_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!(job = %job.name(), "job thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Counter {
        name: String,
        runs: Arc<AtomicU64>,
        panics: bool,
    }

    impl ScheduledJob for Counter {
        fn name(&self) -> &str {
            &self.name
        }

        fn run(&self) {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.panics {
                panic!("job bug");
            }
        }
    }

    fn counter(name: &str, panics: bool) -> (Counter, Arc<AtomicU64>) {
        let runs = Arc::new(AtomicU64::new(0));
        (
            Counter {
                name: name.to_string(),
                runs: Arc::clone(&runs),
                panics,
            },
            runs,
        )
    }

    fn wait_for(runs: &AtomicU64, at_least: u64) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while runs.load(Ordering::SeqCst) < at_least && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn runs_jobs_repeatedly_until_shutdown() {
        let (a, a_runs) = counter("a", false);
        let (b, b_runs) = counter("b", false);
        let handle = JobScheduler::new(SchedulerConfig::default().with_poll_interval(Duration::from_millis(5)))
            .add(a)
            .add(b)
            .spawn();

        // A fourth run has started only after the third was recorded.
        wait_for(&a_runs, 4);
        wait_for(&b_runs, 3);
        let stats = handle.stats();
        handle.shutdown();

        assert!(a_runs.load(Ordering::SeqCst) >= 3);
        assert!(b_runs.load(Ordering::SeqCst) >= 3);
        assert_eq!(stats.jobs.len(), 2);
        assert!(stats.job("a").is_some_and(|j| j.invocations >= 3));
    }

    #[test]
    fn panicking_job_stays_scheduled() {
        let (job, runs) = counter("flaky", true);
        let handle = JobScheduler::new(SchedulerConfig::default().with_poll_interval(Duration::from_millis(5)))
            .add(job)
            .spawn();

        wait_for(&runs, 3);
        let stats = handle.stats();
        handle.shutdown();

        assert!(runs.load(Ordering::SeqCst) >= 3);
        let flaky = stats.job("flaky").unwrap();
        assert_eq!(flaky.invocations, flaky.panics);
    }

    #[test]
    fn shutdown_does_not_wait_for_the_next_tick() {
        let (job, runs) = counter("slow-tick", false);
        let handle = JobScheduler::new(SchedulerConfig::default().with_poll_interval(Duration::from_secs(3600)))
            .add(job)
            .spawn();

        wait_for(&runs, 1);
        let started = Instant::now();
        handle.shutdown();

        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
