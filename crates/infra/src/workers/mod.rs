//! Parallel worker loops.
//!
//! Every engine component that "drives W independent loops" goes through
//! `run_workers`: named scoped threads, joined before returning, with a panicking
//! worker logged instead of propagated.

pub mod budget;

pub use budget::LoopBudget;

use std::any::Any;
use std::thread;

use tracing::error;

/// Best-effort text of a caught panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Run `work(worker_index)` on `parallelism` named threads and collect the results
/// of the workers that finished normally.
///
/// Workers share nothing but what `work` captures; a worker that panics or cannot
/// be spawned is logged and omitted from the result.
pub fn run_workers<T, F>(name: &str, parallelism: usize, work: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize) -> T + Sync,
{
    let parallelism = parallelism.max(1);
    let work = &work;

    thread::scope(|scope| {
        let mut joins = Vec::with_capacity(parallelism);
        for worker in 0..parallelism {
            let spawned = thread::Builder::new()
                .name(format!("{name}-{worker}"))
                .spawn_scoped(scope, move || work(worker));
            match spawned {
                Ok(join) => joins.push((worker, join)),
                Err(e) => error!(job = %name, worker, error = %e, "failed to spawn worker thread"),
            }
        }

        joins
            .into_iter()
            .filter_map(|(worker, join)| match join.join() {
                Ok(result) => Some(result),
                Err(_) => {
                    error!(job = %name, worker, "worker thread panicked");
                    None
                }
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[test]
    fn runs_each_worker_once() {
        let mut results = run_workers("test", 4, |w| w * 10);
        results.sort_unstable();
        assert_eq!(results, vec![0, 10, 20, 30]);
    }

    #[test]
    fn workers_run_on_named_threads() {
        let names = Mutex::new(HashSet::new());
        run_workers("sweeper", 2, |_| {
            let name = thread::current().name().map(str::to_string);
            names.lock().unwrap().insert(name);
        });
        let names = names.into_inner().unwrap();
        assert!(names.contains(&Some("sweeper-0".to_string())));
        assert!(names.contains(&Some("sweeper-1".to_string())));
    }

    #[test]
    fn panicking_worker_is_dropped_not_propagated() {
        let results = run_workers("test", 3, |w| {
            if w == 1 {
                panic!("boom");
            }
            w
        });
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn panic_message_reads_string_payloads() {
        let payload = std::panic::catch_unwind(|| panic!("boom {}", 7)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom 7");

        let payload = std::panic::catch_unwind(|| std::panic::panic_any(42u8)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }

    #[test]
    fn zero_parallelism_still_runs_one_worker() {
        assert_eq!(run_workers("test", 0, |w| w), vec![0]);
    }
}
