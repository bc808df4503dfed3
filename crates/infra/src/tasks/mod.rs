//! Deferred task processing.
//!
//! Tasks are persisted records claimed exclusively by one worker at a time and
//! routed by type to a registered handler.
//!
//! ## Components
//!
//! - **Types**: `TaskRecord`, `TaskType`, `TaskValue`, `TaskOutcome`
//! - **Store**: `ClaimStore` contract, `ClaimedTask` transaction scope, in-memory impl
//! - **Registry**: maps task types to handlers
//! - **Runner**: parallel claim/dispatch loops with iteration and time budgets
//! - **Postgres**: durable claim store using `FOR UPDATE SKIP LOCKED`

pub mod postgres;
pub mod registry;
pub mod runner;
pub mod store;
pub mod types;

pub use postgres::PostgresClaimStore;
pub use registry::{Dispatch, TaskHandler, TaskHandlerRegistry};
pub use runner::{JobRunSummary, JobRunnerConfig, ParallelJobRunner};
pub use store::{ClaimStore, ClaimTransaction, ClaimedTask, InMemoryClaimStore};
pub use types::{derived_task_id, TaskOutcome, TaskRecord, TaskType, TaskValue};
