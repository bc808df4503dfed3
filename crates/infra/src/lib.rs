//! Infrastructure layer: background task processing and stale-state reconciliation.
//!
//! - `tasks`: claimable task queue, handler registry, parallel runner
//! - `stale`: tiered stale sweeps and the stale stream publisher
//! - `billing`: monthly invoice catch-up and invoice task handlers
//! - `scheduler`: runs the above periodically on dedicated threads
//! - `config`: `RECKON_*` environment configuration
//! - `db`: Postgres bridge shared by the durable stores

pub mod billing;
pub mod config;
pub mod db;
pub mod error;
pub mod scheduler;
pub mod stale;
pub mod tasks;
pub mod workers;

pub use config::{ConfigError, EngineConfig};
pub use error::{DirectoryError, PublishError, ResolveError, StoreError};
pub use scheduler::{JobScheduler, ScheduledJob, SchedulerConfig, SchedulerHandle, SchedulerStats};
