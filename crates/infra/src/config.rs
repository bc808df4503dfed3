//! Engine configuration.
//!
//! Every component has its own config struct with defaults and `with_*` builders.
//! `EngineConfig` bundles them and can be loaded from `RECKON_*` environment
//! variables. Unset variables keep their defaults; malformed ones are an error
//! rather than silently ignored.
//!
//! | variable | default |
//! |---|---|
//! | `RECKON_JOB_PARALLELISM` | 2 |
//! | `RECKON_JOB_MAX_ITERATIONS` | 1000 |
//! | `RECKON_JOB_MAX_DURATION_SECS` | 300 |
//! | `RECKON_STALE_TIERS` | `h,d,M` |
//! | `RECKON_STALE_MAX_ROWS_PER_CALL` | 0 (unbounded) |
//! | `RECKON_STALE_BUDGET` | 1000 |
//! | `RECKON_STALE_PARALLELISM` | 1 |
//! | `RECKON_PUBLISH_KIND` | `flux` |
//! | `RECKON_PUBLISH_ROWS_PER_TX` | 1 |
//! | `RECKON_PUBLISH_BUDGET` | 1000 |
//! | `RECKON_CATCHUP_PAGE_SIZE` | 50 |
//! | `RECKON_SCHEDULER_POLL_MS` | 60000 |

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::billing::CatchUpConfig;
use crate::scheduler::SchedulerConfig;
use crate::stale::{StalePublisherConfig, TieredProcessorConfig};
use crate::tasks::JobRunnerConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &str, value: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub runner: JobRunnerConfig,
    /// One sweep processor per tier.
    pub sweeps: Vec<TieredProcessorConfig>,
    pub publisher: StalePublisherConfig,
    pub catch_up: CatchUpConfig,
    pub scheduler: SchedulerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            runner: JobRunnerConfig::default(),
            sweeps: ["h", "d", "M"]
                .into_iter()
                .map(TieredProcessorConfig::for_tier)
                .collect(),
            publisher: StalePublisherConfig::default(),
            catch_up: CatchUpConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (environment, file, test map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(n) = parse_positive(&lookup, "RECKON_JOB_PARALLELISM")? {
            config.runner.parallelism = n;
        }
        if let Some(n) = parse::<usize>(&lookup, "RECKON_JOB_MAX_ITERATIONS")? {
            config.runner.max_iterations = Some(n);
        }
        if let Some(secs) = parse::<u64>(&lookup, "RECKON_JOB_MAX_DURATION_SECS")? {
            config.runner.max_duration = Some(Duration::from_secs(secs));
        }

        if let Some(raw) = lookup("RECKON_STALE_TIERS") {
            let tiers: Vec<&str> = raw.split(',').map(str::trim).filter(|t| !t.is_empty()).collect();
            if tiers.is_empty() {
                return Err(ConfigError::invalid("RECKON_STALE_TIERS", &raw, "no tiers listed"));
            }
            config.sweeps = tiers.into_iter().map(TieredProcessorConfig::for_tier).collect();
        }
        let max_rows = parse::<usize>(&lookup, "RECKON_STALE_MAX_ROWS_PER_CALL")?;
        let stale_budget = parse::<u64>(&lookup, "RECKON_STALE_BUDGET")?;
        let stale_parallelism = parse_positive(&lookup, "RECKON_STALE_PARALLELISM")?;
        for sweep in &mut config.sweeps {
            if let Some(n) = max_rows {
                sweep.max_rows_per_call = (n > 0).then_some(n);
            }
            if let Some(b) = stale_budget {
                sweep.budget = Some(b);
            }
            if let Some(p) = stale_parallelism {
                sweep.parallelism = p;
            }
        }

        if let Some(kind) = lookup("RECKON_PUBLISH_KIND") {
            let kind = kind.trim();
            if kind.is_empty() {
                return Err(ConfigError::invalid("RECKON_PUBLISH_KIND", kind, "must not be empty"));
            }
            config.publisher.kind = kind.to_string();
        }
        if let Some(n) = parse_positive(&lookup, "RECKON_PUBLISH_ROWS_PER_TX")? {
            config.publisher.rows_per_transaction = n;
        }
        if let Some(b) = parse::<u64>(&lookup, "RECKON_PUBLISH_BUDGET")? {
            config.publisher.budget = Some(b);
        }

        if let Some(n) = parse_positive(&lookup, "RECKON_CATCHUP_PAGE_SIZE")? {
            config.catch_up.page_size = n;
        }

        if let Some(ms) = parse::<u64>(&lookup, "RECKON_SCHEDULER_POLL_MS")? {
            config.scheduler.poll_interval = Duration::from_millis(ms);
        }

        Ok(config)
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::invalid(key, &raw, e.to_string())),
    }
}

fn parse_positive(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<usize>, ConfigError> {
    match parse::<usize>(lookup, key)? {
        Some(0) => Err(ConfigError::invalid(key, "0", "must be at least 1")),
        other => Ok(other),
    }
}
