//! Stale stream publisher.
//!
//! Drains stale markers of one kind: for each marker it reads the stream's most
//! recent value, publishes it downstream and only then deletes the marker, in the
//! same cursor transaction. Publishing is at-least-once; a crash between publish
//! and commit republishes the same value on the next invocation.
//!
//! Per-marker results:
//!
//! | resolver | publisher | marker |
//! |---|---|---|
//! | value | `Ok(true)` | deleted |
//! | value | `Ok(false)` / error | kept |
//! | no value | | deleted (nothing to publish) |
//! | unsupported kind | | deleted (poison marker) |
//! | lock conflict | | invocation aborted, cursor rolled back |
//! | other error | | kept |

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use reckon_core::StreamId;

use super::marker::{MarkerCursor, StaleMarker, StaleMarkerStore};
use super::tiered::StopReason;
use crate::error::{PublishError, ResolveError, StoreError};
use crate::scheduler::ScheduledJob;
use crate::workers::{run_workers, LoopBudget};

/// Latest observed value of a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamValue {
    pub stream_id: StreamId,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl StreamValue {
    pub fn new(stream_id: StreamId, timestamp: DateTime<Utc>) -> Self {
        Self {
            stream_id,
            timestamp,
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Reads the most recent value of a stream.
pub trait StreamValueResolver: Send + Sync {
    fn most_recent_value(&self, stream_id: &StreamId) -> Result<Option<StreamValue>, ResolveError>;
}

impl<T: StreamValueResolver + ?Sized> StreamValueResolver for std::sync::Arc<T> {
    fn most_recent_value(&self, stream_id: &StreamId) -> Result<Option<StreamValue>, ResolveError> {
        (**self).most_recent_value(stream_id)
    }
}

/// Downstream sink for stream values.
pub trait StreamPublisher: Send + Sync {
    /// Publish `value`. `Ok(true)` means it was delivered and its marker may go.
    fn publish(&self, value: &StreamValue) -> Result<bool, PublishError>;
}

impl<T: StreamPublisher + ?Sized> StreamPublisher for std::sync::Arc<T> {
    fn publish(&self, value: &StreamValue) -> Result<bool, PublishError> {
        (**self).publish(value)
    }
}

#[derive(Debug, Clone)]
pub struct StalePublisherConfig {
    pub name: String,
    /// Marker kind this publisher drains.
    pub kind: String,
    /// Markers locked and committed together.
    pub rows_per_transaction: usize,
    /// Markers examined per invocation across all workers (`None` = unbounded).
    pub budget: Option<u64>,
    pub parallelism: usize,
    pub max_duration: Option<Duration>,
}

impl Default for StalePublisherConfig {
    fn default() -> Self {
        Self {
            name: "stale-publisher".to_string(),
            kind: "flux".to_string(),
            rows_per_transaction: 1,
            budget: Some(1000),
            parallelism: 1,
            max_duration: Some(Duration::from_secs(300)),
        }
    }
}

impl StalePublisherConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn with_rows_per_transaction(mut self, rows: usize) -> Self {
        self.rows_per_transaction = rows.max(1);
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

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishSummary {
    pub kind: String,
    pub examined: u64,
    pub published: u64,
    /// Markers deleted without publishing (no value, unsupported kind).
    pub dropped: u64,
    /// Markers kept for a later invocation.
    pub failed: u64,
    pub stopped: StopReason,
}

impl PublishSummary {
    fn empty(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            examined: 0,
            published: 0,
            dropped: 0,
            failed: 0,
            stopped: StopReason::Drained,
        }
    }

    fn merge(mut self, other: PublishSummary) -> Self {
        self.examined += other.examined;
        self.published += other.published;
        self.dropped += other.dropped;
        self.failed += other.failed;
        self.stopped = self.stopped.worst(other.stopped);
        self
    }
}

enum MarkerResult {
    Published,
    Dropped,
    Kept,
}

/// Publishes the latest value of streams flagged by stale markers.
pub struct StaleStreamPublisher<M, V, P>
where
    M: StaleMarkerStore,
    V: StreamValueResolver,
    P: StreamPublisher,
{
    markers: M,
    resolver: V,
    publisher: P,
    config: StalePublisherConfig,
}

impl<M, V, P> StaleStreamPublisher<M, V, P>
where
    M: StaleMarkerStore,
    V: StreamValueResolver,
    P: StreamPublisher,
{
    pub fn new(markers: M, resolver: V, publisher: P, config: StalePublisherConfig) -> Self {
        Self {
            markers,
            resolver,
            publisher,
            config,
        }
    }

    pub fn config(&self) -> &StalePublisherConfig {
        &self.config
    }

    pub fn execute(&self) -> PublishSummary {
        let started = Instant::now();
        let budget = LoopBudget::new(self.config.max_duration, self.config.budget);

        let summary = run_workers(&self.config.name, self.config.parallelism, |worker| {
            self.drain(worker, &budget)
        })
        .into_iter()
        .fold(PublishSummary::empty(&self.config.kind), PublishSummary::merge);

        info!(
            job = %self.config.name,
            kind = %summary.kind,
            examined = summary.examined,
            published = summary.published,
            dropped = summary.dropped,
            failed = summary.failed,
            stopped = %summary.stopped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "stale publish finished"
        );

        summary
    }

    fn drain(&self, worker: usize, budget: &LoopBudget) -> PublishSummary {
        let name = &self.config.name;
        let mut summary = PublishSummary::empty(&self.config.kind);
        // Streams whose markers this worker already kept; not re-read this invocation.
        let mut kept: Vec<StreamId> = Vec::new();

        summary.stopped = loop {
            if budget.deadline_passed() {
                break StopReason::DeadlineReached;
            }
            if budget.exhausted() {
                break StopReason::BudgetExhausted;
            }

            let mut cursor = match self.markers.open_cursor(
                &self.config.kind,
                self.config.rows_per_transaction,
                &kept,
            ) {
                Ok(cursor) => cursor,
                Err(e) => break store_stop(name, worker, "open marker cursor", e),
            };

            if cursor.markers().is_empty() {
                break StopReason::Drained;
            }

            if let Err(reason) = self.publish_batch(worker, cursor.as_mut(), &mut summary, &mut kept, budget) {
                break reason;
            }

            if let Err(e) = cursor.commit() {
                break store_stop(name, worker, "commit marker cursor", e);
            }

            if budget.exhausted() {
                break StopReason::BudgetExhausted;
            }
        };

        debug!(job = %name, worker, stopped = %summary.stopped, "publisher worker stopped");
        summary
    }

    /// Handle every marker of one cursor. `Err` aborts the invocation and rolls the
    /// cursor back.
    fn publish_batch(
        &self,
        worker: usize,
        cursor: &mut dyn MarkerCursor,
        summary: &mut PublishSummary,
        kept: &mut Vec<StreamId>,
        budget: &LoopBudget,
    ) -> Result<(), StopReason> {
        let name = &self.config.name;
        let batch: Vec<StaleMarker> = cursor.markers().to_vec();

        for marker in batch {
            summary.examined += 1;
            let key = marker.key();

            let result = match self.resolver.most_recent_value(&marker.stream_id) {
                Ok(Some(value)) => match self.publisher.publish(&value) {
                    Ok(true) => MarkerResult::Published,
                    Ok(false) => {
                        debug!(job = %name, marker = %key, "publisher declined value, keeping marker");
                        MarkerResult::Kept
                    }
                    Err(e) => {
                        error!(job = %name, stream_id = %marker.stream_id, error = %e, "failed to publish stream value");
                        MarkerResult::Kept
                    }
                },
                Ok(None) => MarkerResult::Dropped,
                Err(ResolveError::UnsupportedKind(kind)) => {
                    warn!(job = %name, marker = %key, kind = %kind, "unsupported marker kind, dropping");
                    MarkerResult::Dropped
                }
                Err(ResolveError::LockConflict(msg)) => {
                    warn!(job = %name, marker = %key, error = %msg, "lock contention, ending publish");
                    return Err(StopReason::LockContention);
                }
                Err(e) => {
                    error!(job = %name, stream_id = %marker.stream_id, error = %e, "failed to resolve stream value");
                    MarkerResult::Kept
                }
            };

            match result {
                MarkerResult::Published | MarkerResult::Dropped => {
                    if let Err(e) = cursor.delete(&key) {
                        return Err(store_stop(name, worker, "delete marker", e));
                    }
                    if matches!(result, MarkerResult::Published) {
                        summary.published += 1;
                    } else {
                        summary.dropped += 1;
                    }
                }
                MarkerResult::Kept => {
                    summary.failed += 1;
                    kept.push(marker.stream_id);
                }
            }

            budget.consume(1);
        }

        Ok(())
    }
}

fn store_stop(name: &str, worker: usize, operation: &str, err: StoreError) -> StopReason {
    if err.is_transient() {
        warn!(job = %name, worker, operation, error = %err, "lock contention, ending publish");
        StopReason::LockContention
    } else {
        error!(job = %name, worker, operation, error = %err, "marker store failure");
        StopReason::Failed
    }
}

impl<M, V, P> ScheduledJob for StaleStreamPublisher<M, V, P>
where
    M: StaleMarkerStore,
    V: StreamValueResolver,
    P: StreamPublisher,
{
    fn name(&self) -> &str {
        &self.config.name
    }

    fn run(&self) {
        self.execute();
    }
}
