//! Stale-state reconciliation.
//!
//! Ingest marks derived state as stale; these components resolve it later:
//!
//! - `TieredStaleProcessor` sweeps one tier through a bulk resolver until drained
//!   or out of budget.
//! - `StaleStreamPublisher` publishes the latest value of each stream flagged by a
//!   marker, deleting the marker only after the publish succeeded.

pub mod marker;
pub mod postgres;
pub mod publisher;
pub mod tiered;

pub use marker::{InMemoryStaleMarkerStore, MarkerCursor, StaleMarker, StaleMarkerKey, StaleMarkerStore};
pub use postgres::{PostgresStaleBatchResolver, PostgresStaleMarkerStore};
pub use publisher::{
    PublishSummary, StalePublisherConfig, StaleStreamPublisher, StreamPublisher, StreamValue,
    StreamValueResolver,
};
pub use tiered::{StaleBatchResolver, StopReason, SweepSummary, TieredProcessorConfig, TieredStaleProcessor};
