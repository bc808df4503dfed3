//! Infrastructure error taxonomy.
//!
//! The engine never lets these escape a scheduled invocation; they decide whether
//! work is retried on the next schedule (transient) or logged and skipped.

use thiserror::Error;

use reckon_core::TaskId;

/// Storage-level failure from a claim store or stale-marker store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Deadlock, lock-not-available or serialization failure. Recovery is deferred
    /// to the next scheduled invocation.
    #[error("lock conflict: {0}")]
    LockConflict(String),
    #[error("task not found: {0}")]
    NotFound(TaskId),
    #[error("record already exists: {0}")]
    AlreadyExists(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    pub fn lock_conflict(msg: impl Into<String>) -> Self {
        Self::LockConflict(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// True for contention that should end the invocation quietly.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::LockConflict(_))
    }
}

/// Failure of a stale-resolution call (bulk tier sweep or single stream read).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("lock conflict: {0}")]
    LockConflict(String),
    /// The marker or tier names a kind this resolver cannot handle. Permanent.
    #[error("unsupported kind: {0}")]
    UnsupportedKind(String),
    #[error("resolution failed: {0}")]
    Failed(String),
}

impl ResolveError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ResolveError::LockConflict(_))
    }
}

impl From<StoreError> for ResolveError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::LockConflict(msg) => ResolveError::LockConflict(msg),
            other => ResolveError::Failed(other.to_string()),
        }
    }
}

/// Downstream delivery failure (stream publish, invoice delivery transport).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("publish failed: {0}")]
pub struct PublishError(pub String);

impl PublishError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Account directory lookup failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("account directory error: {0}")]
pub struct DirectoryError(pub String);

impl DirectoryError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_lock_conflicts_are_transient() {
        assert!(StoreError::lock_conflict("deadlock").is_transient());
        assert!(!StoreError::storage("disk full").is_transient());
        assert!(!StoreError::NotFound(TaskId::new()).is_transient());
    }

    #[test]
    fn store_lock_conflict_stays_transient_when_resolving() {
        let err: ResolveError = StoreError::lock_conflict("55P03").into();
        assert!(err.is_transient());

        let err: ResolveError = StoreError::storage("boom").into();
        assert!(matches!(err, ResolveError::Failed(msg) if msg.contains("boom")));
    }
}
