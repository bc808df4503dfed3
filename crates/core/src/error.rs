//! Domain error model.

use thiserror::Error;

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic, business/domain failures (validation,
/// configuration of a single record). Infrastructure concerns belong elsewhere.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. malformed input).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier was invalid (e.g. parse failure).
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A record has no time zone configured.
    #[error("time zone not configured for {0}")]
    MissingTimeZone(String),

    /// A configured time zone name is not a known IANA zone.
    #[error("invalid time zone: {0}")]
    InvalidTimeZone(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn missing_time_zone(owner: impl Into<String>) -> Self {
        Self::MissingTimeZone(owner.into())
    }

    pub fn invalid_time_zone(name: impl Into<String>) -> Self {
        Self::InvalidTimeZone(name.into())
    }
}
