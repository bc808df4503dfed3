//! Billable accounts and offset/limit paging over account listings.

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use reckon_core::{AccountId, DomainError, DomainResult};

/// A billable account as seen by the task creator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    /// IANA time zone name (e.g. `Pacific/Auckland`). Billing periods are calendar
    /// months in this zone.
    pub time_zone: Option<String>,
}

impl Account {
    pub fn new(id: AccountId, time_zone: impl Into<String>) -> Self {
        Self {
            id,
            time_zone: Some(time_zone.into()),
        }
    }

    pub fn without_time_zone(id: AccountId) -> Self {
        Self { id, time_zone: None }
    }

    /// Resolve the configured time zone.
    ///
    /// Both a missing and an unknown zone are configuration errors for this
    /// account only.
    pub fn zone(&self) -> DomainResult<Tz> {
        let name = self
            .time_zone
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| DomainError::missing_time_zone(format!("account {}", self.id)))?;

        name.parse::<Tz>()
            .map_err(|_| DomainError::invalid_time_zone(name.to_string()))
    }
}

/// Offset/limit page request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub offset: usize,
    pub limit: usize,
}

impl PageRequest {
    pub fn first(limit: usize) -> Self {
        Self {
            offset: 0,
            limit: limit.max(1),
        }
    }

    /// Request following `page`, keeping the same limit.
    pub fn next<T>(&self, page: &Page<T>) -> Self {
        Self {
            offset: page.next_offset(),
            limit: self.limit,
        }
    }
}

/// One page of results plus the total reported by the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub offset: usize,
    pub total: usize,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, offset: usize, total: usize) -> Self {
        Self { items, offset, total }
    }

    pub fn next_offset(&self) -> usize {
        self.offset + self.items.len()
    }

    /// True when no further page should be requested.
    ///
    /// An empty page always ends iteration, even if `total` claims otherwise.
    pub fn is_last(&self) -> bool {
        self.items.is_empty() || self.next_offset() >= self.total
    }
}
