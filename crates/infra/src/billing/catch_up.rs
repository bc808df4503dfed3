//! Monthly invoice catch-up.
//!
//! For every billable account, enqueue one `GenerateInvoice` task per monthly
//! period between the last invoiced period end and the start of the current
//! month in the account's time zone. Task ids are derived from
//! `(account, period)`, so a re-run overwrites pending tasks rather than
//! duplicating them.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{PoisonError, RwLock};
use std::time::Instant;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info};

use reckon_billing::{
    invoiced_through, plan_catch_up, start_of_day, target_end, Account, Page, PageRequest,
};
use reckon_core::{AccountId, DomainError};

use crate::error::{DirectoryError, StoreError};
use crate::scheduler::ScheduledJob;
use crate::tasks::{derived_task_id, ClaimStore, TaskRecord, TaskType};
use crate::workers::panic_message;

/// Task data key holding the period start (`YYYY-MM-DD`).
pub const PERIOD_KEY: &str = "period";
/// Task data key holding the account's IANA time zone.
pub const TIME_ZONE_KEY: &str = "timeZone";

pub(crate) const PERIOD_FORMAT: &str = "%Y-%m-%d";

/// Source of billable accounts and their invoicing history.
pub trait AccountDirectory: Send + Sync {
    fn find_billable_accounts(&self, page: PageRequest) -> Result<Page<Account>, DirectoryError>;

    /// End boundary of the most recently generated invoice, if any.
    fn last_invoiced_period_end(&self, account_id: AccountId) -> Result<Option<NaiveDate>, DirectoryError>;
}

impl<T: AccountDirectory + ?Sized> AccountDirectory for std::sync::Arc<T> {
    fn find_billable_accounts(&self, page: PageRequest) -> Result<Page<Account>, DirectoryError> {
        (**self).find_billable_accounts(page)
    }

    fn last_invoiced_period_end(&self, account_id: AccountId) -> Result<Option<NaiveDate>, DirectoryError> {
        (**self).last_invoiced_period_end(account_id)
    }
}

/// Why one account could not be caught up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatchUpError {
    #[error("account {0} has no time zone")]
    MissingTimeZone(AccountId),
    #[error("account {account_id} has invalid time zone {zone:?}")]
    InvalidTimeZone { account_id: AccountId, zone: String },
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("account {account_id}: {message}")]
    Invalid { account_id: AccountId, message: String },
}

impl CatchUpError {
    fn from_domain(account_id: AccountId, err: DomainError) -> Self {
        match err {
            DomainError::MissingTimeZone(_) => CatchUpError::MissingTimeZone(account_id),
            DomainError::InvalidTimeZone(zone) => CatchUpError::InvalidTimeZone { account_id, zone },
            other => CatchUpError::Invalid {
                account_id,
                message: other.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct CatchUpConfig {
    pub name: String,
    /// Accounts requested per directory page.
    pub page_size: usize,
}

impl Default for CatchUpConfig {
    fn default() -> Self {
        Self {
            name: "invoice-catch-up".to_string(),
            page_size: 50,
        }
    }
}

impl CatchUpConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CatchUpSummary {
    pub accounts: u64,
    pub tasks_created: u64,
    pub account_errors: u64,
}

/// Enqueues the invoice generation tasks each account is missing.
pub struct CatchUpTaskCreator<D: AccountDirectory, S: ClaimStore> {
    directory: D,
    store: S,
    config: CatchUpConfig,
}

impl<D: AccountDirectory, S: ClaimStore> CatchUpTaskCreator<D, S> {
    pub fn new(directory: D, store: S, config: CatchUpConfig) -> Self {
        Self {
            directory,
            store,
            config,
        }
    }

    pub fn execute(&self) -> CatchUpSummary {
        self.execute_at(Utc::now())
    }

    /// Run the catch-up as of `now`.
    pub fn execute_at(&self, now: DateTime<Utc>) -> CatchUpSummary {
        let name = &self.config.name;
        let started = Instant::now();
        let mut summary = CatchUpSummary::default();
        let mut request = PageRequest::first(self.config.page_size);

        loop {
            let page = match self.directory.find_billable_accounts(request) {
                Ok(page) => page,
                Err(e) => {
                    error!(job = %name, offset = request.offset, error = %e, "failed to list billable accounts");
                    break;
                }
            };

            for account in &page.items {
                summary.accounts += 1;
                let result = panic::catch_unwind(AssertUnwindSafe(|| self.catch_up_account(account, now)));
                match result {
                    Ok(Ok(created)) => summary.tasks_created += created as u64,
                    Ok(Err(e)) => {
                        summary.account_errors += 1;
                        error!(job = %name, account_id = %account.id, error = %e, "invoice catch-up failed for account");
                    }
                    Err(payload) => {
                        summary.account_errors += 1;
                        error!(
                            job = %name,
                            account_id = %account.id,
                            panic = %panic_message(payload.as_ref()),
                            "invoice catch-up panicked for account"
                        );
                    }
                }
            }

            if page.is_last() {
                break;
            }
            let next = request.next(&page);
            if next.offset <= request.offset {
                // The directory echoed a stale offset; stop rather than loop.
                error!(job = %name, offset = request.offset, "account directory did not advance");
                break;
            }
            request = next;
        }

        info!(
            job = %name,
            accounts = summary.accounts,
            tasks_created = summary.tasks_created,
            account_errors = summary.account_errors,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "invoice catch-up finished"
        );

        summary
    }

    /// Enqueue the missing periods of one account. Returns the number of tasks saved.
    fn catch_up_account(&self, account: &Account, now: DateTime<Utc>) -> Result<usize, CatchUpError> {
        let zone = account
            .zone()
            .map_err(|e| CatchUpError::from_domain(account.id, e))?;

        let target = target_end(now, zone);
        let last = self.directory.last_invoiced_period_end(account.id)?;
        let from = invoiced_through(last, target);
        let periods = plan_catch_up(from, target);

        for period in &periods {
            let period_key = period.format(PERIOD_FORMAT).to_string();
            let task = TaskRecord::new(account.id, TaskType::GenerateInvoice)
                .with_id(derived_task_id(&format!("generate-invoice:{}:{}", account.id, period_key)))
                .created_at(start_of_day(zone, *period))
                .with_data(PERIOD_KEY, period_key)
                .with_data(TIME_ZONE_KEY, zone.name());
            self.store.save(task)?;
        }

        if !periods.is_empty() {
            debug!(
                job = %self.config.name,
                account_id = %account.id,
                from = %from,
                target = %target,
                periods = periods.len(),
                "enqueued invoice periods"
            );
        }

        Ok(periods.len())
    }
}

impl<D: AccountDirectory, S: ClaimStore> ScheduledJob for CatchUpTaskCreator<D, S> {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn run(&self) {
        self.execute();
    }
}

/// In-memory account directory for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryAccountDirectory {
    accounts: RwLock<Vec<Account>>,
    last_invoiced: RwLock<HashMap<AccountId, NaiveDate>>,
}

impl InMemoryAccountDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_account(&self, account: Account) {
        self.accounts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(account);
    }

    pub fn set_last_invoiced(&self, account_id: AccountId, period_end: NaiveDate) {
        self.last_invoiced
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(account_id, period_end);
    }
}

impl AccountDirectory for InMemoryAccountDirectory {
    fn find_billable_accounts(&self, page: PageRequest) -> Result<Page<Account>, DirectoryError> {
        let accounts = self.accounts.read().unwrap_or_else(PoisonError::into_inner);
        let items = accounts
            .iter()
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect();
        Ok(Page::new(items, page.offset, accounts.len()))
    }

    fn last_invoiced_period_end(&self, account_id: AccountId) -> Result<Option<NaiveDate>, DirectoryError> {
        Ok(self
            .last_invoiced
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&account_id)
            .copied())
    }
}
