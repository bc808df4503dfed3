//! Invoice task handlers.
//!
//! `GENERATE_INVOICE` produces the invoice for a period and enqueues a
//! `DELIVER_INVOICE` follow-up; `DELIVER_INVOICE` sends it.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use chrono_tz::Tz;
use thiserror::Error;
use tracing::debug;

use reckon_core::{AccountId, InvoiceId};

use super::catch_up::{PERIOD_FORMAT, PERIOD_KEY, TIME_ZONE_KEY};
use crate::tasks::{derived_task_id, ClaimStore, TaskHandlerRegistry, TaskOutcome, TaskRecord, TaskType};

/// Task data key holding the invoice to deliver.
pub const INVOICE_ID_KEY: &str = "invoiceId";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvoiceError {
    /// Worth retrying on a later invocation.
    #[error("transient invoice error: {0}")]
    Transient(String),
    #[error("permanent invoice error: {0}")]
    Permanent(String),
}

impl From<InvoiceError> for TaskOutcome {
    fn from(err: InvoiceError) -> Self {
        match err {
            InvoiceError::Transient(msg) => TaskOutcome::Retry(msg),
            InvoiceError::Permanent(msg) => TaskOutcome::Fatal(msg),
        }
    }
}

/// Produces invoices. Must be idempotent per `(account, period)`: a retried task
/// calls it again for the same period.
pub trait InvoiceGenerator: Send + Sync {
    /// `Ok(None)` when there is nothing to bill for the period.
    fn generate(
        &self,
        account_id: AccountId,
        period_start: NaiveDate,
        zone: Tz,
    ) -> Result<Option<InvoiceId>, InvoiceError>;
}

pub trait InvoiceDeliverer: Send + Sync {
    fn deliver(&self, account_id: AccountId, invoice_id: InvoiceId) -> Result<(), InvoiceError>;
}

pub struct GenerateInvoiceHandler<G: InvoiceGenerator> {
    store: Arc<dyn ClaimStore>,
    generator: G,
}

impl<G: InvoiceGenerator> GenerateInvoiceHandler<G> {
    pub fn new(store: Arc<dyn ClaimStore>, generator: G) -> Self {
        Self { store, generator }
    }

    pub fn handle(&self, task: &TaskRecord) -> TaskOutcome {
        let Some(period) = task
            .data_str(PERIOD_KEY)
            .and_then(|s| NaiveDate::parse_from_str(s, PERIOD_FORMAT).ok())
        else {
            return TaskOutcome::fatal(format!("task {} has no valid {PERIOD_KEY}", task.id));
        };
        let Some(zone) = task.data_str(TIME_ZONE_KEY).and_then(|s| s.parse::<Tz>().ok()) else {
            return TaskOutcome::fatal(format!("task {} has no valid {TIME_ZONE_KEY}", task.id));
        };

        let invoice_id = match self.generator.generate(task.account_id, period, zone) {
            Ok(Some(id)) => id,
            Ok(None) => {
                debug!(task_id = %task.id, account_id = %task.account_id, period = %period, "nothing to invoice");
                return TaskOutcome::Success;
            }
            Err(e) => return e.into(),
        };

        let delivery = TaskRecord::new(task.account_id, TaskType::DeliverInvoice)
            .with_id(derived_task_id(&format!("deliver-invoice:{invoice_id}")))
            .created_at(Utc::now())
            .with_data(INVOICE_ID_KEY, invoice_id.to_string());

        match self.store.save(delivery) {
            Ok(_) => TaskOutcome::Success,
            Err(e) => TaskOutcome::retry(format!("failed to enqueue delivery of invoice {invoice_id}: {e}")),
        }
    }
}

pub struct DeliverInvoiceHandler<D: InvoiceDeliverer> {
    deliverer: D,
}

impl<D: InvoiceDeliverer> DeliverInvoiceHandler<D> {
    pub fn new(deliverer: D) -> Self {
        Self { deliverer }
    }

    pub fn handle(&self, task: &TaskRecord) -> TaskOutcome {
        let Some(invoice_id) = task
            .data_str(INVOICE_ID_KEY)
            .and_then(|s| InvoiceId::from_str(s).ok())
        else {
            return TaskOutcome::fatal(format!("task {} has no valid {INVOICE_ID_KEY}", task.id));
        };

        match self.deliverer.deliver(task.account_id, invoice_id) {
            Ok(()) => TaskOutcome::Success,
            Err(e) => e.into(),
        }
    }
}

/// Register the generate and deliver handlers.
pub fn register_invoice_handlers<G, D>(
    registry: &mut TaskHandlerRegistry,
    store: Arc<dyn ClaimStore>,
    generator: G,
    deliverer: D,
) where
    G: InvoiceGenerator + 'static,
    D: InvoiceDeliverer + 'static,
{
    let generate = GenerateInvoiceHandler::new(store, generator);
    registry.register(TaskType::GenerateInvoice, move |task| generate.handle(task));

    let deliver = DeliverInvoiceHandler::new(deliverer);
    registry.register(TaskType::DeliverInvoice, move |task| deliver.handle(task));
}
