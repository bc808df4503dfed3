//! Monthly invoicing on top of the task queue.
//!
//! - `catch_up`: enqueues a `GenerateInvoice` task for every missing period of
//!   every billable account.
//! - `handlers`: generate and deliver invoices when those tasks are claimed.

pub mod catch_up;
pub mod handlers;

pub use catch_up::{
    AccountDirectory, CatchUpConfig, CatchUpError, CatchUpSummary, CatchUpTaskCreator,
    InMemoryAccountDirectory, PERIOD_KEY, TIME_ZONE_KEY,
};
pub use handlers::{
    register_invoice_handlers, DeliverInvoiceHandler, GenerateInvoiceHandler, InvoiceDeliverer,
    InvoiceError, InvoiceGenerator, INVOICE_ID_KEY,
};
