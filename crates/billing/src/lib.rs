//! `reckon-billing`
//!
//! **Responsibility:** pure billing-period rules.
//!
//! This crate decides *which* monthly periods an account still needs invoice tasks
//! for. It never touches storage, threads or logging; the infra layer drives it.

pub mod account;
pub mod period;

pub use account::{Account, Page, PageRequest};
pub use period::{
    invoiced_through, next_period, period_start, plan_catch_up, previous_period, start_of_day,
    target_end,
};
