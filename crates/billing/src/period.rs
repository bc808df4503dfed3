//! Monthly billing periods and catch-up planning.
//!
//! A period is identified by its start date (the 1st of a calendar month in the
//! account's zone). Periods are contiguous: the end of one is the start of the next.

use chrono::{DateTime, Datelike, Months, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

/// First day of the month containing `date`.
pub fn period_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// Start of the period after the one starting at `start`.
///
/// `None` only at the far end of the calendar range.
pub fn next_period(start: NaiveDate) -> Option<NaiveDate> {
    start.checked_add_months(Months::new(1))
}

/// Start of the period before the one starting at `start`.
pub fn previous_period(start: NaiveDate) -> Option<NaiveDate> {
    start.checked_sub_months(Months::new(1))
}

/// The boundary an account must be invoiced up to at instant `now`: the start of
/// the current month in the account's zone.
pub fn target_end(now: DateTime<Utc>, zone: Tz) -> NaiveDate {
    period_start(now.with_timezone(&zone).date_naive())
}

/// Where catch-up starts for an account.
///
/// The last invoiced period end when known, otherwise one period before
/// `target_end` (new accounts are billed for the last complete month only).
pub fn invoiced_through(last_invoiced_end: Option<NaiveDate>, target_end: NaiveDate) -> NaiveDate {
    match last_invoiced_end {
        Some(end) => end,
        None => previous_period(target_end).unwrap_or(target_end),
    }
}

/// Every period start from `invoiced_through` (inclusive) up to `target_end`
/// (exclusive), in order.
///
/// Dates are computed as offsets from `invoiced_through` rather than by repeated
/// stepping, so a boundary on the 31st does not drift after a short month.
pub fn plan_catch_up(invoiced_through: NaiveDate, target_end: NaiveDate) -> Vec<NaiveDate> {
    let mut periods = Vec::new();
    let mut n: u32 = 0;
    while let Some(start) = invoiced_through.checked_add_months(Months::new(n)) {
        if start >= target_end {
            break;
        }
        periods.push(start);
        n += 1;
    }
    periods
}

/// The UTC instant of local midnight on `date` in `zone`.
///
/// When midnight falls in a DST gap the first valid local time after it is used.
pub fn start_of_day(zone: Tz, date: NaiveDate) -> DateTime<Utc> {
    let midnight = date.and_time(NaiveTime::MIN);
    for hour in 0..4 {
        let local = midnight + chrono::Duration::hours(hour);
        if let Some(dt) = zone.from_local_datetime(&local).earliest() {
            return dt.with_timezone(&Utc);
        }
    }
    Utc.from_utc_datetime(&midnight)
}
