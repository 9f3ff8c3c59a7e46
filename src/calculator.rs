//! Next-occurrence calculation.
//!
//! Pure functions over a `Cadence` and a reference instant. All arithmetic is
//! done on the UTC calendar; the rule's timezone is advisory only. The
//! time-of-day of the reference is carried through unchanged.

use chrono::{DateTime, Datelike, Days, NaiveDate, Utc, Weekday};

use crate::domain::{Cadence, Frequency, MonthlyAnchor};
use crate::error::{Result, SchedulerError};

/// Compute the next occurrence strictly after `reference`.
///
/// - daily: `reference + interval` days
/// - weekly: the first `weekday` strictly after `reference`, plus
///   `7 * (interval - 1)` days
/// - monthly: month advanced by `interval`, day set to the anchor and clamped
///   to the length of the resulting month (or snapped to its last day)
/// - yearly: year advanced by `interval`; 29 February clamps to the 28th in
///   non-leap years
///
/// Fails with `InvalidRule` only when the result is outside chrono's range.
pub fn compute_next_run_at(cadence: &Cadence, reference: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let interval = cadence.interval.get();
    let naive = reference.naive_utc();
    let date = naive.date();

    let next_date = match cadence.frequency {
        Frequency::Daily => date.checked_add_days(Days::new(u64::from(interval))),
        Frequency::Weekly { weekday } => {
            date.checked_add_days(Days::new(weekly_offset_days(date.weekday(), weekday, interval)))
        }
        Frequency::Monthly { anchor } => shift_months(date, interval).and_then(|(year, month)| {
            let last = days_in_month(year, month)?;
            let day = match anchor {
                MonthlyAnchor::FixedDay(day) => day.get().min(last),
                MonthlyAnchor::LastDay => last,
            };
            NaiveDate::from_ymd_opt(year, month, day)
        }),
        Frequency::Yearly => i32::try_from(interval)
            .ok()
            .and_then(|n| date.year().checked_add(n))
            .and_then(|year| {
                let day = date.day().min(days_in_month(year, date.month())?);
                NaiveDate::from_ymd_opt(year, date.month(), day)
            }),
    };

    next_date
        .map(|d| d.and_time(naive.time()).and_utc())
        .ok_or_else(|| {
            SchedulerError::InvalidRule(format!(
                "next occurrence after {} ({}) is out of range",
                reference,
                cadence.describe()
            ))
        })
}

/// The next `count` occurrences after `from`, each computed from the previous.
pub fn upcoming(cadence: &Cadence, from: DateTime<Utc>, count: usize) -> Result<Vec<DateTime<Utc>>> {
    let mut out = Vec::with_capacity(count);
    let mut cursor = from;
    for _ in 0..count {
        cursor = compute_next_run_at(cadence, cursor)?;
        out.push(cursor);
    }
    Ok(out)
}

/// Days from `current` to the next qualifying `target`.
///
/// `delta = target - current` on the 1..=7 scale. A non-positive delta means
/// this week's occurrence is today or already past, so the first candidate is
/// next week's. Every extra interval step adds a full week.
fn weekly_offset_days(current: Weekday, target: Weekday, interval: u32) -> u64 {
    let delta = i64::from(target.number_from_monday()) - i64::from(current.number_from_monday());
    let first = if delta <= 0 { delta + 7 } else { delta };
    // first is in 1..=7
    first as u64 + 7 * u64::from(interval - 1)
}

/// (year, month) after advancing `date`'s month by `months`.
fn shift_months(date: NaiveDate, months: u32) -> Option<(i32, u32)> {
    let total = i64::from(date.year()) * 12 + i64::from(date.month0()) + i64::from(months);
    let year = i32::try_from(total.div_euclid(12)).ok()?;
    let month = total.rem_euclid(12) as u32 + 1;
    Some((year, month))
}

fn days_in_month(year: i32, month: u32) -> Option<u32> {
    let (next_year, next_month) = if month == 12 { (year.checked_add(1)?, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)?
        .pred_opt()
        .map(|d| d.day())
}
