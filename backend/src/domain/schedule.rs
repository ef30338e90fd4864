//! Pure calendar arithmetic for recurrence rules.
//!
//! Everything in this module is synchronous and side-effect free: given a
//! frequency pattern and a date window, it answers "on which dates does this
//! rule fire?". Materializing those dates into stored instances is the
//! generator's job, not this module's.

use chrono::{Datelike, Duration, NaiveDate};
use shared::{AdjustmentPolicy, Frequency};

/// Hard cap on iteration steps so a malformed configuration can never loop
/// forever.
const MAX_ITERATIONS: usize = 10_000;

/// Open-ended rules are bounded to this many years past the window start.
const DEFAULT_WINDOW_YEARS: i32 = 5;

/// Compute every date in `[window_start, window_end]` (inclusive) on which
/// the given frequency pattern fires.
///
/// The result is deduplicated by exact date and sorted ascending; callers
/// must not assume the internal iteration order survives.
pub fn compute_occurrences(
    frequency: &Frequency,
    interval: u32,
    window_start: NaiveDate,
    window_end: NaiveDate,
) -> Vec<NaiveDate> {
    let interval = interval.max(1);
    let mut dates = match frequency {
        Frequency::Daily => daily_occurrences(interval, window_start, window_end),
        Frequency::Weekly { days_of_week } => {
            weekly_occurrences(days_of_week, interval, window_start, window_end)
        }
        Frequency::Monthly {
            day_of_month,
            adjustment,
        } => monthly_occurrences(*day_of_month, *adjustment, interval, window_start, window_end),
        Frequency::Yearly {
            month,
            day,
            adjustment,
        } => yearly_occurrences(*month, *day, *adjustment, interval, window_start, window_end),
    };
    dates.sort();
    dates.dedup();
    dates
}

/// Window end used when a rule has no end date: 5 years past the start.
pub fn default_window_end(window_start: NaiveDate) -> NaiveDate {
    shift_months(window_start, 12 * DEFAULT_WINDOW_YEARS)
}

fn daily_occurrences(interval: u32, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    let mut dates = Vec::new();
    let mut current = start;
    for _ in 0..MAX_ITERATIONS {
        if current > end {
            break;
        }
        dates.push(current);
        current += Duration::days(interval as i64);
    }
    dates
}

fn weekly_occurrences(
    days_of_week: &[u8],
    interval: u32,
    start: NaiveDate,
    end: NaiveDate,
) -> Vec<NaiveDate> {
    // An empty day set means "the weekday the rule starts on".
    let days: Vec<u8> = if days_of_week.is_empty() {
        vec![start.weekday().num_days_from_sunday() as u8]
    } else {
        days_of_week.to_vec()
    };

    let mut dates = Vec::new();
    // Anchor each iteration week to its Monday.
    let mut anchor = start - Duration::days(start.weekday().num_days_from_monday() as i64);
    for _ in 0..MAX_ITERATIONS {
        if anchor > end {
            break;
        }
        for day in &days {
            // Weekday indices are 0 = Sunday .. 6 = Saturday; from a Monday
            // anchor, Sunday is the last day of the week (offset 6).
            let offset = (*day as i64 + 6) % 7;
            let date = anchor + Duration::days(offset);
            if date >= start && date <= end {
                dates.push(date);
            }
        }
        anchor += Duration::weeks(interval as i64);
    }
    dates
}

fn monthly_occurrences(
    day_of_month: u8,
    adjustment: AdjustmentPolicy,
    interval: u32,
    start: NaiveDate,
    end: NaiveDate,
) -> Vec<NaiveDate> {
    let mut dates = Vec::new();
    // The cursor always sits on day 1 so that advancing by N months can
    // never overflow into the month after the intended one (Jan 31 + 1
    // month must mean February, not March 3rd).
    let mut cursor = first_of_month(start);
    for _ in 0..MAX_ITERATIONS {
        if cursor > end {
            break;
        }
        if let Some(date) =
            resolve_day_in_month(cursor.year(), cursor.month(), day_of_month as u32, adjustment)
        {
            if date >= start && date <= end {
                dates.push(date);
            }
        }
        cursor = shift_months(cursor, interval as i32);
    }
    dates
}

fn yearly_occurrences(
    month: u8,
    day: u8,
    adjustment: AdjustmentPolicy,
    interval: u32,
    start: NaiveDate,
    end: NaiveDate,
) -> Vec<NaiveDate> {
    let mut dates = Vec::new();
    // Iterate on bare year numbers so a Feb 29 target can never corrupt
    // the year advance.
    let mut year = start.year();
    for _ in 0..MAX_ITERATIONS {
        if year > end.year() {
            break;
        }
        if let Some(date) = resolve_day_in_month(year, month as u32, day as u32, adjustment) {
            if date >= start && date <= end {
                dates.push(date);
            }
        }
        year += interval as i32;
    }
    dates
}

/// Resolve a nominal (year, month, day) into a concrete date, applying the
/// adjustment policy when the day does not exist in that month. `Skip`
/// yields `None`, which is a correct zero-occurrence period, not an error.
fn resolve_day_in_month(
    year: i32,
    month: u32,
    day: u32,
    adjustment: AdjustmentPolicy,
) -> Option<NaiveDate> {
    if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
        return Some(date);
    }
    match adjustment {
        AdjustmentPolicy::Last => NaiveDate::from_ymd_opt(year, month, days_in_month(year, month)),
        AdjustmentPolicy::Next => {
            let (next_year, next_month) = if month >= 12 {
                (year + 1, 1)
            } else {
                (year, month + 1)
            };
            NaiveDate::from_ymd_opt(next_year, next_month, 1)
        }
        AdjustmentPolicy::Skip => None,
    }
}

/// Number of days in the given month, leap-year aware.
pub fn days_in_month(year: i32, month: u32) -> u32 {
    match month {
        1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
        4 | 6 | 9 | 11 => 30,
        2 => {
            if is_leap_year(year) {
                29
            } else {
                28
            }
        }
        _ => 30,
    }
}

fn is_leap_year(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// Shift a date by a signed number of months, clamping the day to the
/// target month's length.
fn shift_months(date: NaiveDate, months: i32) -> NaiveDate {
    let mut year = date.year();
    let mut month = date.month() as i32 + months;
    while month > 12 {
        month -= 12;
        year += 1;
    }
    while month < 1 {
        month += 12;
        year -= 1;
    }
    let day = date.day().min(days_in_month(year, month as u32));
    NaiveDate::from_ymd_opt(year, month as u32, day).unwrap_or(date)
}
