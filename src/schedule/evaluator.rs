//! Pure due-ness evaluation for recurring schedules.
//!
//! Maps an instant to the period it falls in and compares that period with
//! the last one credited. No I/O, no clock access: `now` is always passed in.

use chrono::{DateTime, Datelike, Days, NaiveDate, Utc};

use super::models::{PeriodMarker, Schedule, ScheduleCursor, ScheduleUnit};

/// Period marker for the period `now` falls in.
///
/// Returns `None` only when the date arithmetic leaves chrono's supported
/// calendar range.
pub fn period_marker(schedule: &Schedule, now: DateTime<Utc>) -> Option<PeriodMarker> {
    let today = now.date_naive();
    let start = match schedule.unit() {
        ScheduleUnit::Day => today,
        ScheduleUnit::Week => {
            let weekday = today.weekday().num_days_from_monday();
            let back = (weekday + 7 - schedule.anchor()) % 7;
            today.checked_sub_days(Days::new(u64::from(back)))?
        }
        ScheduleUnit::Month => {
            let this_month = anchored_day(today.year(), today.month(), schedule.anchor())?;
            if this_month <= today {
                this_month
            } else {
                let (year, month) = previous_month(today.year(), today.month());
                anchored_day(year, month, schedule.anchor())?
            }
        }
    };
    Some(PeriodMarker(start))
}

/// Decide whether an allowance is due at `now`.
///
/// Returns the marker of the period to credit when the cursor is absent or
/// behind the current period. A cursor at or ahead of the current period
/// (clock skew, another instance already ran) is never due.
pub fn is_due(
    schedule: &Schedule,
    cursor: Option<&ScheduleCursor>,
    now: DateTime<Utc>,
) -> Option<PeriodMarker> {
    let current = period_marker(schedule, now)?;
    match cursor {
        Some(cursor) if cursor.last_run_marker >= current => None,
        _ => Some(current),
    }
}

fn anchored_day(year: i32, month: u32, anchor: u32) -> Option<NaiveDate> {
    let day = anchor.min(days_in_month(year, month)?);
    NaiveDate::from_ymd_opt(year, month, day)
}

fn days_in_month(year: i32, month: u32) -> Option<u32> {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)?
        .pred_opt()
        .map(|last| last.day())
}

fn previous_month(year: i32, month: u32) -> (i32, u32) {
    if month == 1 {
        (year - 1, 12)
    } else {
        (year, month - 1)
    }
}
