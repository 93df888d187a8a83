use chrono::{DateTime, Duration, Months, Utc};

use crate::error::{Result, SchedulerError};
use crate::types::{in_storable_range, Frequency, MAX_YEAR};

/// Compute the next eligible run time for a task that started at `from`.
///
/// `from` is the observed execution start, never the previous `next_run_at`:
/// a late run pushes the schedule forward instead of queueing catch-up runs.
///
/// Returns `None` for `Manual`. Calendar variants add whole months and clamp
/// to the last day of the target month, so Jan 31 + 1 month is Feb 28 (or
/// Feb 29 in a leap year) at the same time of day.
pub fn compute_next_run(frequency: Frequency, from: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
    let next = match frequency {
        Frequency::Manual => return Ok(None),
        Frequency::Hourly => from.checked_add_signed(Duration::hours(1)),
        Frequency::Daily => from.checked_add_signed(Duration::hours(24)),
        Frequency::Weekly => from.checked_add_signed(Duration::days(7)),
        // chrono's month arithmetic already clamps to the last valid day.
        Frequency::Monthly => from.checked_add_months(Months::new(1)),
        Frequency::Yearly => from.checked_add_months(Months::new(12)),
    };

    match next {
        Some(next) if in_storable_range(next) => Ok(Some(next)),
        _ => Err(SchedulerError::Configuration(format!(
            "{frequency} schedule from {from} runs past year {MAX_YEAR}"
        ))),
    }
}
