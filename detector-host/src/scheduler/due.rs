//! Due-time evaluation of cron schedules.

use chrono::{DateTime, Utc};
use cron::Schedule;

/// First occurrence of `schedule` strictly after `last`.
pub fn next_occurrence(schedule: &Schedule, last: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&last).next()
}

/// A rule that never ran is due immediately. Otherwise it is due once the first
/// occurrence after its last execution is not in the future.
pub fn is_due(schedule: &Schedule, last: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match last {
        None => true,
        Some(last) => next_occurrence(schedule, last).is_some_and(|next| next <= now),
    }
}
