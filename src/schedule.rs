//! Run-level airtime scheduling
//!
//! Decides whether a series is worth polling at all on this invocation. The
//! rule's airtime is projected onto the current week (weekly cour schedule)
//! and the series is due when the current time falls within the grace window
//! around that instant. This keeps a cron-driven setup from hammering the
//! tracker for every series on every run.
//!
//! This is separate from the evaluator's availability gate, which compares
//! against the configured airtime instant itself to protect a premiere from
//! fake early uploads.

use chrono::{DateTime, Datelike, Duration, FixedOffset, Utc};

use crate::config::SeriesRule;

/// Returns true when the series should be polled at `now`.
///
/// Series without an airtime are always due. Otherwise the airtime's weekday
/// and time-of-day are projected into the current week (in the airtime's own
/// UTC offset) and `now` must be within ±grace of the projected instant; the
/// window seven days earlier is also checked so a poll shortly after
/// midnight-crossing windows is not missed.
pub fn is_due(rule: &SeriesRule, now: DateTime<Utc>) -> bool {
    let Some(airtime) = rule.airtime else {
        return true;
    };

    let now_local = now.with_timezone(airtime.offset());
    let this_week = project_to_week_of(airtime, now_local);
    let grace = Duration::minutes(rule.grace_minutes);

    let in_window = |instant: DateTime<FixedOffset>| {
        instant - grace <= now_local && now_local <= instant + grace
    };

    if in_window(this_week) {
        return true;
    }
    let last_week = this_week - Duration::days(7);
    if in_window(last_week) {
        tracing::debug!(series = %rule.id, "inside last week's airtime window");
        return true;
    }
    false
}

/// Moves the airtime's weekday and time-of-day into the week of `reference`.
fn project_to_week_of(
    airtime: DateTime<FixedOffset>,
    reference: DateTime<FixedOffset>,
) -> DateTime<FixedOffset> {
    let air_day = airtime.weekday().num_days_from_monday() as i64;
    let ref_day = reference.weekday().num_days_from_monday() as i64;
    let days_ahead = (air_day - ref_day).rem_euclid(7);

    let date = reference.date_naive() + Duration::days(days_ahead);
    // A fixed offset maps every naive datetime to exactly one instant.
    date.and_time(airtime.time())
        .and_local_timezone(*airtime.offset())
        .earliest()
        .expect("fixed offset has no DST gaps")
}
