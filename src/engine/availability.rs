use chrono::{Days, Duration, NaiveDate, TimeZone};
use chrono_tz::Tz;

use crate::clock;
use crate::model::*;

use super::overlap::find_conflict;
use super::WorkingHours;

// ── Slot generation ──────────────────────────────────────────────

/// Hourly candidate spans for `days` consecutive local days in `tz`,
/// starting at `first_day`. Recomputed fresh on every call; only the
/// working-hours fit rule is applied here.
pub(crate) fn candidate_starts(
    first_day: NaiveDate,
    days: u32,
    hours: WorkingHours,
    tz: Tz,
    duration_min: u32,
) -> impl Iterator<Item = Span> {
    (0..days).flat_map(move |d| {
        let date = first_day + Days::new(d as u64);
        day_candidates(date, hours, tz, duration_min)
    })
}

/// Candidates for one local day. The session must fit inside the working
/// window in wall-clock terms; local times erased by a DST gap produce
/// no candidate, times that occur twice resolve to the earlier instant.
fn day_candidates(date: NaiveDate, hours: WorkingHours, tz: Tz, duration_min: u32) -> Vec<Span> {
    let mut out = Vec::new();
    let Some(day_end) = date.and_hms_opt(hours.end_hour, 0, 0) else {
        return out;
    };
    for hour in hours.start_hour..hours.end_hour {
        let Some(naive) = date.and_hms_opt(hour, 0, 0) else {
            continue;
        };
        if naive + Duration::minutes(duration_min as i64) > day_end {
            continue; // duration no longer fits the remaining window
        }
        let Some(local) = tz.from_local_datetime(&naive).earliest() else {
            continue; // DST gap
        };
        let start = local.timestamp_millis();
        out.push(Span::new(start, start + minutes_ms(duration_min)));
    }
    out
}

/// Drop candidates before `earliest` or colliding with either party's
/// calendar, and attach the coach-zone label.
pub(crate) fn filter_available(
    candidates: impl Iterator<Item = Span>,
    earliest: Ms,
    coach_cal: &CalendarState,
    client_cal: Option<&CalendarState>,
    tz: Tz,
) -> Vec<SlotInfo> {
    candidates
        .filter(|span| span.start >= earliest)
        .filter(|span| find_conflict(coach_cal, span, None).is_none())
        .filter(|span| client_cal.is_none_or(|cal| find_conflict(cal, span, None).is_none()))
        .map(|span| SlotInfo {
            start: span.start,
            end: span.end,
            label: clock::slot_label(span.start, tz),
        })
        .collect()
}
