//! Cadence evaluation — how often a canary is expected to report.
//!
//! A cadence is either a positive number of seconds, or a schedule of one or
//! more crontab-style entries whose sixth field is the number of seconds
//! that applies while that entry is active. All calendar math is pinned to
//! naive UTC: schedule fields are matched against UTC wall-clock labels and
//! deadlines are naive UTC instants. DST is deliberately out of scope.

pub mod crontab;
pub mod schedule;

use chrono::{Duration, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::CanaryError;

pub use schedule::{Activity, CronTabSchedule, Window};

/// Entry separator for the single-line schedule form used over HTTP.
pub const SCHEDULE_DELIMITER: char = ';';

/// Errors from schedule parsing and window iteration.
#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("{0}")]
    Invalid(String),

    #[error("multiple schedule entries active at {0}")]
    Overlap(NaiveDateTime),

    #[error("schedule has no entries")]
    Empty,
}

/// A canary's declared cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Periodicity {
    /// Expect a trigger every N seconds.
    Seconds(f64),
    /// Single-line crontab schedule (`;`-delimited entries).
    Schedule(String),
}

impl Periodicity {
    /// Interpret a query/CLI parameter: strings of digits and dots are
    /// numeric cadences, everything else is treated as a schedule.
    pub fn parse_param(raw: &str) -> Result<Self, CanaryError> {
        if !raw.is_empty() && raw.chars().all(|c| c.is_ascii_digit() || c == '.') {
            let n: f64 = raw.parse().map_err(|_| {
                CanaryError::Validation(format!("malformed periodicity \"{raw}\""))
            })?;
            Ok(Periodicity::Seconds(n))
        } else {
            Ok(Periodicity::Schedule(raw.to_string()))
        }
    }
}

/// Check that a periodicity is well-formed without caring about the result.
pub fn validate(periodicity: &Periodicity, now: NaiveDateTime) -> Result<(), CanaryError> {
    deadline_delta(periodicity, now).map(|_| ())
}

/// The instant by which the next trigger is expected, given a trigger (or
/// other anchoring event) at `whence`.
pub fn next_deadline(
    periodicity: &Periodicity,
    whence: NaiveDateTime,
) -> Result<NaiveDateTime, CanaryError> {
    let delta = deadline_delta(periodicity, whence)?;
    whence
        .checked_add_signed(delta)
        .ok_or_else(|| CanaryError::Validation("periodicity overflows the calendar".into()))
}

/// Time from `whence` until the next deadline.
///
/// For schedules there are four cases, depending on where `whence` falls in
/// the window sequence:
///
/// 1. An entry is active at `whence` and `whence + seconds` stays inside its
///    window: the deadline is simply `whence + seconds`.
/// 2. Nothing is active at `whence`: the deadline is the start of the next
///    active window plus that window's seconds.
/// 3. An entry is active but `whence + seconds` overflows into a gap: skip
///    the gap and use the window after it, as in case 2.
/// 4. An entry is active and `whence + seconds` overflows into another
///    active window: the deadline is the later of that window's start and
///    `whence + seconds`.
///
/// A window is never skipped entirely: a canary that pings during a gap in
/// its schedule gets a deadline inside the *next* active window even if the
/// window's own cadence could not be met from its start.
pub fn deadline_delta(
    periodicity: &Periodicity,
    whence: NaiveDateTime,
) -> Result<Duration, CanaryError> {
    match periodicity {
        Periodicity::Seconds(n) => seconds_delta(*n),
        Periodicity::Schedule(text) => {
            let sched = parse_schedule(text)?;
            let mut windows = sched
                .schedule_iter(whence, None, false, true)
                .map_err(malformed)?;

            let current = next_window(&mut windows)?;
            let current_seconds = match current.activity {
                Activity::Inactive => {
                    // Case 2: wait for the next active window.
                    let next = next_window(&mut windows)?;
                    let deadline = window_deadline(&next)?;
                    return Ok(deadline - whence);
                }
                Activity::Single(cmd) => command_delta(&cmd)?,
                Activity::Multi(_) => {
                    return Err(malformed(ScheduleError::Overlap(whence)));
                }
            };

            let candidate = checked_add(whence, current_seconds)?;
            if candidate <= current.end {
                // Case 1: still inside the active window.
                return Ok(current_seconds);
            }

            let next = next_window(&mut windows)?;
            match next.activity {
                Activity::Inactive => {
                    // Case 3: overflowed into a gap; use the window after it.
                    let after = next_window(&mut windows)?;
                    let deadline = window_deadline(&after)?;
                    Ok(deadline - whence)
                }
                Activity::Single(cmd) => {
                    // Case 4: overflowed into another active window.
                    let delta = command_delta(&cmd)?;
                    let deadline = next.start.max(checked_add(whence, delta)?);
                    Ok(deadline - whence)
                }
                Activity::Multi(_) => Err(malformed(ScheduleError::Overlap(next.start))),
            }
        }
    }
}

/// Windows from `start` for operator display: iterate until every entry has
/// been seen, and again over the next seven days, keeping whichever view is
/// longer.
pub fn display_schedule(
    text: &str,
    start: NaiveDateTime,
) -> Result<Vec<Window>, CanaryError> {
    let sched = parse_schedule(text)?;
    let until_seen: Vec<Window> = sched
        .schedule_iter(start, None, false, false)
        .map_err(malformed)?
        .collect::<Result<_, _>>()
        .map_err(malformed)?;
    let one_week: Vec<Window> = sched
        .schedule_iter(start, Some(start + Duration::days(7)), false, false)
        .map_err(malformed)?
        .collect::<Result<_, _>>()
        .map_err(malformed)?;
    Ok(if until_seen.len() > one_week.len() {
        until_seen
    } else {
        one_week
    })
}

/// Parse and validate a schedule cadence: no embedded newlines, at least one
/// entry, and every command a positive number of seconds.
fn parse_schedule(text: &str) -> Result<CronTabSchedule, CanaryError> {
    if text.contains('\n') {
        return Err(CanaryError::Validation(
            "malformed periodicity: no newlines allowed".into(),
        ));
    }
    let sched = CronTabSchedule::parse(text, SCHEDULE_DELIMITER).map_err(|e| {
        CanaryError::Validation(format!(
            "malformed periodicity: must be a positive number or a \
             semicolon-delimited crontab schedule ({e})"
        ))
    })?;
    if sched.is_empty() {
        return Err(CanaryError::Validation(
            "malformed periodicity: schedule has no entries".into(),
        ));
    }
    for i in 0..sched.len() {
        let command = sched.command_of(i);
        match command.trim().parse::<f64>() {
            Ok(v) if v > 0.0 && v.is_finite() => {}
            _ => {
                return Err(CanaryError::Validation(
                    "malformed periodicity: each crontab schedule \"command\" \
                     must be a positive number"
                        .into(),
                ));
            }
        }
    }
    Ok(sched)
}

fn seconds_delta(n: f64) -> Result<Duration, CanaryError> {
    if !(n > 0.0) || !n.is_finite() {
        return Err(CanaryError::Validation(
            "numeric periodicities must be positive".into(),
        ));
    }
    Duration::from_std(std::time::Duration::from_secs_f64(n))
        .map_err(|_| CanaryError::Validation("periodicity is out of range".into()))
}

/// Seconds value of a schedule command, already validated at parse time.
fn command_delta(command: &str) -> Result<Duration, CanaryError> {
    let v: f64 = command.trim().parse().map_err(|_| {
        CanaryError::Validation("malformed periodicity command".into())
    })?;
    seconds_delta(v)
}

fn window_deadline(window: &Window) -> Result<NaiveDateTime, CanaryError> {
    match &window.activity {
        Activity::Single(cmd) => checked_add(window.start, command_delta(cmd)?),
        _ => Err(CanaryError::Validation(
            "malformed periodicity: schedule never becomes active".into(),
        )),
    }
}

fn next_window(
    windows: &mut schedule::WindowIter<'_>,
) -> Result<Window, CanaryError> {
    match windows.next() {
        Some(Ok(window)) => Ok(window),
        Some(Err(e)) => Err(malformed(e)),
        None => Err(CanaryError::Validation(
            "malformed periodicity: schedule has no upcoming windows".into(),
        )),
    }
}

fn checked_add(t: NaiveDateTime, delta: Duration) -> Result<NaiveDateTime, CanaryError> {
    t.checked_add_signed(delta)
        .ok_or_else(|| CanaryError::Validation("periodicity overflows the calendar".into()))
}

fn malformed(e: ScheduleError) -> CanaryError {
    match e {
        ScheduleError::Overlap(_) => CanaryError::Validation(
            "malformed periodicity: overlapping schedule entries are not allowed".into(),
        ),
        other => CanaryError::Validation(format!("malformed periodicity: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn dt(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d).unwrap().and_hms_opt(h, mi, 0).unwrap()
    }

    #[test]
    fn numeric_deadline_is_whence_plus_seconds() {
        let whence = dt(2016, 6, 30, 1, 0);
        let p = Periodicity::Seconds(60.0);
        assert_eq!(next_deadline(&p, whence).unwrap(), whence + Duration::seconds(60));
    }

    #[test]
    fn numeric_must_be_positive() {
        for n in [0.0, -5.0, f64::NAN, f64::INFINITY] {
            assert!(validate(&Periodicity::Seconds(n), dt(2016, 1, 1, 0, 0)).is_err());
        }
    }

    #[test]
    fn inactive_now_waits_for_next_window() {
        // Active 00:00-00:59 daily; pinged at 01:00, so the deadline is two
        // minutes into tomorrow's window.
        let p = Periodicity::Schedule("* 0 * * * 120".into());
        let whence = dt(2016, 6, 30, 1, 0);
        assert_eq!(next_deadline(&p, whence).unwrap(), dt(2016, 7, 1, 0, 2));
    }

    #[test]
    fn overflow_into_gap_skips_to_next_window() {
        let p = Periodicity::Schedule("* 0 * * * 120".into());
        let whence = dt(2016, 6, 30, 0, 59);
        assert_eq!(next_deadline(&p, whence).unwrap(), dt(2016, 7, 1, 0, 2));
    }

    #[test]
    fn overflow_into_next_window_takes_the_later_bound() {
        let p = Periodicity::Schedule("* 0 * * * 120; * 1 * * * 600".into());
        let whence = dt(2016, 6, 30, 0, 59);
        assert_eq!(next_deadline(&p, whence).unwrap(), dt(2016, 6, 30, 1, 9));
    }

    #[test]
    fn new_window_start_wins_when_cadence_is_tight() {
        // Ping late in the first window with a next-window cadence short
        // enough that whence + seconds lands before the boundary: the new
        // window's start is the deadline instead.
        let p = Periodicity::Schedule("* 0 * * * 3600; * 1 * * * 30".into());
        let whence = dt(2016, 6, 30, 0, 59);
        assert_eq!(next_deadline(&p, whence).unwrap(), dt(2016, 6, 30, 1, 0));
    }

    #[test]
    fn active_and_fitting_stays_in_window() {
        let p = Periodicity::Schedule("* 0 * * * 120".into());
        let whence = dt(2016, 6, 30, 0, 10);
        assert_eq!(next_deadline(&p, whence).unwrap(), dt(2016, 6, 30, 0, 12));
    }

    #[test]
    fn five_field_entries_are_rejected() {
        let p = Periodicity::Schedule("* * * * 1200".into());
        assert!(validate(&p, dt(2016, 1, 1, 0, 0)).is_err());
    }

    #[test]
    fn newlines_are_rejected() {
        let p = Periodicity::Schedule("* * * * * 60\n* * * * * 90".into());
        let err = validate(&p, dt(2016, 1, 1, 0, 0)).unwrap_err();
        assert!(err.to_string().contains("no newlines"));
    }

    #[test]
    fn non_numeric_command_is_rejected() {
        let p = Periodicity::Schedule("* * * * * sixty".into());
        assert!(validate(&p, dt(2016, 1, 1, 0, 0)).is_err());
        let p = Periodicity::Schedule("* * * * * -5".into());
        assert!(validate(&p, dt(2016, 1, 1, 0, 0)).is_err());
    }

    #[test]
    fn overlapping_entries_are_rejected() {
        let p = Periodicity::Schedule("* 0-5 * * * 60; * 3-8 * * * 90".into());
        let err = validate(&p, dt(2016, 1, 1, 0, 0)).unwrap_err();
        assert!(err.to_string().contains("overlapping"));
    }

    #[test]
    fn weekday_split_schedule_is_accepted() {
        let p = Periodicity::Schedule("* * * * sat,sun 600; * * * * mon-fri 90".into());
        assert!(validate(&p, dt(2016, 6, 30, 0, 59)).is_ok());
    }

    #[test]
    fn param_parsing_distinguishes_numbers_from_schedules() {
        assert_eq!(Periodicity::parse_param("60").unwrap(), Periodicity::Seconds(60.0));
        assert_eq!(Periodicity::parse_param("0.5").unwrap(), Periodicity::Seconds(0.5));
        assert_eq!(
            Periodicity::parse_param("* * * * * 60").unwrap(),
            Periodicity::Schedule("* * * * * 60".into())
        );
        // Digits and dots that do not form a number are an error, not a
        // schedule.
        assert!(Periodicity::parse_param("1.2.3").is_err());
    }

    #[test]
    fn serializes_as_bare_number_or_string() {
        let n = serde_json::to_value(Periodicity::Seconds(300.0)).unwrap();
        assert_eq!(n, serde_json::json!(300.0));
        let s = serde_json::to_value(Periodicity::Schedule("* * * * * 60".into())).unwrap();
        assert_eq!(s, serde_json::json!("* * * * * 60"));

        let back: Periodicity = serde_json::from_value(serde_json::json!(300.0)).unwrap();
        assert_eq!(back, Periodicity::Seconds(300.0));
        let back: Periodicity = serde_json::from_value(serde_json::json!("* 0 * * * 120")).unwrap();
        assert_eq!(back, Periodicity::Schedule("* 0 * * * 120".into()));
    }

    #[test]
    fn display_schedule_prefers_longer_view() {
        let windows = display_schedule("* 0 * * * 120", dt(2016, 6, 30, 1, 0)).unwrap();
        // Seven days of daily windows beats the two windows needed to
        // witness the single entry.
        assert!(windows.len() > 2);
        assert!(matches!(windows[0].activity, Activity::Inactive));
        assert_eq!(windows[1].start, dt(2016, 7, 1, 0, 0));
    }
}
