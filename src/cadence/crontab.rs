//! Single crontab expression — five fields matched against minute labels.
//!
//! Fields are `minute hour day-of-month month day-of-week` with the usual
//! grammar: `*`, comma lists, `a-b` ranges, `*/n` and `a-b/n` steps, and
//! three-letter month / weekday names. All matching is done against naive
//! UTC calendar labels; day-of-week 0 (or 7) is Sunday.

use std::cell::Cell;

use chrono::{Datelike, Duration, NaiveDateTime, Timelike};

use super::ScheduleError;

/// How far ahead a next-match scan is willing to look.
const SCAN_LIMIT_DAYS: i64 = 366;

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const DAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// Bit set over a small numeric field domain.
#[derive(Debug, Clone, Copy)]
struct FieldSet(u64);

impl FieldSet {
    fn contains(self, value: u32) -> bool {
        value < 64 && self.0 & (1 << value) != 0
    }
}

#[derive(Debug, Clone)]
pub struct CrontabExpr {
    minutes: FieldSet,
    hours: FieldSet,
    days: FieldSet,
    months: FieldSet,
    weekdays: FieldSet,
    /// `* * * * *` short-circuits the next-match scan entirely.
    every_minute: bool,
    /// Last `(now, delta)` answered by [`next_delta`](Self::next_delta);
    /// a later `now` inside the cached interval only decrements the delta.
    cache: Cell<Option<(NaiveDateTime, Duration)>>,
}

impl CrontabExpr {
    /// Parse the five whitespace-separated crontab fields.
    pub fn parse(fields: &[&str; 5]) -> Result<Self, ScheduleError> {
        Ok(Self {
            minutes: parse_field(fields[0], 0, 59, None)?,
            hours: parse_field(fields[1], 0, 23, None)?,
            days: parse_field(fields[2], 1, 31, None)?,
            months: parse_field(fields[3], 1, 12, Some((MONTH_NAMES.as_slice(), 1)))?,
            weekdays: parse_weekday_field(fields[4])?,
            every_minute: fields.iter().all(|f| *f == "*"),
            cache: Cell::new(None),
        })
    }

    /// Whether the expression is active during the minute containing `t`.
    pub fn matches_minute(&self, t: NaiveDateTime) -> bool {
        self.minutes.contains(t.minute())
            && self.hours.contains(t.hour())
            && self.days.contains(t.day())
            && self.months.contains(t.month())
            && self.weekdays.contains(t.weekday().num_days_from_sunday())
    }

    /// Time until the next matching minute strictly after `now`.
    ///
    /// Successive calls with a `now` that has merely advanced inside the
    /// previously computed interval are answered from the cache without
    /// rescanning the calendar.
    pub fn next_delta(&self, now: NaiveDateTime) -> Result<Duration, ScheduleError> {
        if self.every_minute {
            return Ok(Duration::seconds(60)
                - Duration::seconds(i64::from(now.second()))
                - Duration::nanoseconds(i64::from(now.nanosecond())));
        }

        if let Some((cached_now, cached_delta)) = self.cache.get() {
            if now > cached_now && now < cached_now + cached_delta {
                let delta = cached_delta - (now - cached_now);
                self.cache.set(Some((now, delta)));
                return Ok(delta);
            }
        }

        let target = self.next_match(now)?;
        let delta = target - now;
        self.cache.set(Some((now, delta)));
        Ok(delta)
    }

    /// First matching minute strictly after `now`.
    fn next_match(&self, now: NaiveDateTime) -> Result<NaiveDateTime, ScheduleError> {
        let limit = now + Duration::days(SCAN_LIMIT_DAYS);
        let mut t = floor_minute(now) + Duration::minutes(1);

        // Walk forward, skipping whole months/days/hours that cannot match.
        while t <= limit {
            if !self.months.contains(t.month()) {
                t = next_month_start(t);
                continue;
            }
            if !self.days.contains(t.day())
                || !self.weekdays.contains(t.weekday().num_days_from_sunday())
            {
                t = floor_day(t) + Duration::days(1);
                continue;
            }
            if !self.hours.contains(t.hour()) {
                t = floor_hour(t) + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Ok(t);
        }

        Err(ScheduleError::Invalid(format!(
            "no matching minute within {SCAN_LIMIT_DAYS} days"
        )))
    }
}

pub(crate) fn floor_minute(t: NaiveDateTime) -> NaiveDateTime {
    t - Duration::seconds(i64::from(t.second())) - Duration::nanoseconds(i64::from(t.nanosecond()))
}

fn floor_hour(t: NaiveDateTime) -> NaiveDateTime {
    floor_minute(t) - Duration::minutes(i64::from(t.minute()))
}

fn floor_day(t: NaiveDateTime) -> NaiveDateTime {
    floor_hour(t) - Duration::hours(i64::from(t.hour()))
}

fn next_month_start(t: NaiveDateTime) -> NaiveDateTime {
    let mut d = floor_day(t) + Duration::days(1);
    while d.day() != 1 {
        d += Duration::days(1);
    }
    d
}

fn parse_field(
    field: &str,
    min: u32,
    max: u32,
    names: Option<(&[&str], u32)>,
) -> Result<FieldSet, ScheduleError> {
    let mut mask = 0u64;

    for part in field.split(',') {
        let part = part.trim();
        let (range, step) = match part.split_once('/') {
            Some((range, step_s)) => {
                let step: u32 = step_s.parse().map_err(|_| {
                    ScheduleError::Invalid(format!("bad step value '{step_s}' in '{field}'"))
                })?;
                if step == 0 {
                    return Err(ScheduleError::Invalid(format!(
                        "step must be positive in '{field}'"
                    )));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((lo_s, hi_s)) = range.split_once('-') {
            (
                parse_value(lo_s, min, max, names)?,
                parse_value(hi_s, min, max, names)?,
            )
        } else {
            let v = parse_value(range, min, max, names)?;
            // A bare value with a step means "from v to the end".
            if step > 1 { (v, max) } else { (v, v) }
        };

        if lo > hi {
            return Err(ScheduleError::Invalid(format!(
                "inverted range '{range}' in '{field}'"
            )));
        }

        let mut v = lo;
        while v <= hi {
            mask |= 1 << v;
            v += step;
        }
    }

    if mask == 0 {
        return Err(ScheduleError::Invalid(format!("empty field '{field}'")));
    }
    Ok(FieldSet(mask))
}

fn parse_value(
    text: &str,
    min: u32,
    max: u32,
    names: Option<(&[&str], u32)>,
) -> Result<u32, ScheduleError> {
    if let Ok(v) = text.parse::<u32>() {
        if v < min || v > max {
            return Err(ScheduleError::Invalid(format!(
                "value {v} out of range {min}-{max}"
            )));
        }
        return Ok(v);
    }
    if let Some((names, base)) = names {
        let lowered = text.to_ascii_lowercase();
        if let Some(pos) = names.iter().position(|n| *n == lowered) {
            return Ok(base + pos as u32);
        }
    }
    Err(ScheduleError::Invalid(format!("unrecognized value '{text}'")))
}

/// Day-of-week field: names allowed, and 7 is an alias for Sunday.
fn parse_weekday_field(field: &str) -> Result<FieldSet, ScheduleError> {
    let set = parse_field(field, 0, 7, Some((DAY_NAMES.as_slice(), 0)))?;
    let mut mask = set.0;
    if mask & (1 << 7) != 0 {
        mask = (mask & !(1 << 7)) | 1;
    }
    Ok(FieldSet(mask))
}
