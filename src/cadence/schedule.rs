//! Continuous schedules written in crontab syntax.
//!
//! Classic cron fires at instants; here every entry instead defines the set
//! of minutes during which it is *active*, and adjacent active minutes
//! coalesce into windows. [`CronTabSchedule::schedule_iter`] walks those
//! windows forward in time; the deadline computation in the parent module
//! consumes the first few of them.
//!
//! Window `end` values are the *last* active minute of the window, at minute
//! granularity — activity extends through `end + 1 minute`.

use std::collections::HashSet;

use chrono::{Duration, NaiveDateTime, Timelike};

use super::ScheduleError;
use super::crontab::{CrontabExpr, floor_minute};

/// Coarsest unit at which the set of active entries can change, implied by
/// the least-specific non-`*` field across all entries. Iterating windows
/// advances by this step instead of minute-by-minute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Gap {
    Minute,
    Hour,
    Day,
    /// Every field is `*`: the schedule never changes.
    LikeForever,
}

impl Gap {
    fn step(self) -> Duration {
        match self {
            Gap::Minute => Duration::minutes(1),
            Gap::Hour => Duration::hours(1),
            Gap::Day => Duration::days(1),
            Gap::LikeForever => Duration::days(31),
        }
    }
}

/// What is active during a window.
#[derive(Debug, Clone, PartialEq)]
pub enum Activity {
    Inactive,
    /// Single-active mode: the command of the one active entry.
    Single(String),
    /// Multi mode: sorted, deduplicated commands of all active entries.
    Multi(Vec<String>),
}

/// A maximal run of minutes with an unchanged set of active commands.
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    pub start: NaiveDateTime,
    /// Last active minute (inclusive, minute-floored).
    pub end: NaiveDateTime,
    pub activity: Activity,
}

#[derive(Debug, Clone)]
pub struct CronTabSchedule {
    entries: Vec<(CrontabExpr, String)>,
    smallest_change_gap: Option<Gap>,
}

impl CronTabSchedule {
    /// Parse delimiter-separated entries of the form
    /// `minute hour day-of-month month day-of-week command`.
    /// Empty segments and segments starting with `#` are skipped.
    pub fn parse(crontab: &str, delimiter: char) -> Result<Self, ScheduleError> {
        let mut sched = Self { entries: Vec::new(), smallest_change_gap: None };
        for line in crontab.split(delimiter) {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            sched.add_entry(line)?;
        }
        Ok(sched)
    }

    /// Add one entry. Schedules can be built incrementally.
    pub fn add_entry(&mut self, line: &str) -> Result<(), ScheduleError> {
        let (fields, command) = split_entry(line)?;

        let gap = if fields[0] != "*" {
            Gap::Minute
        } else if fields[1] != "*" {
            Gap::Hour
        } else if fields[2] == "*" && fields[3] == "*" && fields[4] == "*" {
            Gap::LikeForever
        } else {
            Gap::Day
        };
        self.smallest_change_gap = Some(match self.smallest_change_gap {
            Some(existing) => existing.min(gap),
            None => gap,
        });

        let expr = CrontabExpr::parse(&fields)?;
        self.entries.push((expr, command.to_string()));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Command string of the entry at `index`.
    pub fn command_of(&self, index: usize) -> &str {
        &self.entries[index].1
    }

    fn check(&self) -> Result<(), ScheduleError> {
        if self.entries.is_empty() {
            return Err(ScheduleError::Empty);
        }
        Ok(())
    }

    /// Indexes of all entries active during the minute containing `t`.
    fn active_entries(&self, t: NaiveDateTime) -> Vec<usize> {
        let minute = floor_minute(t);
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, (expr, _))| expr.matches_minute(minute))
            .map(|(i, _)| i)
            .collect()
    }

    /// Entries active in the minute *after* the one containing `now`.
    pub fn next_minute_multi(&self, now: NaiveDateTime) -> Result<Vec<usize>, ScheduleError> {
        self.check()?;
        Ok(self.active_entries(floor_minute(now) + Duration::minutes(1)))
    }

    /// Like [`next_minute_multi`](Self::next_minute_multi) but fails unless
    /// at most one entry is active.
    pub fn next_minute_single(&self, now: NaiveDateTime) -> Result<Option<usize>, ScheduleError> {
        let matches = self.next_minute_multi(now)?;
        if matches.len() > 1 {
            return Err(ScheduleError::Overlap(floor_minute(now) + Duration::minutes(1)));
        }
        Ok(matches.first().copied())
    }

    /// The soonest instant on or after `now` at which any entry is active.
    pub fn soonest(&self, now: NaiveDateTime) -> Result<NaiveDateTime, ScheduleError> {
        self.check()?;
        // An exact minute boundary may itself be active; back up so the
        // strictly-after next-match scan can land on it.
        let now = if now.second() == 0 && now.nanosecond() == 0 {
            now - Duration::minutes(1)
        } else {
            now
        };
        let mut soonest: Option<Duration> = None;
        for (expr, _) in &self.entries {
            let delta = expr.next_delta(now)?;
            soonest = Some(match soonest {
                Some(best) => best.min(delta),
                None => delta,
            });
        }
        match soonest {
            Some(delta) => Ok(now + delta),
            None => Err(ScheduleError::Empty),
        }
    }

    /// Round `now` up to the next instant at which the active set could
    /// possibly change.
    pub fn round_up(&self, now: NaiveDateTime) -> Result<NaiveDateTime, ScheduleError> {
        self.check()?;
        let gap = self.smallest_change_gap.unwrap_or(Gap::Minute);
        Ok(match gap {
            Gap::Minute => now,
            Gap::Hour => now + Duration::minutes(i64::from(60 - now.minute())),
            Gap::Day => {
                now + Duration::hours(i64::from(24 - now.hour()))
                    - Duration::minutes(i64::from(now.minute()))
            }
            Gap::LikeForever => now + Gap::LikeForever.step(),
        })
    }

    /// Iterate windows from `start`.
    ///
    /// With `end` set, iteration stops there (the final partial window is
    /// yielded with the caller's `end`). Without `end`, iteration stops once
    /// every entry has been seen at least once — or never, when `endless` is
    /// set. Either way the scan is capped at roughly a calendar year.
    /// In single-active mode (`multi == false`) an overlap yields an error
    /// and ends the iteration.
    pub fn schedule_iter(
        &self,
        start: NaiveDateTime,
        end: Option<NaiveDateTime>,
        multi: bool,
        endless: bool,
    ) -> Result<WindowIter<'_>, ScheduleError> {
        self.check()?;
        if endless && end.is_some() {
            return Err(ScheduleError::Invalid(
                "cannot specify both an end instant and endless iteration".into(),
            ));
        }

        let start = floor_minute(start);
        let end = end.map(floor_minute);

        let active = self.active_entries(start);
        if !multi && active.len() > 1 {
            return Err(ScheduleError::Overlap(start));
        }

        let current_rules: HashSet<Option<usize>> = if active.is_empty() {
            HashSet::new()
        } else {
            active.iter().map(|&i| Some(i)).collect()
        };
        let current_key = self.key_set(&active);
        let next_start = self.round_up(start)?;

        Ok(WindowIter {
            sched: self,
            multi,
            end,
            endless,
            gap: self.smallest_change_gap.unwrap_or(Gap::Minute),
            limit: start + Duration::days(400),
            used: HashSet::new(),
            current_rules,
            current_start: start,
            current_key,
            next_start,
            done: false,
        })
    }

    /// Sorted, deduplicated command set for a group of active entries.
    /// An empty group yields the single marker `None` so that inactive
    /// stretches compare as their own distinct key.
    fn key_set(&self, active: &[usize]) -> Vec<Option<String>> {
        if active.is_empty() {
            return vec![None];
        }
        let mut keys: Vec<Option<String>> = active
            .iter()
            .map(|&i| Some(self.entries[i].1.clone()))
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    fn fix_key(&self, key: &[Option<String>], multi: bool) -> Activity {
        if matches!(key, [None]) {
            return Activity::Inactive;
        }
        if multi {
            Activity::Multi(key.iter().flatten().cloned().collect())
        } else {
            match key.first() {
                Some(Some(cmd)) => Activity::Single(cmd.clone()),
                _ => Activity::Inactive,
            }
        }
    }
}

/// Walks the window sequence of a schedule. Created by
/// [`CronTabSchedule::schedule_iter`].
pub struct WindowIter<'a> {
    sched: &'a CronTabSchedule,
    multi: bool,
    end: Option<NaiveDateTime>,
    endless: bool,
    gap: Gap,
    limit: NaiveDateTime,
    /// Entries witnessed so far; the `None` marker counts inactive
    /// stretches, mirroring how the active set accumulates per window.
    used: HashSet<Option<usize>>,
    current_rules: HashSet<Option<usize>>,
    current_start: NaiveDateTime,
    current_key: Vec<Option<String>>,
    next_start: NaiveDateTime,
    done: bool,
}

impl Iterator for WindowIter<'_> {
    type Item = Result<Window, ScheduleError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        loop {
            let live = match self.end {
                Some(end) => self.next_start < end,
                None => self.endless || self.used.len() < self.sched.entries.len(),
            };
            if !live {
                self.done = true;
                if let Some(end) = self.end {
                    if self.current_start < end {
                        let activity = self.sched.fix_key(&self.current_key, self.multi);
                        return Some(Ok(Window {
                            start: self.current_start,
                            end,
                            activity,
                        }));
                    }
                }
                return None;
            }

            if self.next_start > self.limit {
                self.done = true;
                if self.endless {
                    return Some(Err(ScheduleError::Invalid(
                        "no change of active entries within a year".into(),
                    )));
                }
                return None;
            }

            let new_entries = self.sched.active_entries(self.next_start);
            if !self.multi && new_entries.len() > 1 {
                self.done = true;
                return Some(Err(ScheduleError::Overlap(self.next_start)));
            }
            let new_key = self.sched.key_set(&new_entries);

            if new_key != self.current_key || self.gap == Gap::LikeForever {
                let window = Window {
                    start: self.current_start,
                    end: self.next_start - Duration::minutes(1),
                    activity: self.sched.fix_key(&self.current_key, self.multi),
                };
                self.used.extend(self.current_rules.drain());
                self.current_rules = if new_entries.is_empty() {
                    HashSet::from([None])
                } else {
                    new_entries.iter().map(|&i| Some(i)).collect()
                };
                self.current_start = self.next_start;
                self.current_key = new_key;
                self.next_start += self.gap.step();
                return Some(Ok(window));
            } else if !new_entries.is_empty() {
                self.current_rules.extend(new_entries.iter().map(|&i| Some(i)));
            }

            self.next_start += self.gap.step();
        }
    }
}

fn split_entry(line: &str) -> Result<([&str; 5], &str), ScheduleError> {
    let mut fields = [""; 5];
    let mut rest = line.trim_start();
    for field in fields.iter_mut() {
        let Some(end) = rest.find(char::is_whitespace) else {
            return Err(ScheduleError::Invalid(format!(
                "{line} does not have six fields"
            )));
        };
        *field = &rest[..end];
        rest = rest[end..].trim_start();
    }
    if rest.is_empty() {
        return Err(ScheduleError::Invalid(format!(
            "{line} does not have six fields"
        )));
    }
    Ok((fields, rest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    const SCHEDULE: &str = "\
# This is a comment.
    *          * * * Sun 300

# Leave the blank line above and this comment in place.
    * 22-23,0-12 * * Mon-Fri 300
 0-29         13 * * Mon-Fri 300
30-59         13 * * Mon-Fri 90
    *      14-21 * * Mon-Fri 90";

    const MULTI_SCHEDULE: &str = "* 0-11 * * * A\n* 7-18 * * * B\n* 12-23 * * * C";

    fn dt(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, mo, d).unwrap().and_hms_opt(h, mi, 0).unwrap()
    }

    fn sched(text: &str) -> CronTabSchedule {
        CronTabSchedule::parse(text, '\n').unwrap()
    }

    fn single(cmd: &str) -> Activity {
        Activity::Single(cmd.to_string())
    }

    fn collect_single(
        s: &CronTabSchedule,
        start: NaiveDateTime,
        end: Option<NaiveDateTime>,
    ) -> Vec<Window> {
        s.schedule_iter(start, end, false, false)
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn parse_skips_comments_and_blanks() {
        let s = sched(SCHEDULE);
        assert_eq!(s.len(), 5);
        assert_eq!(s.command_of(2), "300");
    }

    #[test]
    fn entry_needs_six_fields() {
        assert!(CronTabSchedule::parse("* * *", '\n').is_err());
        assert!(CronTabSchedule::parse("* * * * * 60", '\n').is_ok());
    }

    #[test]
    fn command_may_contain_whitespace() {
        let s = sched("* * * * * two words");
        assert_eq!(s.command_of(0), "two words");
    }

    #[test]
    fn schedule_iter_fixed_end() {
        let s = sched(SCHEDULE);
        let slots = collect_single(&s, dt(2015, 1, 1, 0, 0), Some(dt(2015, 1, 8, 0, 0)));
        let expected = vec![
            (dt(2015, 1, 1, 0, 0), dt(2015, 1, 1, 13, 29), single("300")),
            (dt(2015, 1, 1, 13, 30), dt(2015, 1, 1, 21, 59), single("90")),
            (dt(2015, 1, 1, 22, 0), dt(2015, 1, 2, 13, 29), single("300")),
            (dt(2015, 1, 2, 13, 30), dt(2015, 1, 2, 21, 59), single("90")),
            (dt(2015, 1, 2, 22, 0), dt(2015, 1, 2, 23, 59), single("300")),
            (dt(2015, 1, 3, 0, 0), dt(2015, 1, 3, 23, 59), Activity::Inactive),
            (dt(2015, 1, 4, 0, 0), dt(2015, 1, 5, 13, 29), single("300")),
            (dt(2015, 1, 5, 13, 30), dt(2015, 1, 5, 21, 59), single("90")),
            (dt(2015, 1, 5, 22, 0), dt(2015, 1, 6, 13, 29), single("300")),
            (dt(2015, 1, 6, 13, 30), dt(2015, 1, 6, 21, 59), single("90")),
            (dt(2015, 1, 6, 22, 0), dt(2015, 1, 7, 13, 29), single("300")),
            (dt(2015, 1, 7, 13, 30), dt(2015, 1, 7, 21, 59), single("90")),
            (dt(2015, 1, 7, 22, 0), dt(2015, 1, 8, 0, 0), single("300")),
        ];
        let got: Vec<_> = slots.into_iter().map(|w| (w.start, w.end, w.activity)).collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn schedule_iter_until_all_entries_seen() {
        let s = sched(SCHEDULE);
        let slots = collect_single(&s, dt(2015, 1, 1, 0, 0), None);
        let got: Vec<_> = slots.into_iter().map(|w| (w.start, w.end, w.activity)).collect();
        let expected = vec![
            (dt(2015, 1, 1, 0, 0), dt(2015, 1, 1, 13, 29), single("300")),
            (dt(2015, 1, 1, 13, 30), dt(2015, 1, 1, 21, 59), single("90")),
            (dt(2015, 1, 1, 22, 0), dt(2015, 1, 2, 13, 29), single("300")),
            (dt(2015, 1, 2, 13, 30), dt(2015, 1, 2, 21, 59), single("90")),
            (dt(2015, 1, 2, 22, 0), dt(2015, 1, 2, 23, 59), single("300")),
            (dt(2015, 1, 3, 0, 0), dt(2015, 1, 3, 23, 59), Activity::Inactive),
        ];
        assert_eq!(got, expected);
    }

    #[test]
    fn schedule_iter_gap_window() {
        let s = sched("* 12-23 * * * A");
        let slots: Vec<Window> = s
            .schedule_iter(dt(2015, 1, 1, 0, 0), Some(dt(2015, 1, 1, 12, 1)), true, false)
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].start, dt(2015, 1, 1, 0, 0));
        assert_eq!(slots[0].end, dt(2015, 1, 1, 11, 59));
        assert_eq!(slots[0].activity, Activity::Inactive);
        assert_eq!(slots[1].start, dt(2015, 1, 1, 12, 0));
        assert_eq!(slots[1].end, dt(2015, 1, 1, 12, 1));
        assert_eq!(slots[1].activity, Activity::Multi(vec!["A".into()]));
    }

    #[test]
    fn end_and_endless_conflict() {
        let s = sched(SCHEDULE);
        assert!(s.schedule_iter(dt(2015, 1, 1, 0, 0), Some(dt(2015, 1, 2, 0, 0)), false, true).is_err());
    }

    #[test]
    fn multi_mode_merges_overlapping_entries() {
        let s = sched(MULTI_SCHEDULE);
        let slots: Vec<Window> = s
            .schedule_iter(dt(2015, 1, 1, 0, 0), None, true, false)
            .unwrap()
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        let got: Vec<_> = slots.into_iter().map(|w| (w.start, w.end, w.activity)).collect();
        let expected = vec![
            (dt(2015, 1, 1, 0, 0), dt(2015, 1, 1, 6, 59), Activity::Multi(vec!["A".into()])),
            (
                dt(2015, 1, 1, 7, 0),
                dt(2015, 1, 1, 11, 59),
                Activity::Multi(vec!["A".into(), "B".into()]),
            ),
            (
                dt(2015, 1, 1, 12, 0),
                dt(2015, 1, 1, 18, 59),
                Activity::Multi(vec!["B".into(), "C".into()]),
            ),
        ];
        assert_eq!(got, expected);
    }

    #[test]
    fn single_mode_rejects_overlap() {
        let s = sched(MULTI_SCHEDULE);
        // Overlap starts at 07:00; iteration from midnight errors when it
        // reaches the overlapping stretch.
        let result: Result<Vec<Window>, ScheduleError> = s
            .schedule_iter(dt(2015, 1, 1, 0, 0), None, false, false)
            .unwrap()
            .collect();
        assert!(matches!(result, Err(ScheduleError::Overlap(_))));
    }

    #[test]
    fn semicolon_delimiter_matches_newline_form() {
        let with_semis = SCHEDULE.replace('\n', ";");
        let s = CronTabSchedule::parse(&with_semis, ';').unwrap();
        let slots = collect_single(&s, dt(2015, 1, 1, 0, 0), None);
        assert_eq!(slots.len(), 6);
        assert_eq!(slots[5].activity, Activity::Inactive);
    }

    #[test]
    fn empty_schedule_refuses_to_iterate() {
        let s = CronTabSchedule::parse("", '\n').unwrap();
        assert!(s.is_empty());
        assert!(matches!(s.soonest(dt(2015, 1, 1, 0, 0)), Err(ScheduleError::Empty)));
    }

    #[test]
    fn soonest_with_seconds_rounds_to_next_minute() {
        let s = sched("* * * * * foo");
        let now = NaiveDate::from_ymd_opt(2015, 1, 1)
            .unwrap()
            .and_hms_micro_opt(1, 1, 1, 1)
            .unwrap();
        assert_eq!(s.soonest(now).unwrap(), dt(2015, 1, 1, 1, 2));
    }

    #[test]
    fn soonest_on_boundary_returns_now() {
        let s = sched("* * * * * foo");
        let now = dt(2015, 1, 1, 0, 0);
        assert_eq!(s.soonest(now).unwrap(), now);
    }

    #[test]
    fn next_minute_single_detects_overlap() {
        let s = sched(MULTI_SCHEDULE);
        // 08:00 falls inside both A and B.
        assert!(s.next_minute_single(dt(2015, 1, 1, 7, 59)).is_err());
        // 02:00 is only A.
        assert_eq!(s.next_minute_single(dt(2015, 1, 1, 1, 59)).unwrap(), Some(0));
        let t = sched("* 12-23 * * * A");
        assert_eq!(t.next_minute_single(dt(2015, 1, 1, 0, 59)).unwrap(), None);
    }

    #[test]
    fn round_up_respects_change_gap() {
        let minute = sched("0-29 13 * * * x");
        assert_eq!(minute.round_up(dt(2015, 1, 1, 13, 45)).unwrap(), dt(2015, 1, 1, 13, 45));

        let hour = sched("* 13 * * * x");
        assert_eq!(hour.round_up(dt(2015, 1, 1, 13, 45)).unwrap(), dt(2015, 1, 1, 14, 0));

        let day = sched("* * * * Mon x");
        assert_eq!(day.round_up(dt(2015, 1, 1, 13, 45)).unwrap(), dt(2015, 1, 2, 0, 0));
    }
}
