//! Canary lifecycle — orchestration over the cadence evaluator, the store,
//! the deadline engine, and the notifier.
//!
//! Every mutating operation commits to the store, then asks the engine to
//! rearm. Mutations serialize through one exclusive section; the
//! single-writer model makes finer-grained locking pointless here.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use chrono::{Duration, NaiveDateTime, Utc};
use rand::Rng;
use regex::Regex;
use serde::Serialize;
use tracing::info;

use crate::cadence::{self, Activity, Periodicity, Window};
use crate::engine::EngineHandle;
use crate::error::{CanaryError, StoreError};
use crate::notify::{Notifier, NotifyKind};
use crate::store::{Canary, CanaryListing, CanaryPatch, Field, HistoryEntry, ListOptions, Store};

/// History is trimmed from the tail while longer than this…
const HISTORY_HARD_CAP: usize = 1000;
/// …or while longer than this with a tail entry older than a week.
const HISTORY_SOFT_CAP: usize = 100;

const IDENTIFIER_LEN: usize = 8;

/// A canary as returned to operators: the record plus, for schedule
/// cadences, the upcoming activity windows.
#[derive(Debug, Clone, Serialize)]
pub struct CanaryView {
    #[serde(flatten)]
    pub canary: Canary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub periodicity_schedule: Option<Vec<ScheduleSlot>>,
}

/// One display window: `[start, end, seconds]`, where `seconds` is the
/// string `"Inactive"` for gaps.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleSlot {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
    pub seconds: Option<f64>,
}

impl Serialize for ScheduleSlot {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeTuple;
        let mut tuple = serializer.serialize_tuple(3)?;
        tuple.serialize_element(&self.start)?;
        tuple.serialize_element(&self.end)?;
        match self.seconds {
            Some(seconds) => tuple.serialize_element(&seconds)?,
            None => tuple.serialize_element("Inactive")?,
        }
        tuple.end()
    }
}

pub struct CreateRequest {
    pub name: String,
    pub periodicity: Periodicity,
    pub description: Option<String>,
    pub emails: Vec<String>,
    pub paused: bool,
}

#[derive(Debug, Default)]
pub struct UpdateRequest {
    pub name: Option<String>,
    pub periodicity: Option<Periodicity>,
    pub description: Option<String>,
    pub emails: Option<Vec<String>>,
}

pub struct CanaryService {
    store: Arc<dyn Store>,
    notifier: Arc<dyn Notifier>,
    engine: EngineHandle,
    write_lock: Mutex<()>,
}

impl CanaryService {
    pub fn new(store: Arc<dyn Store>, notifier: Arc<dyn Notifier>, engine: EngineHandle) -> Self {
        Self { store, notifier, engine, write_lock: Mutex::new(()) }
    }

    pub fn create(&self, req: CreateRequest) -> Result<CanaryView, CanaryError> {
        let _guard = self.lock()?;

        if req.name.is_empty() {
            return Err(CanaryError::Validation("name must be non-empty".into()));
        }
        let slug = slugify(&req.name);
        self.check_slug_free(&slug)?;

        let now = Utc::now().naive_utc();
        cadence::validate(&req.periodicity, now)?;

        let id = self.generate_identifier()?;
        let deadline = if req.paused {
            None
        } else {
            Some(cadence::next_deadline(&req.periodicity, now)?)
        };
        let canary = Canary {
            id: id.clone(),
            name: req.name,
            slug,
            description: req.description.unwrap_or_default(),
            periodicity: req.periodicity,
            emails: req.emails,
            paused: req.paused,
            late: false,
            deadline,
            history: vec![HistoryEntry { at: now, note: "Canary created".into() }],
        };
        self.store.create(&canary)?;
        info!(canary = %id, name = %canary.name, slug = %canary.slug, "created canary");

        self.engine.rearm();
        self.view(self.store.get(&id)?)
    }

    pub fn update(&self, id: &str, req: UpdateRequest) -> Result<CanaryView, CanaryError> {
        let _guard = self.lock()?;

        let mut canary = self.store.get(id)?;
        let mut patch = CanaryPatch::default();
        let mut notify = None;

        if let Some(name) = req.name {
            if name != canary.name {
                if name.is_empty() {
                    return Err(CanaryError::Validation("name must be non-empty".into()));
                }
                let new_slug = slugify(&name);
                if new_slug != canary.slug {
                    self.check_slug_free(&new_slug)?;
                    patch.slug = Some(new_slug);
                }
                patch.name = Some(name);
            }
        }

        if let Some(periodicity) = req.periodicity {
            if periodicity != canary.periodicity {
                let now = Utc::now().naive_utc();
                cadence::validate(&periodicity, now)?;

                if !canary.paused {
                    let anchor = last_event(&canary)?;
                    let deadline = cadence::next_deadline(&periodicity, anchor)?;
                    patch.deadline = Field::Set(deadline);
                    // A cadence change can move the canary across the
                    // now-boundary in either direction.
                    let is_late = deadline < now;
                    if is_late != canary.late {
                        patch.late = Some(is_late);
                        notify = Some(if is_late { NotifyKind::Late } else { NotifyKind::Recovered });
                    }
                }
                patch.periodicity = Some(periodicity);
            }
        }

        if let Some(description) = req.description {
            if description != canary.description {
                patch.description = Some(description);
            }
        }

        if let Some(emails) = req.emails {
            let new: HashSet<&str> = emails.iter().map(String::as_str).collect();
            let old: HashSet<&str> = canary.emails.iter().map(String::as_str).collect();
            if new != old {
                patch.emails = Some(emails);
            }
        }

        if patch.is_empty() {
            return Err(CanaryError::Validation("no updates specified".into()));
        }

        self.store.update(id, &patch)?;
        patch.apply_to(&mut canary);
        info!(canary = %id, name = %canary.name, "updated canary");

        if let Some(kind) = notify {
            self.notifier.notify(&canary, kind);
        }
        self.engine.rearm();
        self.view(self.store.get(id)?)
    }

    /// Record a ping. Returns `(was_late, was_paused)` so integrations can
    /// tell a routine trigger from a recovery or an implicit unpause.
    pub fn trigger(&self, id: &str, comment: Option<&str>) -> Result<(bool, bool), CanaryError> {
        let _guard = self.lock()?;

        let mut canary = self.store.get(id)?;
        let was_late = canary.late;
        let was_paused = canary.paused;

        let note = annotate("Triggered", comment);
        let now = Utc::now().naive_utc();
        let mut history = canary.history.clone();
        add_history(&mut history, note.clone(), now);

        let deadline = cadence::next_deadline(&canary.periodicity, now)?;
        let mut patch = CanaryPatch {
            history: Some(history),
            deadline: Field::Set(deadline),
            ..Default::default()
        };
        if canary.late {
            patch.late = Some(false);
        }
        if canary.paused {
            // Triggering implicitly unpauses.
            patch.paused = Some(false);
        }

        self.store.update(id, &patch)?;
        patch.apply_to(&mut canary);
        info!(canary = %id, name = %canary.name, comment = %note, "triggered canary");

        if was_late {
            self.notifier.notify(&canary, NotifyKind::Recovered);
        }
        self.engine.rearm();
        Ok((was_late, was_paused))
    }

    pub fn pause(&self, id: &str, comment: Option<&str>) -> Result<CanaryView, CanaryError> {
        let _guard = self.lock()?;

        let mut canary = self.store.get(id)?;
        if canary.paused {
            return Err(CanaryError::AlreadyPaused);
        }

        let note = annotate("Paused", comment);
        let now = Utc::now().naive_utc();
        let mut history = canary.history.clone();
        add_history(&mut history, note.clone(), now);

        let mut patch = CanaryPatch {
            paused: Some(true),
            history: Some(history),
            deadline: Field::Clear,
            ..Default::default()
        };
        if canary.late {
            patch.late = Some(false);
        }

        self.store.update(id, &patch)?;
        patch.apply_to(&mut canary);
        info!(canary = %id, name = %canary.name, comment = %note, "paused canary");

        self.engine.rearm();
        self.view(self.store.get(id)?)
    }

    pub fn unpause(&self, id: &str, comment: Option<&str>) -> Result<CanaryView, CanaryError> {
        let _guard = self.lock()?;

        let mut canary = self.store.get(id)?;
        if !canary.paused {
            return Err(CanaryError::AlreadyUnpaused);
        }

        let note = annotate("Unpaused", comment);
        let now = Utc::now().naive_utc();
        let mut history = canary.history.clone();
        add_history(&mut history, note.clone(), now);

        let deadline = cadence::next_deadline(&canary.periodicity, now)?;
        let patch = CanaryPatch {
            paused: Some(false),
            history: Some(history),
            deadline: Field::Set(deadline),
            ..Default::default()
        };

        self.store.update(id, &patch)?;
        patch.apply_to(&mut canary);
        info!(canary = %id, name = %canary.name, comment = %note, "unpaused canary");

        self.engine.rearm();
        self.view(self.store.get(id)?)
    }

    pub fn delete(&self, id: &str) -> Result<(), CanaryError> {
        let _guard = self.lock()?;

        let canary = self.store.get(id)?;
        self.store.delete(id)?;
        info!(canary = %id, name = %canary.name, "deleted canary");

        self.engine.rearm();
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<CanaryView, CanaryError> {
        let canary = self.store.get(id)?;
        self.view(canary)
    }

    pub fn list(
        &self,
        verbose: bool,
        paused: Option<bool>,
        late: Option<bool>,
        search: Option<&str>,
    ) -> Result<Vec<CanaryListing>, CanaryError> {
        let regex = search
            .map(Regex::new)
            .transpose()
            .map_err(|e| CanaryError::Validation(format!("bad search pattern: {e}")))?;
        let opts = ListOptions { verbose, paused, late, search: regex.as_ref() };
        Ok(self.store.list(&opts)?)
    }

    /// Resolve exactly one of name / slug / id to an identifier. A bare id
    /// is returned as-is; existence is checked by whatever operation
    /// follows.
    pub fn find(
        &self,
        name: Option<&str>,
        slug: Option<&str>,
        id: Option<&str>,
    ) -> Result<String, CanaryError> {
        let specified = [name, slug, id].iter().filter(|v| v.is_some()).count();
        if specified == 0 {
            return Err(CanaryError::Validation(
                "must specify name, slug, or identifier".into(),
            ));
        }
        if specified > 1 {
            return Err(CanaryError::Validation(
                "specify only one of name, slug, or identifier".into(),
            ));
        }

        if let Some(id) = id {
            return Ok(id.to_string());
        }
        let slug = match (name, slug) {
            (Some(name), _) => slugify(name),
            (_, Some(slug)) => slug.to_string(),
            _ => unreachable!("checked above"),
        };
        Ok(self.store.find_identifier(&slug)?)
    }

    // ── Internals ─────────────────────────────────────────────────────

    fn lock(&self) -> Result<MutexGuard<'_, ()>, CanaryError> {
        self.write_lock
            .lock()
            .map_err(|_| CanaryError::Store(StoreError::Backend("lifecycle lock poisoned".into())))
    }

    fn check_slug_free(&self, slug: &str) -> Result<(), CanaryError> {
        match self.store.find_identifier(slug) {
            Ok(conflict) => Err(CanaryError::AlreadyExists(format!(
                "canary {slug} already exists with identifier {conflict}"
            ))),
            Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn generate_identifier(&self) -> Result<String, CanaryError> {
        let mut rng = rand::thread_rng();
        loop {
            let id: String = (0..IDENTIFIER_LEN)
                .map(|_| char::from(b'a' + rng.gen_range(0..26)))
                .collect();
            match self.store.get(&id) {
                Err(StoreError::NotFound(_)) => return Ok(id),
                Ok(_) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn view(&self, canary: Canary) -> Result<CanaryView, CanaryError> {
        let periodicity_schedule = match &canary.periodicity {
            Periodicity::Seconds(_) => None,
            Periodicity::Schedule(text) => {
                let now = Utc::now().naive_utc();
                let windows = cadence::display_schedule(text, now)?;
                Some(windows.into_iter().map(window_to_slot).collect())
            }
        };
        Ok(CanaryView { canary, periodicity_schedule })
    }
}

fn last_event(canary: &Canary) -> Result<NaiveDateTime, CanaryError> {
    canary
        .history
        .first()
        .map(|e| e.at)
        .ok_or_else(|| CanaryError::Validation("canary has no history".into()))
}

fn annotate(verb: &str, comment: Option<&str>) -> String {
    match comment {
        Some(comment) if !comment.is_empty() => format!("{verb} ({comment})"),
        _ => verb.to_string(),
    }
}

fn window_to_slot(window: Window) -> ScheduleSlot {
    let seconds = match &window.activity {
        Activity::Single(cmd) => cmd.trim().parse().ok(),
        _ => None,
    };
    ScheduleSlot { start: window.start, end: window.end, seconds }
}

/// Canonical, URL-safe form of a canary name. Idempotent.
pub fn slugify(name: &str) -> String {
    static COLLAPSE: OnceLock<Regex> = OnceLock::new();
    static STRIP: OnceLock<Regex> = OnceLock::new();
    let collapse = COLLAPSE.get_or_init(|| Regex::new(r"[-\s_]+").expect("static regex"));
    let strip = STRIP.get_or_init(|| Regex::new(r"[^-\w]+").expect("static regex"));

    let lowered = name.to_lowercase();
    let collapsed = collapse.replace_all(&lowered, "-");
    strip.replace_all(&collapsed, "").into_owned()
}

/// Prepend an event, then trim from the tail while the history is over the
/// hard cap, or over the soft cap with a tail entry older than seven days.
pub fn add_history(history: &mut Vec<HistoryEntry>, note: String, now: NaiveDateTime) {
    let one_week_ago = now - Duration::days(7);
    history.insert(0, HistoryEntry { at: now, note });
    while history.len() > HISTORY_HARD_CAP
        || (history.len() > HISTORY_SOFT_CAP
            && history.last().is_some_and(|e| e.at < one_week_ago))
    {
        history.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn dt(d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2016, 6, d).unwrap().and_hms_opt(h, 0, 0).unwrap()
    }

    #[test]
    fn slugify_collapses_and_strips() {
        assert_eq!(slugify("My Canary"), "my-canary");
        assert_eq!(slugify("a_b - c"), "a-b-c");
        assert_eq!(slugify("weird!@#chars"), "weirdchars");
        assert_eq!(slugify("FOO"), "foo");
    }

    #[test]
    fn slugify_is_idempotent() {
        for name in ["My Canary", "a_b - c", "weird!@#chars", "already-slugged"] {
            let once = slugify(name);
            assert_eq!(slugify(&once), once);
        }
    }

    #[test]
    fn add_history_prepends() {
        let mut history = vec![HistoryEntry { at: dt(1, 0), note: "Canary created".into() }];
        add_history(&mut history, "Triggered".into(), dt(2, 0));
        assert_eq!(history[0].note, "Triggered");
        assert_eq!(history[1].note, "Canary created");
    }

    #[test]
    fn add_history_hard_cap() {
        let mut history = Vec::new();
        for _ in 0..1100 {
            add_history(&mut history, "Triggered".into(), dt(30, 23));
        }
        assert_eq!(history.len(), HISTORY_HARD_CAP);
    }

    #[test]
    fn add_history_age_trim_stops_at_soft_cap() {
        // 200 stale entries, all older than a week relative to "now".
        let mut history = Vec::new();
        for _ in 0..200 {
            history.push(HistoryEntry { at: dt(1, 0), note: "Triggered".into() });
        }
        add_history(&mut history, "Triggered".into(), dt(30, 0));
        // Trimmed down to the soft cap; the fresh entry is at the front.
        assert_eq!(history.len(), HISTORY_SOFT_CAP);
        assert_eq!(history[0].at, dt(30, 0));
    }

    #[test]
    fn add_history_keeps_recent_entries_over_soft_cap() {
        let mut history = Vec::new();
        for _ in 0..200 {
            history.push(HistoryEntry { at: dt(29, 0), note: "Triggered".into() });
        }
        add_history(&mut history, "Triggered".into(), dt(30, 0));
        // Everything is within a week, so only the hard cap applies.
        assert_eq!(history.len(), 201);
    }

    #[test]
    fn annotate_folds_comment() {
        assert_eq!(annotate("Triggered", None), "Triggered");
        assert_eq!(annotate("Triggered", Some("")), "Triggered");
        assert_eq!(annotate("Paused", Some("maintenance")), "Paused (maintenance)");
    }
}
