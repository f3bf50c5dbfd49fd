//! Canary persistence — record type, patch type, and the store contract.

pub mod memory;
pub mod sqlite;

use chrono::NaiveDateTime;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::cadence::Periodicity;
use crate::error::StoreError;

/// One history event: when it happened and a short note.
///
/// Serialized as a two-element `[timestamp, note]` array, which is also the
/// wire shape used by the HTTP API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "(NaiveDateTime, String)", into = "(NaiveDateTime, String)")]
pub struct HistoryEntry {
    pub at: NaiveDateTime,
    pub note: String,
}

impl From<(NaiveDateTime, String)> for HistoryEntry {
    fn from((at, note): (NaiveDateTime, String)) -> Self {
        Self { at, note }
    }
}

impl From<HistoryEntry> for (NaiveDateTime, String) {
    fn from(e: HistoryEntry) -> Self {
        (e.at, e.note)
    }
}

/// The persistent record for one monitored task.
///
/// Invariants maintained by the lifecycle layer: `deadline` is present iff
/// the canary is not paused; `slug` is derived from `name` and unique;
/// `history` is most-recent-first and never empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Canary {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub description: String,
    pub periodicity: Periodicity,
    pub emails: Vec<String>,
    pub paused: bool,
    pub late: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub deadline: Option<NaiveDateTime>,
    pub history: Vec<HistoryEntry>,
}

/// Per-field update instruction for fields that can be removed outright.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Field<T> {
    /// Keep the stored value.
    #[default]
    Leave,
    Set(T),
    /// Delete the stored value (used to clear `deadline` on pause).
    Clear,
}

/// A partial update applied atomically by [`Store::update`].
#[derive(Debug, Clone, Default)]
pub struct CanaryPatch {
    pub name: Option<String>,
    pub slug: Option<String>,
    pub description: Option<String>,
    pub periodicity: Option<Periodicity>,
    pub emails: Option<Vec<String>>,
    pub paused: Option<bool>,
    pub late: Option<bool>,
    pub deadline: Field<NaiveDateTime>,
    pub history: Option<Vec<HistoryEntry>>,
}

impl CanaryPatch {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.slug.is_none()
            && self.description.is_none()
            && self.periodicity.is_none()
            && self.emails.is_none()
            && self.paused.is_none()
            && self.late.is_none()
            && matches!(self.deadline, Field::Leave)
            && self.history.is_none()
    }

    /// Apply this patch to an owned record.
    pub fn apply_to(&self, canary: &mut Canary) {
        if let Some(name) = &self.name {
            canary.name = name.clone();
        }
        if let Some(slug) = &self.slug {
            canary.slug = slug.clone();
        }
        if let Some(description) = &self.description {
            canary.description = description.clone();
        }
        if let Some(periodicity) = &self.periodicity {
            canary.periodicity = periodicity.clone();
        }
        if let Some(emails) = &self.emails {
            canary.emails = emails.clone();
        }
        if let Some(paused) = self.paused {
            canary.paused = paused;
        }
        if let Some(late) = self.late {
            canary.late = late;
        }
        match self.deadline {
            Field::Leave => {}
            Field::Set(deadline) => canary.deadline = Some(deadline),
            Field::Clear => canary.deadline = None,
        }
        if let Some(history) = &self.history {
            canary.history = history.clone();
        }
    }
}

/// Predicates for [`Store::list`].
#[derive(Default)]
pub struct ListOptions<'a> {
    /// Full records when set; `id` + `name` summaries otherwise.
    pub verbose: bool,
    pub paused: Option<bool>,
    pub late: Option<bool>,
    /// Matched against name, slug, id, and every email address.
    pub search: Option<&'a Regex>,
}

/// One element of a [`Store::list`] result.
#[derive(Debug, Clone, PartialEq)]
pub enum CanaryListing {
    Brief { id: String, name: String },
    Full(Box<Canary>),
}

impl CanaryListing {
    pub fn id(&self) -> &str {
        match self {
            CanaryListing::Brief { id, .. } => id,
            CanaryListing::Full(c) => &c.id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            CanaryListing::Brief { name, .. } => name,
            CanaryListing::Full(c) => &c.name,
        }
    }
}

/// Whether `canary` satisfies the list predicates. Shared by both store
/// implementations so regex semantics cannot drift between them.
pub fn matches_listing(canary: &Canary, opts: &ListOptions<'_>) -> bool {
    if let Some(paused) = opts.paused {
        if canary.paused != paused {
            return false;
        }
    }
    if let Some(late) = opts.late {
        if canary.late != late {
            return false;
        }
    }
    if let Some(regex) = opts.search {
        let hit = regex.is_match(&canary.name)
            || regex.is_match(&canary.slug)
            || regex.is_match(&canary.id)
            || canary.emails.iter().any(|e| regex.is_match(e));
        if !hit {
            return false;
        }
    }
    true
}

/// Storage contract for canary records.
///
/// Implementations must return detached copies — callers may freely mutate
/// whatever they are handed — and must enforce id and slug uniqueness at
/// insert. Enumeration results are materialized; under the single-writer
/// model this is equivalent to lazy iteration.
pub trait Store: Send + Sync {
    /// Insert a new record. Fails with `Conflict` when the id or slug is
    /// already taken.
    fn create(&self, canary: &Canary) -> Result<(), StoreError>;

    /// Apply a partial update atomically.
    fn update(&self, id: &str, patch: &CanaryPatch) -> Result<(), StoreError>;

    fn get(&self, id: &str) -> Result<Canary, StoreError>;

    /// All canaries matching the given predicates, in unspecified order.
    fn list(&self, opts: &ListOptions<'_>) -> Result<Vec<CanaryListing>, StoreError>;

    /// Unpaused, not-late canaries ordered by deadline ascending.
    fn upcoming_deadlines(&self) -> Result<Vec<Canary>, StoreError>;

    fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// Identifier of the canary with the given slug.
    fn find_identifier(&self, slug: &str) -> Result<String, StoreError>;
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn dt(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2016, 6, 30).unwrap().and_hms_opt(h, m, 0).unwrap()
    }

    fn sample() -> Canary {
        Canary {
            id: "abcdefgh".into(),
            name: "sample".into(),
            slug: "sample".into(),
            description: String::new(),
            periodicity: Periodicity::Seconds(60.0),
            emails: vec![],
            paused: false,
            late: false,
            deadline: Some(dt(1, 0)),
            history: vec![HistoryEntry { at: dt(0, 59), note: "Canary created".into() }],
        }
    }

    #[test]
    fn history_entry_serializes_as_pair() {
        let e = HistoryEntry { at: dt(0, 59), note: "Triggered".into() };
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v, serde_json::json!(["2016-06-30T00:59:00", "Triggered"]));
        let back: HistoryEntry = serde_json::from_value(v).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn deadline_omitted_when_absent() {
        let mut c = sample();
        c.paused = true;
        c.deadline = None;
        let v = serde_json::to_value(&c).unwrap();
        assert!(v.get("deadline").is_none());
        assert_eq!(v["paused"], serde_json::json!(true));
    }

    #[test]
    fn patch_clear_removes_deadline() {
        let mut c = sample();
        let patch = CanaryPatch {
            paused: Some(true),
            deadline: Field::Clear,
            ..Default::default()
        };
        patch.apply_to(&mut c);
        assert!(c.paused);
        assert_eq!(c.deadline, None);
    }

    #[test]
    fn empty_patch_detected() {
        assert!(CanaryPatch::default().is_empty());
        let patch = CanaryPatch { late: Some(true), ..Default::default() };
        assert!(!patch.is_empty());
    }

    #[test]
    fn listing_predicates_cover_emails() {
        let mut c = sample();
        c.emails = vec!["ops@example.com".into()];
        let re = Regex::new("ops@").unwrap();
        let opts = ListOptions { search: Some(&re), ..Default::default() };
        assert!(matches_listing(&c, &opts));

        let re = Regex::new("nobody").unwrap();
        let opts = ListOptions { search: Some(&re), ..Default::default() };
        assert!(!matches_listing(&c, &opts));
    }

    #[test]
    fn listing_predicates_filter_flags() {
        let c = sample();
        let opts = ListOptions { paused: Some(true), ..Default::default() };
        assert!(!matches_listing(&c, &opts));
        let opts = ListOptions { late: Some(false), ..Default::default() };
        assert!(matches_listing(&c, &opts));
    }
}
