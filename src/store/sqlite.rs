//! Durable canary store backed by an embedded SQLite database.
//!
//! Secondary indexes mirror the query paths: the `(paused, late, deadline)`
//! index serves [`upcoming_deadlines`](SqliteStore::upcoming_deadlines)
//! without a full scan, and the unique `slug` index doubles as the slug
//! uniqueness guarantee. Busy/locked errors are retried transparently with
//! bounded backoff; callers only ever see the final outcome.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration as StdDuration;

use chrono::NaiveDateTime;
use rusqlite::types::Value;
use rusqlite::{Connection, params};
use tracing::warn;

use crate::error::StoreError;

use super::{Canary, CanaryListing, CanaryPatch, Field, ListOptions, Store, matches_listing};

/// Fixed-width timestamp format: lexicographic order equals time order, so
/// `ORDER BY deadline` works on the text column.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

const MAX_ATTEMPTS: u32 = 5;
const RETRY_BASE: StdDuration = StdDuration::from_millis(50);

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS canaries (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL,
    slug        TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL,
    periodicity TEXT NOT NULL,
    emails      TEXT NOT NULL,
    paused      INTEGER NOT NULL,
    late        INTEGER NOT NULL,
    deadline    TEXT,
    history     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_canaries_paused_late_deadline
    ON canaries (paused, late, deadline);
CREATE INDEX IF NOT EXISTS idx_canaries_paused_deadline
    ON canaries (paused, deadline);
CREATE INDEX IF NOT EXISTS idx_canaries_late_deadline
    ON canaries (late, deadline);
";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)
            .map_err(|e| StoreError::Backend(format!("cannot open {}: {e}", path.display())))?;
        conn.busy_timeout(StdDuration::from_secs(5))
            .map_err(|e| StoreError::Backend(format!("busy_timeout: {e}")))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| StoreError::Backend(format!("schema init: {e}")))?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn with_conn<T>(
        &self,
        op: &str,
        mut f: impl FnMut(&Connection) -> Result<T, rusqlite::Error>,
    ) -> Result<T, StoreError> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| StoreError::Backend("sqlite connection lock poisoned".into()))?;
        let mut attempt = 0;
        loop {
            match f(&conn) {
                Ok(v) => return Ok(v),
                Err(e) if is_transient(&e) && attempt < MAX_ATTEMPTS => {
                    attempt += 1;
                    warn!(op, attempt, error = %e, "transient storage failure, retrying");
                    std::thread::sleep(RETRY_BASE * attempt);
                }
                Err(e) if is_constraint(&e) => {
                    return Err(StoreError::Conflict(format!("{op}: {e}")));
                }
                Err(e) => return Err(StoreError::Backend(format!("{op}: {e}"))),
            }
        }
    }
}

fn is_transient(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}

fn is_constraint(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn fmt_timestamp(t: NaiveDateTime) -> String {
    t.format(TIMESTAMP_FORMAT).to_string()
}

fn parse_timestamp(text: &str) -> Result<NaiveDateTime, rusqlite::Error> {
    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            Box::new(e),
        )
    })
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, rusqlite::Error> {
    serde_json::to_string(value).map_err(|e| {
        rusqlite::Error::ToSqlConversionFailure(Box::new(e))
    })
}

fn from_json<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, rusqlite::Error> {
    serde_json::from_str(text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

fn row_to_canary(row: &rusqlite::Row<'_>) -> Result<Canary, rusqlite::Error> {
    let periodicity: String = row.get("periodicity")?;
    let emails: String = row.get("emails")?;
    let history: String = row.get("history")?;
    let deadline: Option<String> = row.get("deadline")?;
    Ok(Canary {
        id: row.get("id")?,
        name: row.get("name")?,
        slug: row.get("slug")?,
        description: row.get("description")?,
        periodicity: from_json(&periodicity)?,
        emails: from_json(&emails)?,
        paused: row.get("paused")?,
        late: row.get("late")?,
        deadline: deadline.as_deref().map(parse_timestamp).transpose()?,
        history: from_json(&history)?,
    })
}

impl Store for SqliteStore {
    fn create(&self, canary: &Canary) -> Result<(), StoreError> {
        let result = self.with_conn("create", |conn| {
            conn.execute(
                "INSERT INTO canaries
                 (id, name, slug, description, periodicity, emails, paused, late, deadline, history)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    canary.id,
                    canary.name,
                    canary.slug,
                    canary.description,
                    to_json(&canary.periodicity)?,
                    to_json(&canary.emails)?,
                    canary.paused,
                    canary.late,
                    canary.deadline.map(fmt_timestamp),
                    to_json(&canary.history)?,
                ],
            )
            .map(|_| ())
        });
        match result {
            Err(StoreError::Conflict(_)) => Err(StoreError::Conflict(format!(
                "canary with duplicate id or slug ({}, {})",
                canary.id, canary.slug
            ))),
            other => other,
        }
    }

    fn update(&self, id: &str, patch: &CanaryPatch) -> Result<(), StoreError> {
        let changed = self.with_conn("update", |conn| {
            let mut sets: Vec<&str> = Vec::new();
            let mut values: Vec<Value> = Vec::new();

            if let Some(name) = &patch.name {
                sets.push("name = ?");
                values.push(Value::Text(name.clone()));
            }
            if let Some(slug) = &patch.slug {
                sets.push("slug = ?");
                values.push(Value::Text(slug.clone()));
            }
            if let Some(description) = &patch.description {
                sets.push("description = ?");
                values.push(Value::Text(description.clone()));
            }
            if let Some(periodicity) = &patch.periodicity {
                sets.push("periodicity = ?");
                values.push(Value::Text(to_json(periodicity)?));
            }
            if let Some(emails) = &patch.emails {
                sets.push("emails = ?");
                values.push(Value::Text(to_json(emails)?));
            }
            if let Some(paused) = patch.paused {
                sets.push("paused = ?");
                values.push(Value::Integer(paused.into()));
            }
            if let Some(late) = patch.late {
                sets.push("late = ?");
                values.push(Value::Integer(late.into()));
            }
            match &patch.deadline {
                Field::Leave => {}
                Field::Set(deadline) => {
                    sets.push("deadline = ?");
                    values.push(Value::Text(fmt_timestamp(*deadline)));
                }
                Field::Clear => {
                    sets.push("deadline = ?");
                    values.push(Value::Null);
                }
            }
            if let Some(history) = &patch.history {
                sets.push("history = ?");
                values.push(Value::Text(to_json(history)?));
            }

            if sets.is_empty() {
                // Nothing to write; still report whether the row exists.
                return conn
                    .query_row("SELECT count(*) FROM canaries WHERE id = ?1", params![id], |row| {
                        row.get::<_, i64>(0)
                    })
                    .map(|n| n as usize);
            }

            let sql = format!("UPDATE canaries SET {} WHERE id = ?", sets.join(", "));
            values.push(Value::Text(id.to_string()));
            conn.execute(&sql, rusqlite::params_from_iter(values))
        })?;

        if changed == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Canary, StoreError> {
        let found = self.with_conn("get", |conn| {
            conn.query_row(
                "SELECT * FROM canaries WHERE id = ?1",
                params![id],
                row_to_canary,
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })?;
        found.ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn list(&self, opts: &ListOptions<'_>) -> Result<Vec<CanaryListing>, StoreError> {
        let mut sql = String::from("SELECT * FROM canaries");
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        if let Some(paused) = opts.paused {
            clauses.push("paused = ?");
            values.push(Value::Integer(paused.into()));
        }
        if let Some(late) = opts.late {
            clauses.push("late = ?");
            values.push(Value::Integer(late.into()));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }

        let rows = self.with_conn("list", |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(values.clone()), row_to_canary)?;
            rows.collect::<Result<Vec<Canary>, _>>()
        })?;

        // The regex predicate runs here rather than in SQL.
        Ok(rows
            .into_iter()
            .filter(|c| matches_listing(c, opts))
            .map(|c| {
                if opts.verbose {
                    CanaryListing::Full(Box::new(c))
                } else {
                    CanaryListing::Brief { id: c.id, name: c.name }
                }
            })
            .collect())
    }

    fn upcoming_deadlines(&self) -> Result<Vec<Canary>, StoreError> {
        self.with_conn("upcoming_deadlines", |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM canaries
                 WHERE paused = 0 AND late = 0
                 ORDER BY deadline ASC",
            )?;
            let rows = stmt.query_map([], row_to_canary)?;
            rows.collect::<Result<Vec<Canary>, _>>()
        })
    }

    fn delete(&self, id: &str) -> Result<(), StoreError> {
        let changed = self.with_conn("delete", |conn| {
            conn.execute("DELETE FROM canaries WHERE id = ?1", params![id])
        })?;
        if changed == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(())
    }

    fn find_identifier(&self, slug: &str) -> Result<String, StoreError> {
        let found = self.with_conn("find_identifier", |conn| {
            conn.query_row(
                "SELECT id FROM canaries WHERE slug = ?1",
                params![slug],
                |row| row.get::<_, String>(0),
            )
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
        })?;
        found.ok_or_else(|| StoreError::NotFound(slug.to_string()))
    }
}
