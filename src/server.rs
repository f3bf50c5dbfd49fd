//! HTTP API — a thin validation and status-mapping layer over
//! [`CanaryService`].
//!
//! All endpoints live under `/coal-mine/v1/canary/` and take form-encoded
//! query parameters. Responses are JSON: `{"status": "ok", ...}` on
//! success, `{"status": "error", "error": "..."}` otherwise. A bare
//! `GET /{8-letter-id}` is rewritten to a trigger so monitored jobs can
//! ping with a minimal URL; that endpoint is exempt from auth.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::Router;
use axum::extract::{Path, Query, RawQuery, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use regex::Regex;
use serde_json::json;
use tower_http::timeout::TimeoutLayer;
use tracing::{error, info, warn};

use crate::cadence::Periodicity;
use crate::error::CanaryError;
use crate::lifecycle::{CanaryService, CreateRequest, UpdateRequest};
use crate::store::CanaryListing;

pub const URL_PREFIX: &str = "/coal-mine/v1/canary";

/// Slow-loris guard: requests that have not completed in this long are
/// abandoned.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct ApiState {
    pub service: Arc<CanaryService>,
    pub auth_key: Option<String>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route(&format!("{URL_PREFIX}/{{command}}"), get(dispatch))
        .route("/{id}", get(trigger_shortcut))
        .fallback(not_found)
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(state)
}

async fn dispatch(
    State(state): State<ApiState>,
    Path(command): Path<String>,
    RawQuery(raw_query): RawQuery,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Response {
    info!(
        path = %format!("{URL_PREFIX}/{command}"),
        query = %redact_auth_key(raw_query.as_deref().unwrap_or("")),
        "request"
    );

    const COMMANDS: [&str; 8] =
        ["create", "delete", "update", "get", "list", "trigger", "pause", "unpause"];
    if !COMMANDS.contains(&command.as_str()) {
        return not_found().await;
    }

    let mut params = Params(pairs);

    // The trigger endpoint is exempt so monitored jobs can ping without
    // carrying a secret.
    if let Some(auth_key) = &state.auth_key {
        if command != "trigger" && params.take_last("auth_key").as_deref() != Some(auth_key.as_str()) {
            return error_response(StatusCode::UNAUTHORIZED, "401 Unauthorized");
        }
    }

    run_command(state.service.clone(), command, params).await
}

/// `GET /{id}` — rewritten internally to `trigger?id={id}`.
async fn trigger_shortcut(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Response {
    if id.len() != 8 || !id.chars().all(|c| c.is_ascii_lowercase()) {
        return not_found().await;
    }
    info!(path = %format!("/{id}"), "trigger shortcut");

    let mut params = Params(pairs);
    params.0.push(("id".to_string(), id));
    run_command(state.service.clone(), "trigger".to_string(), params).await
}

async fn run_command(service: Arc<CanaryService>, command: String, params: Params) -> Response {
    // Service calls may block on storage; keep them off the async workers.
    let outcome =
        tokio::task::spawn_blocking(move || handle_command(&service, &command, params)).await;
    match outcome {
        Ok(Ok(value)) => (StatusCode::OK, Json(value)).into_response(),
        Ok(Err(e)) => canary_error_response(e),
        Err(e) => {
            error!(error = %e, "request handler panicked");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

fn handle_command(
    service: &CanaryService,
    command: &str,
    mut params: Params,
) -> Result<serde_json::Value, CanaryError> {
    match command {
        "create" => {
            let name = params.require("name")?;
            let periodicity = Periodicity::parse_param(&params.require("periodicity")?)?;
            let description = params.take_last("description");
            let emails = params.take_all("email");
            let paused = params.take_bool("paused")?.unwrap_or(false);
            params.reject_unknown()?;

            let view = service.create(CreateRequest {
                name,
                periodicity,
                description,
                emails,
                paused,
            })?;
            Ok(json!({"status": "ok", "canary": view}))
        }
        "delete" => {
            let id = resolve_identifier(service, &mut params, true)?;
            params.reject_unknown()?;
            service.delete(&id)?;
            Ok(json!({"status": "ok"}))
        }
        "update" => {
            let id = resolve_identifier(service, &mut params, false)?;
            let name = params.take_last("name");
            let periodicity = params
                .take_last("periodicity")
                .map(|raw| Periodicity::parse_param(&raw))
                .transpose()?;
            let description = params.take_last("description");
            // "-" clears any existing addresses.
            let emails = match params.take_all("email") {
                emails if emails.is_empty() => None,
                emails if emails == ["-"] => Some(Vec::new()),
                emails => Some(emails),
            };
            params.reject_unknown()?;

            let view = service.update(&id, UpdateRequest { name, periodicity, description, emails })?;
            Ok(json!({"status": "ok", "canary": view}))
        }
        "get" => {
            let id = resolve_identifier(service, &mut params, true)?;
            params.reject_unknown()?;
            let view = service.get(&id)?;
            Ok(json!({"status": "ok", "canary": view}))
        }
        "list" => {
            let verbose = params.take_bool("verbose")?.unwrap_or(false);
            let paused = params.take_bool("paused")?;
            let late = params.take_bool("late")?;
            let search = params.take_last("search");
            params.reject_unknown()?;

            let canaries: Vec<serde_json::Value> = service
                .list(verbose, paused, late, search.as_deref())?
                .into_iter()
                .map(|listing| match listing {
                    CanaryListing::Brief { id, name } => json!({"id": id, "name": name}),
                    CanaryListing::Full(canary) => json!(canary),
                })
                .collect();
            Ok(json!({"status": "ok", "canaries": canaries}))
        }
        "trigger" => {
            let id = resolve_identifier(service, &mut params, true)?;
            let comment = params.take_last("comment").or_else(|| params.take_last("m"));
            params.reject_unknown()?;

            let (recovered, unpaused) = service.trigger(&id, comment.as_deref())?;
            Ok(json!({"status": "ok", "recovered": recovered, "unpaused": unpaused}))
        }
        "pause" => {
            let id = resolve_identifier(service, &mut params, true)?;
            let comment = params.take_last("comment");
            params.reject_unknown()?;
            let view = service.pause(&id, comment.as_deref())?;
            Ok(json!({"status": "ok", "canary": view}))
        }
        "unpause" => {
            let id = resolve_identifier(service, &mut params, true)?;
            let comment = params.take_last("comment");
            params.reject_unknown()?;
            let view = service.unpause(&id, comment.as_deref())?;
            Ok(json!({"status": "ok", "canary": view}))
        }
        _ => Err(CanaryError::Validation(format!("unknown command {command}"))),
    }
}

/// Pop exactly one of `id` / `slug` / `name` and resolve it.
fn resolve_identifier(
    service: &CanaryService,
    params: &mut Params,
    name_ok: bool,
) -> Result<String, CanaryError> {
    let mut id = None;
    let mut slug = None;
    let mut name = None;
    if let Some(value) = params.take_last("id") {
        id = Some(value);
    } else if let Some(value) = params.take_last("slug") {
        slug = Some(value);
    } else if name_ok {
        name = params.take_last("name");
    }

    if id.is_none() && slug.is_none() && name.is_none() {
        return Err(CanaryError::Validation(if name_ok {
            "must specify id, slug, or name".into()
        } else {
            "must specify id or slug".into()
        }));
    }
    service.find(name.as_deref(), slug.as_deref(), id.as_deref())
}

// ── Query parameters ──────────────────────────────────────────────────────

/// Decoded query pairs in arrival order. Handlers pop what they expect;
/// whatever is left over is an error.
struct Params(Vec<(String, String)>);

impl Params {
    /// Remove every occurrence of `key` and return the last value.
    fn take_last(&mut self, key: &str) -> Option<String> {
        let mut last = None;
        self.0.retain(|(k, v)| {
            if k == key {
                last = Some(v.clone());
                false
            } else {
                true
            }
        });
        last
    }

    /// Remove every occurrence of `key`, preserving order.
    fn take_all(&mut self, key: &str) -> Vec<String> {
        let mut values = Vec::new();
        self.0.retain(|(k, v)| {
            if k == key {
                values.push(v.clone());
                false
            } else {
                true
            }
        });
        values
    }

    fn require(&mut self, key: &str) -> Result<String, CanaryError> {
        self.take_last(key)
            .ok_or_else(|| CanaryError::Validation(format!("missing argument \"{key}\"")))
    }

    fn take_bool(&mut self, key: &str) -> Result<Option<bool>, CanaryError> {
        match self.take_last(key) {
            None => Ok(None),
            Some(value) => parse_bool(key, &value).map(Some),
        }
    }

    fn reject_unknown(&self) -> Result<(), CanaryError> {
        match self.0.first() {
            Some((key, _)) => Err(CanaryError::Validation(format!(
                "unexpected argument \"{key}\""
            ))),
            None => Ok(()),
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, CanaryError> {
    match value.to_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" | "" => Ok(false),
        _ => Err(CanaryError::Validation(format!(
            "bad boolean value \"{value}\" for parameter \"{key}\""
        ))),
    }
}

// ── Responses ─────────────────────────────────────────────────────────────

async fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "404 Not Found")
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"status": "error", "error": message}))).into_response()
}

fn canary_error_response(e: CanaryError) -> Response {
    match e {
        CanaryError::NotFound(ref ident) => {
            warn!(identifier = %ident, "canary not found");
            error_response(StatusCode::NOT_FOUND, "Canary Not Found")
        }
        CanaryError::Store(inner) => {
            error!(error = %inner, "storage failure");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
        other => {
            warn!(error = %other, "bad request");
            error_response(StatusCode::BAD_REQUEST, &other.to_string())
        }
    }
}

/// The shared secret must never reach the access log.
pub fn redact_auth_key(query: &str) -> String {
    static AUTH_KEY: OnceLock<Regex> = OnceLock::new();
    let re = AUTH_KEY.get_or_init(|| Regex::new(r"\b(auth_key=)[^&;]+").expect("static regex"));
    re.replace_all(query, "${1}<key>").into_owned()
}
