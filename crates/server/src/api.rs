//! HTTP handlers for the status surface.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use episodic_scheduler::{GroupSnapshot, LockDiagnostics, StatusSnapshot};

use crate::state::AppState;

// ── Health ────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub uptime_seconds: i64,
    pub drained: bool,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: (Utc::now() - state.started_at).num_seconds(),
        drained: state.status.is_drained(),
    })
}

// ── Queues ────────────────────────────────────────────────────────

/// Every group plus lock state; `group_queues` is keyed by group.
pub async fn queue_status(State(state): State<Arc<AppState>>) -> Json<StatusSnapshot> {
    Json(state.status.get_snapshot())
}

pub async fn group_status(
    State(state): State<Arc<AppState>>,
    Path(group): Path<String>,
) -> Result<Json<GroupSnapshot>, ApiError> {
    state
        .status
        .group(&group)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no queue for group '{}'", group)))
}

// ── Lock ──────────────────────────────────────────────────────────

pub async fn lock_status(State(state): State<Arc<AppState>>) -> Json<LockDiagnostics> {
    Json(state.status.lock_diagnostics())
}

// ── Errors ────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (code, message) = match self {
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
        };
        (code, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
