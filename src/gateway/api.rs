//! Session admin API.
//!
//! All `/api/*` routes require `Authorization: Bearer <gateway.api_token>`
//! when a token is configured.

use super::AppState;
use crate::sessions::{AuditLog, MessageLog, SessionId, SessionStore};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::Utc;
use serde::Deserialize;

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

fn require_auth(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    if state.auth.allows_api(headers) {
        return Ok(());
    }
    Err((
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({
            "error": "Unauthorized: send Authorization: Bearer <gateway.api_token>"
        })),
    )
        .into_response())
}

fn store_error(error: &anyhow::Error) -> Response {
    tracing::error!("Admin API store error: {error:#}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": format!("store error: {error}") })),
    )
        .into_response()
}

fn not_found(id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": format!("session {id} not found") })),
    )
        .into_response()
}

// ── Query parameters and bodies ─────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

impl LimitQuery {
    fn resolved(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT)
    }
}

#[derive(Debug, Deserialize)]
pub struct StartSessionBody {
    pub client_id: String,
}

#[derive(Debug, Deserialize)]
pub struct AiToggleBody {
    pub enabled: bool,
}

// ── Handlers ────────────────────────────────────────────────────

/// POST /api/sessions: start a conversation, or return the active one.
pub async fn handle_start_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<StartSessionBody>,
) -> Response {
    if let Err(e) = require_auth(&state, &headers) {
        return e;
    }

    let client_id = body.client_id.trim();
    if client_id.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "client_id must not be empty" })),
        )
            .into_response();
    }

    match state.store.find_active_session(client_id).await {
        Ok(Some(session)) => {
            return Json(serde_json::json!({ "session": session, "created": false }))
                .into_response()
        }
        Ok(None) => {}
        Err(e) => return store_error(&e),
    }

    match state.store.create_session(client_id).await {
        Ok(session) => {
            tracing::info!(session_id = %session.id, "Session started via admin API");
            (
                StatusCode::CREATED,
                Json(serde_json::json!({ "session": session, "created": true })),
            )
                .into_response()
        }
        Err(e) => store_error(&e),
    }
}

/// GET /api/sessions
pub async fn handle_list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<LimitQuery>,
) -> Response {
    if let Err(e) = require_auth(&state, &headers) {
        return e;
    }

    match state.store.list_sessions(query.resolved()).await {
        Ok(sessions) => Json(serde_json::json!({ "sessions": sessions })).into_response(),
        Err(e) => store_error(&e),
    }
}

/// GET /api/sessions/{id}: the row with its lock state, transcript and audit trail.
pub async fn handle_get_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Response {
    if let Err(e) = require_auth(&state, &headers) {
        return e;
    }

    let session_id = SessionId::from_string(id.clone());
    let session = match state.store.get_session(&session_id).await {
        Ok(Some(session)) => session,
        Ok(None) => return not_found(&id),
        Err(e) => return store_error(&e),
    };
    let limit = query.resolved();
    let transcript = match state.store.transcript(&session_id, limit).await {
        Ok(messages) => messages,
        Err(e) => return store_error(&e),
    };
    let audit = match state.store.audit_trail(&session_id, limit).await {
        Ok(entries) => entries,
        Err(e) => return store_error(&e),
    };

    Json(serde_json::json!({
        "lock_held": session.lock_held_at(Utc::now()),
        "session": session,
        "transcript": transcript,
        "audit": audit,
    }))
    .into_response()
}

/// PUT /api/sessions/{id}/ai
pub async fn handle_set_ai(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<AiToggleBody>,
) -> Response {
    if let Err(e) = require_auth(&state, &headers) {
        return e;
    }

    let session_id = SessionId::from_string(id.clone());
    match state.store.set_ai_enabled(&session_id, body.enabled).await {
        Ok(true) => {
            tracing::info!(session_id = %session_id, enabled = body.enabled, "AI toggled");
            Json(serde_json::json!({ "session_id": session_id, "ai_enabled": body.enabled }))
                .into_response()
        }
        Ok(false) => not_found(&id),
        Err(e) => store_error(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_defaults_and_clamps() {
        assert_eq!(LimitQuery { limit: None }.resolved(), DEFAULT_LIST_LIMIT);
        assert_eq!(LimitQuery { limit: Some(0) }.resolved(), 1);
        assert_eq!(LimitQuery { limit: Some(10_000) }.resolved(), MAX_LIST_LIMIT);
        assert_eq!(LimitQuery { limit: Some(7) }.resolved(), 7);
    }
}
