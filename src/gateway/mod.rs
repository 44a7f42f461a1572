//! HTTP ingress: the messaging-gateway webhook, the session admin API, and
//! a health probe.
//!
//! The webhook only logs the message and acknowledges. The invocation it
//! triggers runs detached and never reports back to the caller.

pub mod api;

use crate::auto_reply::{self, Dispatcher, InboundMessage};
use crate::channels::{self, WebhookEvent};
use crate::config::{Config, GatewayConfig};
use crate::providers;
use crate::sessions::{self, InboundRecord, MessageLog, SessionStore, Store};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post, put},
    Router,
};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Token checks for the two authenticated surfaces. Only digests are kept.
#[derive(Debug, Clone, Default)]
pub struct GatewayAuth {
    api_token: Option<[u8; 32]>,
    webhook_token: Option<[u8; 32]>,
}

fn digest(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
}

impl GatewayAuth {
    pub fn from_config(config: &GatewayConfig) -> Self {
        let configured = |token: &Option<String>| {
            token
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(digest)
        };
        Self {
            api_token: configured(&config.api_token),
            webhook_token: configured(&config.webhook_token),
        }
    }

    pub fn api_protected(&self) -> bool {
        self.api_token.is_some()
    }

    pub fn allows_api(&self, headers: &HeaderMap) -> bool {
        match self.api_token {
            None => true,
            Some(expected) => {
                extract_bearer_token(headers).is_some_and(|token| digest(token) == expected)
            }
        }
    }

    /// The messaging gateway may send its token as a bearer header or `?token=`.
    pub fn allows_webhook(&self, headers: &HeaderMap, query_token: Option<&str>) -> bool {
        match self.webhook_token {
            None => true,
            Some(expected) => extract_bearer_token(headers)
                .or(query_token)
                .is_some_and(|token| digest(token) == expected),
        }
    }
}

/// Shared state for all axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub auth: Arc<GatewayAuth>,
    /// Messaging instance this relay serves; events from other instances are dropped.
    pub instance_id: Option<Arc<str>>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, dispatcher: Arc<dyn Dispatcher>, auth: GatewayAuth) -> Self {
        Self {
            store,
            dispatcher,
            auth: Arc::new(auth),
            instance_id: None,
            started_at: Instant::now(),
        }
    }

    #[must_use]
    pub fn with_instance(mut self, instance_id: Option<&str>) -> Self {
        self.instance_id = instance_id
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(Arc::from);
        self
    }

    fn serves_instance(&self, event_instance: Option<&str>) -> bool {
        match (&self.instance_id, event_instance) {
            (Some(ours), Some(theirs)) => ours.as_ref() == theirs,
            _ => true,
        }
    }
}

pub fn build_router(state: AppState, config: &GatewayConfig) -> Router {
    Router::new()
        .route("/health", get(handle_health))
        .route("/webhook", post(handle_webhook))
        .route(
            "/api/sessions",
            get(api::handle_list_sessions).post(api::handle_start_session),
        )
        .route("/api/sessions/{id}", get(api::handle_get_session))
        .route("/api/sessions/{id}/ai", put(api::handle_set_ai))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(config.body_limit_bytes))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(config.request_timeout_secs),
        ))
}

/// GET /health
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    let store_ok = state.store.list_sessions(1).await.is_ok();
    let status = if store_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(serde_json::json!({
            "status": if store_ok { "ok" } else { "degraded" },
            "store": state.store.name(),
            "dispatcher": state.dispatcher.name(),
            "uptime_seconds": state.started_at.elapsed().as_secs(),
        })),
    )
}

#[derive(Debug, Deserialize)]
pub struct WebhookQuery {
    pub token: Option<String>,
}

fn ack(status: &str, extra: serde_json::Value) -> (StatusCode, Json<serde_json::Value>) {
    let mut body = serde_json::json!({ "status": status });
    if let (Some(body), serde_json::Value::Object(extra)) = (body.as_object_mut(), extra) {
        body.extend(extra);
    }
    (StatusCode::OK, Json(body))
}

/// POST /webhook: log the inbound message, then start its invocation.
async fn handle_webhook(
    State(state): State<AppState>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if !state.auth.allows_webhook(&headers, query.token.as_deref()) {
        tracing::warn!("Webhook rejected: invalid or missing token");
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "invalid webhook token" })),
        );
    }

    let event = match channels::parse_webhook(&body) {
        Ok(WebhookEvent::Message(event)) => event,
        Ok(WebhookEvent::Ignored { reason }) => {
            tracing::debug!(reason, "Webhook event ignored");
            return ack("ignored", serde_json::json!({ "reason": reason }));
        }
        Err(error) => {
            tracing::warn!("Malformed webhook payload: {error}");
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": error.to_string() })),
            );
        }
    };

    if !state.serves_instance(event.instance_id.as_deref()) {
        tracing::warn!(
            instance_id = event.instance_id.as_deref().unwrap_or_default(),
            "Webhook event from another messaging instance ignored"
        );
        return ack("ignored", serde_json::json!({ "reason": "foreign instance" }));
    }

    let session = match state.store.find_active_session(&event.client_id).await {
        Ok(Some(session)) => session,
        Ok(None) => {
            tracing::info!(
                provider_message_id = %event.provider_message_id,
                "No active session for sender; message dropped"
            );
            return ack("ignored", serde_json::json!({ "reason": "no active session" }));
        }
        Err(error) => return store_unavailable(&error),
    };

    let record = InboundRecord {
        provider_message_id: event.provider_message_id.clone(),
        content: event.content.clone(),
        kind: event.kind,
    };
    let appended = match state.store.append_inbound(&session.id, record).await {
        Ok(appended) => appended,
        Err(error) => return store_unavailable(&error),
    };
    let message = appended.message;
    tracing::info!(
        session_id = %session.id,
        message_id = message.id,
        kind = message.kind.as_str(),
        sender_name = event.sender_name.as_deref().unwrap_or_default(),
        sent_at = ?event.sent_at,
        duplicate = appended.duplicate,
        "Inbound message logged"
    );

    if appended.duplicate {
        tracing::debug!(
            session_id = %session.id,
            message_id = message.id,
            "Duplicate delivery acknowledged"
        );
        return ack(
            "duplicate",
            serde_json::json!({ "session_id": session.id, "message_id": message.id }),
        );
    }

    if !message.kind.triggers_reply() || !session.ai_enabled {
        return ack(
            "logged",
            serde_json::json!({
                "session_id": session.id,
                "message_id": message.id,
                "ai_enabled": session.ai_enabled,
            }),
        );
    }

    let context = auto_reply::new_invocation();
    let invocation = context.invocation.clone();
    let inbound = InboundMessage {
        session_id: session.id.clone(),
        message_id: message.id,
        client_id: event.client_id,
        kind: message.kind,
        received_at: message.created_at,
    };
    let dispatcher = Arc::clone(&state.dispatcher);
    tokio::spawn(async move {
        dispatcher.dispatch(inbound, &context).await;
    });

    ack(
        "accepted",
        serde_json::json!({
            "session_id": session.id,
            "message_id": message.id,
            "invocation": invocation,
        }),
    )
}

fn store_unavailable(error: &anyhow::Error) -> (StatusCode, Json<serde_json::Value>) {
    tracing::error!("Store unavailable while handling webhook: {error:#}");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(serde_json::json!({ "error": "store unavailable" })),
    )
}

/// Wire the store and collaborators from config and serve until shutdown.
pub async fn run_gateway(config: Config) -> Result<()> {
    let store = sessions::create_store(&config.storage)?;
    let responder = providers::create_responder(&config.responder);
    let sender = channels::create_sender(&config.messaging);
    let replies =
        auto_reply::create_reply_dispatcher(&config, Arc::clone(&store), responder, sender);
    let dispatcher = auto_reply::create_dispatcher(&config, Arc::clone(&store), replies);

    let auth = GatewayAuth::from_config(&config.gateway);
    if !auth.api_protected() {
        tracing::warn!("gateway.api_token is not set; the session admin API is unauthenticated");
    }
    let state =
        AppState::new(store, dispatcher, auth).with_instance(config.messaging.instance_id.as_deref());
    let app = build_router(state, &config.gateway);

    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind gateway to {addr}"))?;
    tracing::info!(%addr, "prospect-relay gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Gateway server failed")?;
    tracing::info!("Gateway shut down");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(error) => {
                tracing::error!("Failed to install SIGTERM handler: {error}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::warn!("Shutdown signal received; draining connections");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers_with_bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            format!("Bearer {token}").parse().unwrap(),
        );
        headers
    }

    #[test]
    fn open_gateway_allows_everything() {
        let auth = GatewayAuth::default();
        assert!(auth.allows_api(&HeaderMap::new()));
        assert!(auth.allows_webhook(&HeaderMap::new(), None));
        assert!(!auth.api_protected());
    }

    #[test]
    fn webhook_token_accepted_from_header_or_query() {
        let auth = GatewayAuth::from_config(&GatewayConfig {
            webhook_token: Some("hook-secret".into()),
            ..GatewayConfig::default()
        });
        assert!(auth.allows_webhook(&headers_with_bearer("hook-secret"), None));
        assert!(auth.allows_webhook(&HeaderMap::new(), Some("hook-secret")));
        assert!(!auth.allows_webhook(&HeaderMap::new(), Some("wrong")));
        assert!(!auth.allows_webhook(&HeaderMap::new(), None));
        // API stays open when only the webhook token is set.
        assert!(auth.allows_api(&HeaderMap::new()));
    }

    #[test]
    fn api_token_requires_exact_bearer() {
        let auth = GatewayAuth::from_config(&GatewayConfig {
            api_token: Some("admin".into()),
            ..GatewayConfig::default()
        });
        assert!(auth.allows_api(&headers_with_bearer("admin")));
        assert!(!auth.allows_api(&headers_with_bearer("admin2")));
        assert!(!auth.allows_api(&HeaderMap::new()));
    }

    #[test]
    fn blank_tokens_count_as_unset() {
        let auth = GatewayAuth::from_config(&GatewayConfig {
            api_token: Some("   ".into()),
            webhook_token: Some(String::new()),
            ..GatewayConfig::default()
        });
        assert!(!auth.api_protected());
        assert!(auth.allows_webhook(&HeaderMap::new(), None));
    }

    #[test]
    fn ack_merges_extra_fields() {
        let (status, Json(body)) = ack("logged", serde_json::json!({ "message_id": 7 }));
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "logged");
        assert_eq!(body["message_id"], 7);
    }
}
