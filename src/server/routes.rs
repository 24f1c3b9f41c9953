//! Axum route handlers for the turnpace HTTP server.
//!
//! # Routes
//!
//! - `GET    /health`                       — `{"status": "ok", "version": "0.4.0"}`
//! - `POST   /conversations/:id/messages`   — inbound fragment, `202 Accepted`
//! - `GET    /conversations/:id`            — activity, admission and follow-up status
//! - `POST   /conversations/:id/follow-ups` — arm a follow-up sequence
//! - `DELETE /conversations/:id/follow-ups` — cancel the live sequence

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::orchestrator::{ConversationStatus, Orchestrator};
use crate::persuasion::ArmOutcome;
use crate::types::{Archetype, ConversationId, Fragment, FragmentKind};

/// Shared application state for the HTTP server.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
        }
    }
}

/// Build the axum router with all routes.
pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/conversations/:id", get(status_handler))
        .route("/conversations/:id/messages", post(message_handler))
        .route(
            "/conversations/:id/follow-ups",
            post(arm_handler).delete(cancel_handler),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

type ApiError = (StatusCode, Json<Value>);

fn bad_request(message: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message.into() })))
}

/// GET /health — liveness probe.
async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": crate::VERSION,
        "service": "turnpace",
    }))
}

// ---------------------------------------------------------------------------
// Inbound messages
// ---------------------------------------------------------------------------

/// Body of `POST /conversations/:id/messages`.
#[derive(Debug, Deserialize)]
pub struct InboundMessage {
    pub text: String,
    #[serde(default)]
    pub kind: FragmentKind,
}

/// POST /conversations/:id/messages — hand one fragment to the orchestrator.
///
/// The reply (if any) is delivered later through the transport; the
/// response only reports what the fragment did to follow-ups.
async fn message_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(message): Json<InboundMessage>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if id.trim().is_empty() {
        return Err(bad_request("conversation id must not be empty"));
    }
    if message.kind == FragmentKind::Text && message.text.trim().is_empty() {
        return Err(bad_request("text must not be empty"));
    }

    let id = ConversationId::from(id);
    tracing::debug!(conversation = %id, kind = ?message.kind, "inbound fragment");
    let fragment = Fragment::text(message.text).with_kind(message.kind);
    let outcome = state.orchestrator.on_fragment(&id, fragment);

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "accepted": true,
            "conversation_id": id,
            "cancelled_follow_up": outcome.cancelled.map(|s| s.sequence_id),
            "irritation": outcome.irritation,
            "apology_queued": outcome.apology_queued,
        })),
    ))
}

/// GET /conversations/:id — current status.
async fn status_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Json<ConversationStatus> {
    Json(state.orchestrator.status(&ConversationId::from(id)))
}

// ---------------------------------------------------------------------------
// Follow-ups
// ---------------------------------------------------------------------------

/// Body of `POST /conversations/:id/follow-ups`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ArmRequest {
    pub archetype: Archetype,
    pub engagement: Option<f32>,
}

/// POST /conversations/:id/follow-ups — arm (or re-arm) a sequence.
async fn arm_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<ArmRequest>>,
) -> Result<(StatusCode, Json<ArmOutcome>), ApiError> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let engagement = request.engagement.unwrap_or(0.5);
    if !(0.0..=1.0).contains(&engagement) {
        return Err(bad_request("engagement must lie in [0, 1]"));
    }

    let id = ConversationId::from(id);
    let outcome = state
        .orchestrator
        .arm_follow_up(&id, request.archetype, engagement);
    let status = match outcome {
        ArmOutcome::Armed { .. } | ArmOutcome::Superseded { .. } => StatusCode::CREATED,
        ArmOutcome::Suppressed { .. } | ArmOutcome::Exhausted => StatusCode::CONFLICT,
    };
    tracing::info!(conversation = %id, status = %status, "follow-up arm requested");
    Ok((status, Json(outcome)))
}

/// DELETE /conversations/:id/follow-ups — cancel the live sequence.
async fn cancel_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id = ConversationId::from(id);
    match state.orchestrator.cancel_follow_up(&id) {
        Some(snapshot) => Ok(Json(json!({ "cancelled": snapshot }))),
        None => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("no live follow-up sequence for {}", id) })),
        )),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
