//! Upgrade endpoints for the three hubs.
//!
//! Every rejection happens before the socket upgrade, as a structured
//! HTTP error. The checks run in a fixed order: origin allow-list,
//! capacity, token (signature, expiry, revocation, account lock), then
//! topic membership. Auth is via `?token=` query parameter; browsers
//! cannot set headers on a WebSocket handshake.

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::header::ORIGIN,
    http::HeaderMap,
    response::Response,
};
use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use crate::error::UpgradeError;
use crate::hub::HubHandle;
use crate::state::AppState;
use crate::ws::actor::{self, ConnectionCtx};
use crate::{auth, presence::PresenceTracker};

#[derive(Debug, Deserialize)]
pub struct ChatQuery {
    pub conversation_id: Uuid,
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct SignalingQuery {
    pub call_id: Uuid,
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct PollQuery {
    pub conversation_id: Uuid,
    pub token: String,
}

/// GET /ws/chat?conversation_id=...&token=...
pub async fn chat_upgrade(
    State(state): State<AppState>,
    Query(params): Query<ChatQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, UpgradeError> {
    let hub = state.chat.clone();
    let presence = Some(state.presence.clone());
    upgrade(state, hub, headers, ws, params.token, params.conversation_id, presence).await
}

/// GET /ws/signaling?call_id=...&token=...
pub async fn signaling_upgrade(
    State(state): State<AppState>,
    Query(params): Query<SignalingQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, UpgradeError> {
    let hub = state.signaling.clone();
    upgrade(state, hub, headers, ws, params.token, params.call_id, None).await
}

/// GET /ws/poll?conversation_id=...&token=...
pub async fn poll_upgrade(
    State(state): State<AppState>,
    Query(params): Query<PollQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, UpgradeError> {
    let hub = state.poll.clone();
    upgrade(state, hub, headers, ws, params.token, params.conversation_id, None).await
}

async fn upgrade(
    state: AppState,
    hub: HubHandle,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
    token: String,
    topic: Uuid,
    presence: Option<std::sync::Arc<PresenceTracker>>,
) -> Result<Response, UpgradeError> {
    check_origin(&headers, &state.config.allowed_origins)?;

    // Reserve the slot before the token work so a full server answers
    // cheaply.
    let permit = hub.try_acquire_permit()?;

    let claims = auth::authenticate(&state.jwt_secret, &token, &state.sessions).await?;

    if !state.membership.is_participant(claims.sub, topic).await? {
        return Err(UpgradeError::NotParticipant);
    }

    let keepalive = state.config.keepalive;
    Ok(ws.on_upgrade(move |socket| {
        actor::run_connection(
            socket,
            hub,
            ConnectionCtx {
                user_id: claims.sub,
                topic,
                permit,
                keepalive,
                presence,
            },
        )
    }))
}

/// A missing, empty, or unlisted Origin header rejects the upgrade.
fn check_origin(headers: &HeaderMap, allowed: &[String]) -> Result<(), UpgradeError> {
    let origin = headers
        .get(ORIGIN)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if origin.is_empty() || !allowed.iter().any(|a| a == origin) {
        warn!(origin, "upgrade rejected by origin policy");
        return Err(UpgradeError::OriginNotAllowed);
    }
    Ok(())
}
