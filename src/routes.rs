use axum::{middleware, Json, Router};
use std::sync::Arc;
use tower_governor::key_extractor::PeerIpKeyExtractor;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};

use crate::auth::{Claims, JwtSecret};
use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// Inject the JWT secret into request extensions so the Claims extractor can find it.
async fn inject_jwt_secret(
    axum::extract::State(state): axum::extract::State<AppState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> axum::response::Response {
    req.extensions_mut()
        .insert(JwtSecret(state.jwt_secret.clone()));
    next.run(req).await
}

/// Build the full axum Router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    // Rate limiting on the presence REST surface: heartbeats arrive on
    // a fixed client interval, so 30/min/IP with burst headroom.
    // PeerIpKeyExtractor reads from ConnectInfo<SocketAddr>.
    let governor_config = Arc::new(
        GovernorConfigBuilder::default()
            .key_extractor(PeerIpKeyExtractor)
            .per_second(2)
            .burst_size(10)
            .finish()
            .expect("Failed to build governor config"),
    );
    let governor_limiter = governor_config.limiter().clone();

    // Spawn background task to clean up rate limiter state
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            governor_limiter.retain_recent();
        }
    });

    let presence_routes = Router::new()
        .route("/api/presence", axum::routing::get(list_online))
        .route(
            "/api/presence/heartbeat",
            axum::routing::post(heartbeat),
        )
        .layer(GovernorLayer {
            config: governor_config,
        });

    // Upgrade endpoints get their own limiter: reconnect storms from a
    // single IP should back off before they reach the token checks.
    let ws_governor_config = Arc::new(
        GovernorConfigBuilder::default()
            .key_extractor(PeerIpKeyExtractor)
            .per_second(1)
            .burst_size(20)
            .finish()
            .expect("Failed to build ws governor config"),
    );
    let ws_limiter = ws_governor_config.limiter().clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            ws_limiter.retain_recent();
        }
    });

    // WebSocket endpoints (auth via query param, not JWT header)
    let ws_routes = Router::new()
        .route("/ws/chat", axum::routing::get(ws_handler::chat_upgrade))
        .route(
            "/ws/signaling",
            axum::routing::get(ws_handler::signaling_upgrade),
        )
        .route("/ws/poll", axum::routing::get(ws_handler::poll_upgrade))
        .layer(GovernorLayer {
            config: ws_governor_config,
        });

    let health = Router::new().route("/health", axum::routing::get(health_check));

    Router::new()
        .merge(presence_routes)
        .merge(ws_routes)
        .merge(health)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            inject_jwt_secret,
        ))
        .with_state(state)
}

/// GET /api/presence — snapshot of currently-online users.
async fn list_online(
    _claims: Claims,
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Json<serde_json::Value> {
    let online = state.presence.list_online().await;
    Json(serde_json::json!({ "online": online }))
}

/// POST /api/presence/heartbeat — refresh the caller's presence TTL.
async fn heartbeat(
    claims: Claims,
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Json<serde_json::Value> {
    state.presence.refresh(claims.sub).await;
    Json(serde_json::json!({ "ok": true }))
}

/// GET /health — liveness plus shared-backend status.
async fn health_check(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "degraded": state.redis.is_degraded(),
        "node_id": state.node_id,
    }))
}
