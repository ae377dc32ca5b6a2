use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Reasons an upgrade request is rejected before any socket upgrade
/// takes place. Once a connection is upgraded, failures are no longer
/// surfaced to the client except as dropped frames or a close.
#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    #[error("origin header missing or not allowed")]
    OriginNotAllowed,

    #[error("server at capacity, please try again later")]
    Capacity,

    #[error("token expired")]
    TokenExpired,

    #[error("token invalid")]
    TokenInvalid,

    #[error("token has been revoked")]
    TokenRevoked,

    #[error("account is locked until {until}")]
    AccountLocked { until: chrono::DateTime<chrono::Utc> },

    #[error("not a participant in this topic")]
    NotParticipant,

    #[error("failed to verify topic membership")]
    MembershipCheck,
}

impl UpgradeError {
    fn status(&self) -> StatusCode {
        match self {
            Self::OriginNotAllowed | Self::NotParticipant => StatusCode::FORBIDDEN,
            Self::Capacity => StatusCode::SERVICE_UNAVAILABLE,
            Self::TokenExpired | Self::TokenInvalid | Self::TokenRevoked => {
                StatusCode::UNAUTHORIZED
            }
            Self::AccountLocked { .. } => StatusCode::LOCKED,
            Self::MembershipCheck => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for UpgradeError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
