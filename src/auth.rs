//! JWT validation for socket upgrades and REST endpoints.

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::UpgradeError;
use crate::session::SessionStore;

/// JWT claims carried by access tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User ID
    pub sub: Uuid,
    /// Token ID, keyed by the revocation blacklist
    pub jti: String,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration (Unix timestamp)
    pub exp: i64,
}

impl Claims {
    /// Seconds until expiry, clamped at zero.
    pub fn remaining_secs(&self) -> u64 {
        (self.exp - Utc::now().timestamp()).max(0) as u64
    }
}

/// Issue an access token (15-minute expiry).
pub fn issue_access_token(
    secret: &[u8],
    user_id: Uuid,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = Utc::now().timestamp();
    let claims = Claims {
        sub: user_id,
        jti: Uuid::new_v4().to_string(),
        iat: now,
        exp: now + 900,
    };

    encode(
        &Header::default(), // HS256
        &claims,
        &EncodingKey::from_secret(secret),
    )
}

/// Validate signature and expiry. Does not consult the blacklist.
pub fn validate_access_token(secret: &[u8], token: &str) -> Result<Claims, UpgradeError> {
    let validation = Validation::new(jsonwebtoken::Algorithm::HS256);
    decode::<Claims>(token, &DecodingKey::from_secret(secret), &validation)
        .map(|data| data.claims)
        .map_err(|err| match err.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => UpgradeError::TokenExpired,
            _ => UpgradeError::TokenInvalid,
        })
}

/// Full check used before a socket upgrade: signature, expiry,
/// revocation, and account lock state. Blacklist/lock lookups go
/// through the session store and so keep working while degraded.
pub async fn authenticate(
    secret: &[u8],
    token: &str,
    sessions: &SessionStore,
) -> Result<Claims, UpgradeError> {
    let claims = validate_access_token(secret, token)?;
    if sessions.is_blacklisted(&claims.jti).await {
        return Err(UpgradeError::TokenRevoked);
    }
    if let Some(until) = sessions.get_account_lock(&claims.sub.to_string()).await {
        return Err(UpgradeError::AccountLocked { until });
    }
    Ok(claims)
}

impl<S> FromRequestParts<S> for Claims
where
    S: Send + Sync,
{
    type Rejection = StatusCode;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let auth_header = parts
            .headers
            .get("Authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or(StatusCode::UNAUTHORIZED)?;

        let token = auth_header
            .strip_prefix("Bearer ")
            .ok_or(StatusCode::UNAUTHORIZED)?;

        // Set by the inject middleware layer in routes.
        let jwt_secret = parts
            .extensions
            .get::<JwtSecret>()
            .ok_or(StatusCode::INTERNAL_SERVER_ERROR)?;

        validate_access_token(&jwt_secret.0, token).map_err(|_| StatusCode::UNAUTHORIZED)
    }
}

/// JWT secret stored in request extensions for the Claims extractor
#[derive(Clone)]
pub struct JwtSecret(pub Vec<u8>);
