//! Auth session state: session records, token blacklist, and the
//! account lockout ledger.
//!
//! Everything lives in the shared Redis backend under a fixed key
//! schema. When the backend is degraded every operation transparently
//! serves the same contract from a process-local [`MemoryCache`], and a
//! background task writes the fallback state back once the backend
//! recovers. Callers never see an availability error from this module.

mod memory;

pub use memory::MemoryCache;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::SharedRedis;

const SESSION_PREFIX: &str = "session:";
const USER_SESSIONS_PREFIX: &str = "user:sessions:";
const BLACKLIST_PREFIX: &str = "blacklist:";
const LOCK_PREFIX: &str = "lockout:user:";
const FAILED_PREFIX: &str = "lockout:failed:";

pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const MAX_FAILED_ATTEMPTS: i64 = 5;
pub const LOCK_DURATION: Duration = Duration::from_secs(15 * 60);
pub const ATTEMPT_WINDOW: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session record encode/decode failed: {0}")]
    Codec(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub id: String,
    pub user_id: Uuid,
    pub access_token: String,
    pub refresh_token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Canonical on-disk form of an account lock.
#[derive(Debug, Serialize, Deserialize)]
struct LockRecord {
    locked_until: DateTime<Utc>,
}

fn parse_lock(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(record) = serde_json::from_str::<LockRecord>(raw) {
        return Some(record.locked_until);
    }
    // Older deployments stored a bare unix timestamp.
    raw.trim()
        .parse::<i64>()
        .ok()
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}

pub struct SessionStore {
    redis: SharedRedis,
    fallback: MemoryCache,
    session_ttl: Duration,
}

impl SessionStore {
    pub fn new(redis: SharedRedis) -> Self {
        Self::with_ttl(redis, DEFAULT_SESSION_TTL)
    }

    pub fn with_ttl(redis: SharedRedis, session_ttl: Duration) -> Self {
        Self {
            redis,
            fallback: MemoryCache::new(session_ttl, 10_000),
            session_ttl,
        }
    }

    fn session_key(id: &str) -> String {
        format!("{SESSION_PREFIX}{id}")
    }

    fn user_key(user_id: Uuid) -> String {
        format!("{USER_SESSIONS_PREFIX}{user_id}")
    }

    fn blacklist_key(jti: &str) -> String {
        format!("{BLACKLIST_PREFIX}{jti}")
    }

    fn lock_key(key: &str) -> String {
        format!("{LOCK_PREFIX}{key}")
    }

    fn failed_key(key: &str) -> String {
        format!("{FAILED_PREFIX}{key}")
    }

    pub async fn create_session(&self, session: &Session) -> Result<(), SessionError> {
        let key = Self::session_key(&session.id);
        let user_key = Self::user_key(session.user_id);
        let payload = serde_json::to_string(session)?;
        if !self.redis.is_degraded() {
            match self.redis.set_ex(&key, &payload, self.session_ttl).await {
                Ok(()) => {
                    if let Err(err) = self.redis.sadd(&user_key, &session.id).await {
                        warn!(error = %err, "session index update failed");
                    }
                    return Ok(());
                }
                Err(err) => warn!(error = %err, "session write failed, using fallback"),
            }
        }
        self.fallback.set(&key, &payload, Some(self.session_ttl));
        self.fallback.sadd(&user_key, &session.id);
        Ok(())
    }

    pub async fn get_session(&self, id: &str) -> Result<Option<Session>, SessionError> {
        let key = Self::session_key(id);
        if !self.redis.is_degraded() {
            match self.redis.get(&key).await {
                Ok(Some(raw)) => return Ok(Some(serde_json::from_str(&raw)?)),
                Ok(None) => return Ok(None),
                Err(err) => warn!(error = %err, "session read failed, using fallback"),
            }
        }
        match self.fallback.get(&key) {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn delete_session(&self, id: &str) -> Result<(), SessionError> {
        let key = Self::session_key(id);
        let user_key = match self.get_session(id).await? {
            Some(session) => Some(Self::user_key(session.user_id)),
            None => None,
        };
        if !self.redis.is_degraded() {
            if let Err(err) = self.redis.del(&key).await {
                warn!(error = %err, "session delete failed, using fallback");
            } else {
                if let Some(user_key) = &user_key {
                    if let Err(err) = self.redis.srem(user_key, id).await {
                        warn!(error = %err, "session index update failed");
                    }
                }
                return Ok(());
            }
        }
        self.fallback.del(&key);
        if let Some(user_key) = &user_key {
            self.fallback.srem(user_key, id);
        }
        Ok(())
    }

    pub async fn delete_all_user_sessions(&self, user_id: Uuid) -> Result<(), SessionError> {
        let user_key = Self::user_key(user_id);
        if !self.redis.is_degraded() {
            match self.redis.smembers(&user_key).await {
                Ok(ids) => {
                    for id in &ids {
                        if let Err(err) = self.redis.del(&Self::session_key(id)).await {
                            warn!(error = %err, session_id = %id, "session delete failed");
                        }
                    }
                    if let Err(err) = self.redis.del(&user_key).await {
                        warn!(error = %err, "session index delete failed");
                    }
                    return Ok(());
                }
                Err(err) => warn!(error = %err, "session index read failed, using fallback"),
            }
        }
        for id in self.fallback.smembers(&user_key) {
            self.fallback.del(&Self::session_key(&id));
        }
        self.fallback.del(&user_key);
        Ok(())
    }

    /// Slide the session's expiry window without rewriting the record.
    pub async fn refresh_ttl(&self, id: &str) -> Result<bool, SessionError> {
        let key = Self::session_key(id);
        if !self.redis.is_degraded() {
            match self.redis.expire(&key, self.session_ttl).await {
                Ok(extended) => return Ok(extended),
                Err(err) => warn!(error = %err, "session ttl refresh failed, using fallback"),
            }
        }
        Ok(self.fallback.expire(&key, self.session_ttl))
    }

    /// Revoke a token id for as long as the token itself would remain
    /// valid. The entry self-expires with the token.
    pub async fn blacklist_token(&self, jti: &str, ttl: Duration) {
        let key = Self::blacklist_key(jti);
        if !self.redis.is_degraded() {
            match self.redis.set_ex(&key, "1", ttl).await {
                Ok(_) => return,
                Err(err) => warn!(error = %err, "blacklist write failed, using fallback"),
            }
        }
        self.fallback.set(&key, "1", Some(ttl));
    }

    pub async fn is_blacklisted(&self, jti: &str) -> bool {
        let key = Self::blacklist_key(jti);
        if !self.redis.is_degraded() {
            match self.redis.exists(&key).await {
                Ok(found) => return found,
                Err(err) => warn!(error = %err, "blacklist read failed, using fallback"),
            }
        }
        self.fallback.exists(&key)
    }

    /// Bump the failed-attempt counter for an identifier (user id or
    /// client IP) and return the count within the current window.
    pub async fn record_failed_attempt(&self, ident: &str) -> i64 {
        let key = Self::failed_key(ident);
        if !self.redis.is_degraded() {
            match self.redis.incr(&key).await {
                Ok(count) => {
                    if count == 1 {
                        if let Err(err) = self.redis.expire(&key, ATTEMPT_WINDOW).await {
                            warn!(error = %err, "failed-attempt window set failed");
                        }
                    }
                    return count;
                }
                Err(err) => warn!(error = %err, "failed-attempt write failed, using fallback"),
            }
        }
        self.fallback.incr(&key, ATTEMPT_WINDOW)
    }

    pub async fn get_failed_attempts(&self, ident: &str) -> i64 {
        let key = Self::failed_key(ident);
        if !self.redis.is_degraded() {
            match self.redis.get(&key).await {
                Ok(raw) => {
                    return raw.and_then(|s| s.parse().ok()).unwrap_or(0);
                }
                Err(err) => warn!(error = %err, "failed-attempt read failed, using fallback"),
            }
        }
        self.fallback
            .get(&key)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }

    pub async fn clear_failed_attempts(&self, ident: &str) {
        let key = Self::failed_key(ident);
        if !self.redis.is_degraded() {
            if let Err(err) = self.redis.del(&key).await {
                warn!(error = %err, "failed-attempt clear failed, using fallback");
            } else {
                return;
            }
        }
        self.fallback.del(&key);
    }

    pub async fn lock_account(&self, ident: &str, until: DateTime<Utc>) -> Result<(), SessionError> {
        let key = Self::lock_key(ident);
        let ttl = (until - Utc::now())
            .to_std()
            .unwrap_or(Duration::from_secs(1));
        let payload = serde_json::to_string(&LockRecord { locked_until: until })?;
        if !self.redis.is_degraded() {
            match self.redis.set_ex(&key, &payload, ttl).await {
                Ok(_) => return Ok(()),
                Err(err) => warn!(error = %err, "account lock write failed, using fallback"),
            }
        }
        self.fallback.set(&key, &payload, Some(ttl));
        Ok(())
    }

    /// Active lock expiry for an identifier, if any. Expired locks read
    /// as absent even before the store reaps them.
    pub async fn get_account_lock(&self, ident: &str) -> Option<DateTime<Utc>> {
        let key = Self::lock_key(ident);
        let raw = if !self.redis.is_degraded() {
            match self.redis.get(&key).await {
                Ok(raw) => raw,
                Err(err) => {
                    warn!(error = %err, "account lock read failed, using fallback");
                    self.fallback.get(&key)
                }
            }
        } else {
            self.fallback.get(&key)
        };
        raw.as_deref()
            .and_then(parse_lock)
            .filter(|until| *until > Utc::now())
    }

    pub async fn unlock_account(&self, ident: &str) {
        let key = Self::lock_key(ident);
        if !self.redis.is_degraded() {
            if let Err(err) = self.redis.del(&key).await {
                warn!(error = %err, "account unlock failed, using fallback");
            } else {
                self.fallback.del(&key);
                return;
            }
        }
        self.fallback.del(&key);
    }

    /// Record a failure and lock the account when the threshold is hit.
    /// Returns the active lock expiry if the account is now locked.
    pub async fn note_auth_failure(&self, ident: &str) -> Result<Option<DateTime<Utc>>, SessionError> {
        let attempts = self.record_failed_attempt(ident).await;
        if attempts >= MAX_FAILED_ATTEMPTS {
            let until = Utc::now()
                + chrono::Duration::from_std(LOCK_DURATION).unwrap_or(chrono::Duration::minutes(15));
            self.lock_account(ident, until).await?;
            info!(ident, attempts, %until, "account locked after repeated auth failures");
            return Ok(Some(until));
        }
        Ok(None)
    }

    pub async fn note_auth_success(&self, ident: &str) {
        self.clear_failed_attempts(ident).await;
    }

    /// Watch backend availability and write fallback state through when
    /// it comes back. Runs for the life of the process.
    pub fn spawn_reconcile(self: &Arc<Self>) {
        let store = Arc::clone(self);
        let mut availability = store.redis.availability();
        tokio::spawn(async move {
            let mut was_available = *availability.borrow();
            while availability.changed().await.is_ok() {
                let available = *availability.borrow();
                if available && !was_available {
                    store.reconcile().await;
                }
                was_available = available;
            }
        });
    }

    /// Push sessions, blacklist entries, and lock records collected
    /// while degraded into the recovered backend, then drop them from
    /// the fallback. The shared copy wins on key collision.
    pub async fn reconcile(&self) {
        let mut moved = 0usize;
        for prefix in [SESSION_PREFIX, BLACKLIST_PREFIX, LOCK_PREFIX, FAILED_PREFIX] {
            for (key, value, ttl) in self.fallback.dump_prefix(prefix) {
                if let Ok(true) = self.redis.exists(&key).await {
                    self.fallback.del(&key);
                    continue;
                }
                let remaining = ttl.unwrap_or(self.session_ttl);
                match self.redis.set_ex(&key, &value, remaining).await {
                    Ok(_) => {
                        if key.starts_with(SESSION_PREFIX) {
                            if let Ok(session) = serde_json::from_str::<Session>(&value) {
                                let _ = self
                                    .redis
                                    .sadd(&Self::user_key(session.user_id), &session.id)
                                    .await;
                            }
                        }
                        self.fallback.del(&key);
                        moved += 1;
                    }
                    Err(err) => {
                        warn!(error = %err, key, "reconcile write failed, keeping fallback entry");
                        return;
                    }
                }
            }
        }
        if moved > 0 {
            info!(entries = moved, "reconciled fallback session state into shared store");
        } else {
            debug!("no fallback session state to reconcile");
        }
    }

}
