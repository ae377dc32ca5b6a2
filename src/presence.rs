//! TTL-backed online presence, independent of any topic.
//!
//! Each online user holds a `presence:{user_id}` marker with a short
//! TTL, refreshed by heartbeats, plus membership in a `presence:online`
//! set for O(1) listing. Markers expiring on their own is the normal
//! path for crashed or partitioned clients, so listing prunes set
//! members whose marker is gone. Degraded-mode operations hit a
//! process-local cache with the same shape.

use std::time::Duration;

use tracing::warn;
use uuid::Uuid;

use crate::session::MemoryCache;
use crate::store::SharedRedis;

const MARKER_PREFIX: &str = "presence:";
const ONLINE_SET: &str = "presence:online";

pub const DEFAULT_PRESENCE_TTL: Duration = Duration::from_secs(5 * 60);

pub struct PresenceTracker {
    redis: SharedRedis,
    fallback: MemoryCache,
    ttl: Duration,
}

impl PresenceTracker {
    pub fn new(redis: SharedRedis, ttl: Duration) -> Self {
        Self {
            redis,
            fallback: MemoryCache::new(ttl, 50_000),
            ttl,
        }
    }

    fn marker_key(user_id: Uuid) -> String {
        format!("{MARKER_PREFIX}{user_id}")
    }

    pub async fn set_online(&self, user_id: Uuid) {
        let key = Self::marker_key(user_id);
        if !self.redis.is_degraded() {
            match self.redis.set_ex(&key, "1", self.ttl).await {
                Ok(()) => {
                    if let Err(err) = self.redis.sadd(ONLINE_SET, &user_id.to_string()).await {
                        warn!(error = %err, %user_id, "online set update failed");
                    }
                    return;
                }
                Err(err) => warn!(error = %err, %user_id, "presence write failed, using fallback"),
            }
        }
        self.fallback.set(&key, "1", Some(self.ttl));
        self.fallback.sadd(ONLINE_SET, &user_id.to_string());
    }

    pub async fn set_offline(&self, user_id: Uuid) {
        let key = Self::marker_key(user_id);
        if !self.redis.is_degraded() {
            if let Err(err) = self.redis.del(&key).await {
                warn!(error = %err, %user_id, "presence delete failed, using fallback");
            } else {
                if let Err(err) = self.redis.srem(ONLINE_SET, &user_id.to_string()).await {
                    warn!(error = %err, %user_id, "online set update failed");
                }
                return;
            }
        }
        self.fallback.del(&key);
        self.fallback.srem(ONLINE_SET, &user_id.to_string());
    }

    /// Heartbeat: slide the marker's TTL without touching membership.
    /// A heartbeat for a user with no marker re-creates it.
    pub async fn refresh(&self, user_id: Uuid) {
        let key = Self::marker_key(user_id);
        if !self.redis.is_degraded() {
            match self.redis.expire(&key, self.ttl).await {
                Ok(true) => return,
                Ok(false) => {
                    self.set_online(user_id).await;
                    return;
                }
                Err(err) => warn!(error = %err, %user_id, "presence refresh failed, using fallback"),
            }
        }
        if !self.fallback.expire(&key, self.ttl) {
            self.fallback.set(&key, "1", Some(self.ttl));
            self.fallback.sadd(ONLINE_SET, &user_id.to_string());
        }
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        let key = Self::marker_key(user_id);
        if !self.redis.is_degraded() {
            match self.redis.exists(&key).await {
                Ok(found) => return found,
                Err(err) => warn!(error = %err, %user_id, "presence read failed, using fallback"),
            }
        }
        self.fallback.exists(&key)
    }

    /// Snapshot of online users. Members whose marker already expired
    /// are pruned from the set as a side effect.
    pub async fn list_online(&self) -> Vec<Uuid> {
        if !self.redis.is_degraded() {
            match self.redis.smembers(ONLINE_SET).await {
                Ok(members) => return self.prune_shared(members).await,
                Err(err) => warn!(error = %err, "online set read failed, using fallback"),
            }
        }
        let mut online = Vec::new();
        for member in self.fallback.smembers(ONLINE_SET) {
            let Ok(user_id) = member.parse::<Uuid>() else {
                self.fallback.srem(ONLINE_SET, &member);
                continue;
            };
            if self.fallback.exists(&Self::marker_key(user_id)) {
                online.push(user_id);
            } else {
                self.fallback.srem(ONLINE_SET, &member);
            }
        }
        online
    }

    async fn prune_shared(&self, members: Vec<String>) -> Vec<Uuid> {
        let mut online = Vec::new();
        for member in members {
            let Ok(user_id) = member.parse::<Uuid>() else {
                let _ = self.redis.srem(ONLINE_SET, &member).await;
                continue;
            };
            match self.redis.exists(&Self::marker_key(user_id)).await {
                Ok(true) => online.push(user_id),
                Ok(false) => {
                    let _ = self.redis.srem(ONLINE_SET, &member).await;
                }
                Err(err) => {
                    warn!(error = %err, %user_id, "presence marker check failed");
                }
            }
        }
        online
    }
}
