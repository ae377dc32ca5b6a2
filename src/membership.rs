//! Topic membership checks performed before a socket upgrade.
//!
//! Conversation and call membership is owned by an external service;
//! this trait is the seam through which upgrades consult it.

use async_trait::async_trait;
use tracing::warn;
use uuid::Uuid;

use crate::error::UpgradeError;
use crate::store::SharedRedis;

#[async_trait]
pub trait TopicMembership: Send + Sync {
    async fn is_participant(&self, user_id: Uuid, topic: Uuid) -> Result<bool, UpgradeError>;
}

/// Admits every caller. Used for hubs without a membership requirement
/// and in tests.
pub struct AllowAll;

#[async_trait]
impl TopicMembership for AllowAll {
    async fn is_participant(&self, _user_id: Uuid, _topic: Uuid) -> Result<bool, UpgradeError> {
        Ok(true)
    }
}

/// Membership mirrored into Redis by the conversation service as a
/// `topic:members:{topic_id}` set. While the backend is degraded the
/// check admits the caller with a warning rather than locking everyone
/// out of their conversations.
pub struct SetMembership {
    redis: SharedRedis,
}

impl SetMembership {
    pub fn new(redis: SharedRedis) -> Self {
        Self { redis }
    }

    fn key(topic: Uuid) -> String {
        format!("topic:members:{topic}")
    }
}

#[async_trait]
impl TopicMembership for SetMembership {
    async fn is_participant(&self, user_id: Uuid, topic: Uuid) -> Result<bool, UpgradeError> {
        if self.redis.is_degraded() {
            warn!(%user_id, %topic, "membership backend degraded, admitting without check");
            return Ok(true);
        }
        self.redis
            .sismember(&Self::key(topic), &user_id.to_string())
            .await
            .map_err(|err| {
                warn!(error = %err, %user_id, %topic, "membership check failed");
                UpgradeError::MembershipCheck
            })
    }
}
