use std::sync::Arc;

use uuid::Uuid;

use crate::config::Config;
use crate::hub::bus::{Bus, RedisBus};
use crate::hub::{event, spawn_hub, Announce, DeliveryMode, HubConfig, HubHandle};
use crate::membership::{SetMembership, TopicMembership};
use crate::presence::PresenceTracker;
use crate::session::SessionStore;
use crate::store::SharedRedis;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub redis: SharedRedis,
    pub sessions: Arc<SessionStore>,
    pub presence: Arc<PresenceTracker>,
    pub membership: Arc<dyn TopicMembership>,
    pub chat: HubHandle,
    pub signaling: HubHandle,
    pub poll: HubHandle,
    pub jwt_secret: Vec<u8>,
    /// This replica's identity on the cross-replica bus.
    pub node_id: Uuid,
}

impl AppState {
    /// Wire up the three hubs over the Redis bus, plus session and
    /// presence state against the same backend.
    pub fn new(config: Arc<Config>, redis: SharedRedis) -> Self {
        let bus: Arc<dyn Bus> = Arc::new(RedisBus::new(redis.clone()));
        Self::with_bus(config, redis, bus)
    }

    /// Same wiring with a caller-supplied bus. Tests and single-replica
    /// deployments use `LocalBus` here.
    pub fn with_bus(config: Arc<Config>, redis: SharedRedis, bus: Arc<dyn Bus>) -> Self {
        let node_id = Uuid::new_v4();

        let chat = spawn_hub(
            HubConfig {
                name: "chat",
                mode: DeliveryMode::ExcludeSender,
                max_connections: config.hubs.max_chat_connections,
                queue_depth: config.hubs.queue_depth,
                announce: Some(Announce {
                    joined: event::USER_JOINED,
                    left: event::USER_LEFT,
                }),
                client_kinds: event::CHAT_CLIENT_KINDS,
            },
            bus.clone(),
            node_id,
        );
        let signaling = spawn_hub(
            HubConfig {
                name: "signaling",
                mode: DeliveryMode::ExcludeSender,
                max_connections: config.hubs.max_signaling_connections,
                queue_depth: config.hubs.queue_depth,
                announce: Some(Announce {
                    joined: event::JOIN,
                    left: event::LEAVE,
                }),
                client_kinds: event::SIGNALING_CLIENT_KINDS,
            },
            bus.clone(),
            node_id,
        );
        let poll = spawn_hub(
            HubConfig {
                name: "poll",
                mode: DeliveryMode::Everyone,
                max_connections: config.hubs.max_poll_connections,
                queue_depth: config.hubs.queue_depth,
                announce: None,
                client_kinds: event::POLL_CLIENT_KINDS,
            },
            bus,
            node_id,
        );

        let sessions = Arc::new(SessionStore::new(redis.clone()));
        sessions.spawn_reconcile();

        let presence = Arc::new(PresenceTracker::new(
            redis.clone(),
            std::time::Duration::from_secs(config.presence_ttl_secs),
        ));

        let jwt_secret = config.jwt_secret.as_bytes().to_vec();

        Self {
            config,
            membership: Arc::new(SetMembership::new(redis.clone())),
            redis,
            sessions,
            presence,
            chat,
            signaling,
            poll,
            jwt_secret,
            node_id,
        }
    }
}
