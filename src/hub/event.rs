//! Wire frame shared by every hub.
//!
//! One flat JSON object in both directions: `type`, `topic_id`,
//! `sender_id`, optional `target_id`, a kind-specific payload field,
//! and `timestamp`. Malformed frames from clients are dropped with a
//! warning, never fatal to the connection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Chat events
pub const CHAT: &str = "chat";
pub const TYPING: &str = "typing";
pub const READ: &str = "read";
pub const USER_JOINED: &str = "user_joined";
pub const USER_LEFT: &str = "user_left";

// Call signaling events
pub const OFFER: &str = "offer";
pub const ANSWER: &str = "answer";
pub const ICE_CANDIDATE: &str = "ice_candidate";
pub const JOIN: &str = "join";
pub const LEAVE: &str = "leave";
pub const MUTE_AUDIO: &str = "mute_audio";
pub const MUTE_VIDEO: &str = "mute_video";

// Poll events
pub const POLL_CREATED: &str = "poll_created";
pub const POLL_VOTED: &str = "poll_voted";
pub const POLL_CLOSED: &str = "poll_closed";

// Kinds clients may publish, per hub. Announce kinds are stamped
// server-side and are not accepted from the wire.
pub const CHAT_CLIENT_KINDS: &[&str] = &[CHAT, TYPING, READ];
pub const SIGNALING_CLIENT_KINDS: &[&str] =
    &[OFFER, ANSWER, ICE_CANDIDATE, MUTE_AUDIO, MUTE_VIDEO];
pub const POLL_CLIENT_KINDS: &[&str] = &[POLL_CREATED, POLL_VOTED, POLL_CLOSED];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: String,

    /// Stamped server-side; clients need not echo it.
    #[serde(default = "Uuid::nil")]
    pub topic_id: Uuid,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<Uuid>,

    /// When set, delivery is restricted to connections of this user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_id: Option<Uuid>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub muted: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: &str, topic_id: Uuid) -> Self {
        Self {
            kind: kind.to_string(),
            topic_id,
            sender_id: None,
            target_id: None,
            content: None,
            sdp: None,
            candidate: None,
            muted: None,
            data: None,
            timestamp: Utc::now(),
        }
    }

    pub fn from_sender(kind: &str, topic_id: Uuid, sender_id: Uuid) -> Self {
        Self {
            sender_id: Some(sender_id),
            ..Self::new(kind, topic_id)
        }
    }

    /// Parse an inbound client frame, stamping the authenticated sender
    /// and topic over whatever the client claimed.
    pub fn from_client(raw: &str, topic_id: Uuid, sender_id: Uuid) -> Result<Self, serde_json::Error> {
        let mut event: Event = serde_json::from_str(raw)?;
        event.topic_id = topic_id;
        event.sender_id = Some(sender_id);
        event.timestamp = Utc::now();
        Ok(event)
    }
}

/// Envelope published on the cross-replica bus. `origin` lets each
/// replica drop its own frames on receipt so connections registered
/// locally see an event exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusFrame {
    pub origin: Uuid,
    pub event: Event,
}
