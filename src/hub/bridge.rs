//! Per-hub bridge between local fanout and the cross-replica bus.
//!
//! The bridge keeps one bus subscription per topic, refcounted by the
//! connections registered under it. `acquire` resolves only once the
//! subscription is confirmed, so it is awaited before a connection is
//! admitted; dropping the returned guard releases the reference and the
//! subscription is torn down when the last one goes.
//!
//! Frames received from the bus carry their origin replica id; frames
//! this replica published itself are dropped on receipt, leaving local
//! fanout as their only delivery path.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::bus::{Bus, BusError};
use super::event::{BusFrame, Event};

struct TopicSub {
    refs: usize,
    cancel: CancellationToken,
}

pub struct PubSubBridge {
    bus: Arc<dyn Bus>,
    /// This replica's identity, stamped on every published frame.
    node_id: Uuid,
    /// Channel namespace, one per hub (`hub:chat`, `hub:signaling`, ...).
    prefix: String,
    deliver_tx: mpsc::Sender<Event>,
    topics: Mutex<HashMap<Uuid, TopicSub>>,
    release_tx: mpsc::UnboundedSender<Uuid>,
}

impl PubSubBridge {
    pub fn new(
        bus: Arc<dyn Bus>,
        node_id: Uuid,
        prefix: &str,
        deliver_tx: mpsc::Sender<Event>,
    ) -> Arc<Self> {
        let (release_tx, release_rx) = mpsc::unbounded_channel();
        let bridge = Arc::new(Self {
            bus,
            node_id,
            prefix: prefix.to_string(),
            deliver_tx,
            topics: Mutex::new(HashMap::new()),
            release_tx,
        });
        tokio::spawn(Self::release_loop(Arc::downgrade(&bridge), release_rx));
        bridge
    }

    fn channel(&self, topic: Uuid) -> String {
        format!("{}:{}", self.prefix, topic)
    }

    /// Take a reference on `topic`'s bus subscription, opening it if
    /// this is the first. Resolves only once the subscription is live.
    pub async fn acquire(&self, topic: Uuid) -> Result<TopicGuard, BusError> {
        let mut topics = self.topics.lock().await;
        if let Some(sub) = topics.get_mut(&topic) {
            sub.refs += 1;
            return Ok(TopicGuard {
                topic,
                release: self.release_tx.clone(),
            });
        }

        let cancel = CancellationToken::new();
        let mut rx = self.bus.subscribe(&self.channel(topic), cancel.clone()).await?;

        let node_id = self.node_id;
        let deliver_tx = self.deliver_tx.clone();
        tokio::spawn(async move {
            while let Some(payload) = rx.recv().await {
                let frame: BusFrame = match serde_json::from_str(&payload) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(error = %err, %topic, "malformed bus frame dropped");
                        continue;
                    }
                };
                if frame.origin == node_id {
                    continue;
                }
                if deliver_tx.send(frame.event).await.is_err() {
                    break;
                }
            }
        });

        topics.insert(topic, TopicSub { refs: 1, cancel });
        debug!(%topic, "bridge subscription opened");
        Ok(TopicGuard {
            topic,
            release: self.release_tx.clone(),
        })
    }

    /// Publish an event for other replicas serving this topic.
    pub async fn publish(&self, event: &Event) -> Result<(), BusError> {
        let frame = BusFrame {
            origin: self.node_id,
            event: event.clone(),
        };
        let payload = serde_json::to_string(&frame)?;
        self.bus.publish(&self.channel(event.topic_id), &payload).await
    }

    pub async fn has_subscription(&self, topic: Uuid) -> bool {
        self.topics.lock().await.contains_key(&topic)
    }

    async fn release_loop(bridge: Weak<Self>, mut release_rx: mpsc::UnboundedReceiver<Uuid>) {
        while let Some(topic) = release_rx.recv().await {
            let Some(bridge) = bridge.upgrade() else { break };
            let mut topics = bridge.topics.lock().await;
            match topics.get_mut(&topic) {
                Some(sub) if sub.refs > 1 => sub.refs -= 1,
                Some(_) => {
                    let sub = topics.remove(&topic).unwrap();
                    sub.cancel.cancel();
                    debug!(%topic, "bridge subscription closed");
                }
                None => {}
            }
        }
    }
}

/// One connection's hold on a topic subscription. Dropping it releases
/// the reference.
#[derive(Debug)]
pub struct TopicGuard {
    topic: Uuid,
    release: mpsc::UnboundedSender<Uuid>,
}

impl Drop for TopicGuard {
    fn drop(&mut self) {
        let _ = self.release.send(self.topic);
    }
}
