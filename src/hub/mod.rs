//! Topic-scoped fanout hubs.
//!
//! One generic hub, instantiated per event family (chat, signaling,
//! poll). Each hub runs a single control loop that owns the
//! topic-to-connections registry outright; registration, unregistration
//! and fanout are serialized through its command channel, so the
//! registry needs no lock. The loop never performs I/O: bus publishes
//! are handed to a separate publisher task, and bus receipts arrive on
//! a channel the bridge feeds.
//!
//! Topics exist only while occupied: the first registration creates the
//! entry (and opens the bridge subscription), removal of the last
//! connection deletes it.

pub mod bridge;
pub mod bus;
pub mod event;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::UpgradeError;
use bridge::{PubSubBridge, TopicGuard};
use bus::Bus;
use event::Event;

/// Whether local fanout skips the publishing connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// The sending connection does not receive its own event (chat,
    /// signaling; senders render optimistically).
    ExcludeSender,
    /// Every connection on the topic receives the event (poll; the
    /// voter's own tally update comes through the hub like everyone
    /// else's).
    Everyone,
}

/// Per-hub tuning fixed at startup.
pub struct HubConfig {
    pub name: &'static str,
    pub mode: DeliveryMode,
    /// Global connection cap; `None` is unlimited.
    pub max_connections: Option<usize>,
    /// Outbound queue depth per connection; a full queue evicts.
    pub queue_depth: usize,
    /// Event kinds announced on register/unregister, if any.
    pub announce: Option<Announce>,
    /// Kinds clients may publish; anything else is a protocol error.
    pub client_kinds: &'static [&'static str],
}

#[derive(Debug, Clone, Copy)]
pub struct Announce {
    pub joined: &'static str,
    pub left: &'static str,
}

struct Member {
    user_id: Uuid,
    tx: mpsc::Sender<String>,
}

enum Command {
    Register {
        topic: Uuid,
        conn_id: u64,
        user_id: Uuid,
        tx: mpsc::Sender<String>,
    },
    Unregister {
        topic: Uuid,
        conn_id: u64,
    },
    Publish {
        event: Event,
        sender_conn: Option<u64>,
    },
}

/// A registered connection's half of the hub contract. The actor owns
/// it for the socket's lifetime; the guard and permit release on drop.
pub struct Registration {
    pub conn_id: u64,
    outbound: Option<mpsc::Receiver<String>>,
    _guard: Option<TopicGuard>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Registration {
    /// Hand the outbound queue to whoever writes the socket. Panics if
    /// taken twice.
    pub fn take_outbound(&mut self) -> mpsc::Receiver<String> {
        self.outbound.take().expect("outbound already taken")
    }
}

#[derive(Clone)]
pub struct HubHandle {
    name: &'static str,
    cmd_tx: mpsc::Sender<Command>,
    bridge: Arc<PubSubBridge>,
    semaphore: Option<Arc<Semaphore>>,
    next_id: Arc<AtomicU64>,
    queue_depth: usize,
    client_kinds: &'static [&'static str],
}

impl HubHandle {
    /// Whether clients may publish this event kind on the hub.
    pub fn accepts_kind(&self, kind: &str) -> bool {
        self.client_kinds.contains(&kind)
    }

    /// Reserve a connection slot, or reject when the cap is reached.
    /// Called before the socket upgrade so rejection stays an HTTP
    /// error.
    pub fn try_acquire_permit(&self) -> Result<Option<OwnedSemaphorePermit>, UpgradeError> {
        match &self.semaphore {
            Some(semaphore) => semaphore
                .clone()
                .try_acquire_owned()
                .map(Some)
                .map_err(|_| UpgradeError::Capacity),
            None => Ok(None),
        }
    }

    /// Admit a connection to `topic`. The bridge subscription is live
    /// before the hub learns about the connection, so a frame published
    /// by another replica right after admission cannot be missed. If
    /// the bus is unavailable the connection is admitted local-only.
    pub async fn register(
        &self,
        topic: Uuid,
        user_id: Uuid,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Registration {
        let guard = match self.bridge.acquire(topic).await {
            Ok(guard) => Some(guard),
            Err(err) => {
                warn!(error = %err, hub = self.name, %topic, "bus unavailable, admitting local-only");
                None
            }
        };

        let conn_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, outbound) = mpsc::channel(self.queue_depth);
        let _ = self
            .cmd_tx
            .send(Command::Register {
                topic,
                conn_id,
                user_id,
                tx,
            })
            .await;

        Registration {
            conn_id,
            outbound: Some(outbound),
            _guard: guard,
            _permit: permit,
        }
    }

    pub async fn unregister(&self, topic: Uuid, conn_id: u64) {
        let _ = self.cmd_tx.send(Command::Unregister { topic, conn_id }).await;
    }

    /// Publish an event to the topic's local connections and to other
    /// replicas via the bus.
    pub async fn publish(&self, event: Event, sender_conn: Option<u64>) {
        let _ = self.cmd_tx.send(Command::Publish { event, sender_conn }).await;
    }

    #[doc(hidden)]
    pub fn bridge(&self) -> &Arc<PubSubBridge> {
        &self.bridge
    }
}

/// Start a hub's control loop and bus publisher. The returned handle is
/// cheap to clone; the loop stops when every handle is dropped.
pub fn spawn_hub(cfg: HubConfig, bus: Arc<dyn Bus>, node_id: Uuid) -> HubHandle {
    let (deliver_tx, deliver_rx) = mpsc::channel(256);
    let prefix = format!("hub:{}", cfg.name);
    let bridge = PubSubBridge::new(bus, node_id, &prefix, deliver_tx);

    let (cmd_tx, cmd_rx) = mpsc::channel(256);
    let (bus_tx, bus_rx) = mpsc::unbounded_channel();

    tokio::spawn(publisher_loop(cfg.name, Arc::clone(&bridge), bus_rx));

    let handle = HubHandle {
        name: cfg.name,
        cmd_tx,
        bridge,
        semaphore: cfg.max_connections.map(|n| Arc::new(Semaphore::new(n))),
        next_id: Arc::new(AtomicU64::new(1)),
        queue_depth: cfg.queue_depth,
        client_kinds: cfg.client_kinds,
    };

    tokio::spawn(control_loop(cfg, cmd_rx, deliver_rx, bus_tx));
    handle
}

/// Forwards loop-originated events to the bus without ever blocking the
/// loop. Bus failures degrade cross-replica delivery, never local.
async fn publisher_loop(
    name: &'static str,
    bridge: Arc<PubSubBridge>,
    mut bus_rx: mpsc::UnboundedReceiver<Event>,
) {
    while let Some(event) = bus_rx.recv().await {
        if let Err(err) = bridge.publish(&event).await {
            warn!(error = %err, hub = name, topic = %event.topic_id, "bus publish failed");
        }
    }
}

async fn control_loop(
    cfg: HubConfig,
    mut cmd_rx: mpsc::Receiver<Command>,
    mut deliver_rx: mpsc::Receiver<Event>,
    bus_tx: mpsc::UnboundedSender<Event>,
) {
    let mut topics: HashMap<Uuid, HashMap<u64, Member>> = HashMap::new();

    loop {
        // Commands drain before bridge deliveries: a frame queued right
        // behind an acknowledged Register must not fan out before the
        // new connection is in the registry.
        tokio::select! {
            biased;
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    Command::Register { topic, conn_id, user_id, tx } => {
                        let members = topics.entry(topic).or_default();
                        members.insert(conn_id, Member { user_id, tx });
                        debug!(hub = cfg.name, %topic, conn_id, %user_id, members = members.len(), "connection registered");

                        if let Some(announce) = cfg.announce {
                            let joined = Event::from_sender(announce.joined, topic, user_id);
                            fanout(&mut topics, &joined, Some(conn_id), cfg.name);
                            let _ = bus_tx.send(joined);
                        }
                    }
                    Command::Unregister { topic, conn_id } => {
                        let Some(members) = topics.get_mut(&topic) else { continue };
                        let Some(member) = members.remove(&conn_id) else { continue };
                        debug!(hub = cfg.name, %topic, conn_id, members = members.len(), "connection unregistered");
                        if members.is_empty() {
                            topics.remove(&topic);
                            info!(hub = cfg.name, %topic, "topic emptied");
                        }

                        if let Some(announce) = cfg.announce {
                            let left = Event::from_sender(announce.left, topic, member.user_id);
                            fanout(&mut topics, &left, None, cfg.name);
                            let _ = bus_tx.send(left);
                        }
                    }
                    Command::Publish { event, sender_conn } => {
                        let skip = match cfg.mode {
                            DeliveryMode::ExcludeSender => sender_conn,
                            DeliveryMode::Everyone => None,
                        };
                        fanout(&mut topics, &event, skip, cfg.name);
                        let _ = bus_tx.send(event);
                    }
                }
            }
            // Events another replica published to a topic we serve.
            // Their sender has no local connection, so nobody is
            // skipped beyond any explicit target.
            delivered = deliver_rx.recv() => {
                let Some(event) = delivered else { break };
                fanout(&mut topics, &event, None, cfg.name);
            }
        }
    }
}

/// Deliver `event` to the topic's connections, minus `skip` and anyone
/// outside `target_id` when it is set. A connection whose queue is full
/// is evicted on the spot; dropping its sender closes the socket
/// actor's outbound stream.
fn fanout(
    topics: &mut HashMap<Uuid, HashMap<u64, Member>>,
    event: &Event,
    skip: Option<u64>,
    hub: &str,
) {
    let Some(members) = topics.get_mut(&event.topic_id) else {
        return;
    };
    let payload = match serde_json::to_string(event) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, hub, "unserializable event dropped");
            return;
        }
    };

    let mut evicted = Vec::new();
    for (&conn_id, member) in members.iter() {
        if Some(conn_id) == skip {
            continue;
        }
        if let Some(target) = event.target_id {
            if member.user_id != target {
                continue;
            }
        }
        match member.tx.try_send(payload.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(hub, topic = %event.topic_id, conn_id, "slow consumer evicted");
                evicted.push(conn_id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                evicted.push(conn_id);
            }
        }
    }

    for conn_id in evicted {
        members.remove(&conn_id);
    }
    if members.is_empty() {
        topics.remove(&event.topic_id);
    }
}
