//! Hub fanout semantics over an in-process bus: delivery modes,
//! targeting, topic lifecycle, capacity, and cross-replica exchange.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use uuid::Uuid;

use converse_server::error::UpgradeError;
use converse_server::hub::bus::LocalBus;
use converse_server::hub::event::{self, Event};
use converse_server::hub::{spawn_hub, DeliveryMode, HubConfig, HubHandle, Registration};

fn test_hub(bus: Arc<LocalBus>, mode: DeliveryMode, cap: Option<usize>) -> HubHandle {
    spawn_hub(
        HubConfig {
            name: "chat",
            mode,
            max_connections: cap,
            queue_depth: 8,
            announce: None,
            client_kinds: event::CHAT_CLIENT_KINDS,
        },
        bus,
        Uuid::new_v4(),
    )
}

async fn join(hub: &HubHandle, topic: Uuid) -> (Uuid, Registration) {
    let user = Uuid::new_v4();
    let reg = hub.register(topic, user, None).await;
    (user, reg)
}

async fn next_frame(rx: &mut tokio::sync::mpsc::Receiver<String>) -> Event {
    let raw = timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for frame")
        .expect("outbound closed");
    serde_json::from_str(&raw).expect("frame parses")
}

fn assert_silent(rx: &mut tokio::sync::mpsc::Receiver<String>) {
    assert!(rx.try_recv().is_err(), "unexpected frame delivered");
}

#[tokio::test]
async fn untargeted_publish_skips_sender_and_reaches_everyone_else() {
    let bus = Arc::new(LocalBus::new());
    let hub = test_hub(bus, DeliveryMode::ExcludeSender, None);
    let topic = Uuid::new_v4();

    let (sender, mut a) = join(&hub, topic).await;
    let (_, mut b) = join(&hub, topic).await;
    let (_, mut c) = join(&hub, topic).await;
    let mut a_rx = a.take_outbound();
    let mut b_rx = b.take_outbound();
    let mut c_rx = c.take_outbound();

    let mut ev = Event::from_sender(event::CHAT, topic, sender);
    ev.content = Some("hi".to_string());
    hub.publish(ev, Some(a.conn_id)).await;

    assert_eq!(next_frame(&mut b_rx).await.content.as_deref(), Some("hi"));
    assert_eq!(next_frame(&mut c_rx).await.content.as_deref(), Some("hi"));

    sleep(Duration::from_millis(100)).await;
    assert_silent(&mut a_rx);
    // exactly once each
    assert_silent(&mut b_rx);
    assert_silent(&mut c_rx);
}

#[tokio::test]
async fn everyone_mode_includes_sender() {
    let bus = Arc::new(LocalBus::new());
    let hub = test_hub(bus, DeliveryMode::Everyone, None);
    let topic = Uuid::new_v4();

    let (sender, mut a) = join(&hub, topic).await;
    let (_, mut b) = join(&hub, topic).await;
    let mut a_rx = a.take_outbound();
    let mut b_rx = b.take_outbound();

    hub.publish(Event::from_sender(event::POLL_VOTED, topic, sender), Some(a.conn_id))
        .await;

    assert_eq!(next_frame(&mut a_rx).await.kind, event::POLL_VOTED);
    assert_eq!(next_frame(&mut b_rx).await.kind, event::POLL_VOTED);
}

#[tokio::test]
async fn targeted_event_reaches_only_the_target() {
    let bus = Arc::new(LocalBus::new());
    let hub = test_hub(bus, DeliveryMode::ExcludeSender, None);
    let topic = Uuid::new_v4();

    let (sender, mut a) = join(&hub, topic).await;
    let (target_user, mut b) = join(&hub, topic).await;
    let (_, mut c) = join(&hub, topic).await;
    let mut a_rx = a.take_outbound();
    let mut b_rx = b.take_outbound();
    let mut c_rx = c.take_outbound();

    let mut ev = Event::from_sender(event::OFFER, topic, sender);
    ev.target_id = Some(target_user);
    ev.sdp = Some("v=0".to_string());
    hub.publish(ev, Some(a.conn_id)).await;

    let got = next_frame(&mut b_rx).await;
    assert_eq!(got.target_id, Some(target_user));
    assert_eq!(got.sdp.as_deref(), Some("v=0"));

    sleep(Duration::from_millis(100)).await;
    assert_silent(&mut a_rx);
    assert_silent(&mut c_rx);
}

#[tokio::test]
async fn last_unregister_closes_bridge_subscription() {
    let bus = Arc::new(LocalBus::new());
    let hub = test_hub(bus, DeliveryMode::ExcludeSender, None);
    let topic = Uuid::new_v4();

    let (_, a) = join(&hub, topic).await;
    let (_, b) = join(&hub, topic).await;
    assert!(hub.bridge().has_subscription(topic).await);

    hub.unregister(topic, a.conn_id).await;
    drop(a);
    sleep(Duration::from_millis(50)).await;
    assert!(hub.bridge().has_subscription(topic).await);

    hub.unregister(topic, b.conn_id).await;
    drop(b);
    sleep(Duration::from_millis(50)).await;
    assert!(!hub.bridge().has_subscription(topic).await);
}

#[tokio::test]
async fn capacity_cap_rejects_excess_registrations() {
    let bus = Arc::new(LocalBus::new());
    let hub = test_hub(bus, DeliveryMode::Everyone, Some(2));

    let first = hub.try_acquire_permit().unwrap();
    let second = hub.try_acquire_permit().unwrap();
    assert!(first.is_some() && second.is_some());

    assert!(matches!(
        hub.try_acquire_permit(),
        Err(UpgradeError::Capacity)
    ));

    // Releasing a slot frees capacity again.
    drop(first);
    assert!(hub.try_acquire_permit().unwrap().is_some());
}

#[tokio::test]
async fn slow_consumer_is_evicted() {
    let bus = Arc::new(LocalBus::new());
    let hub = test_hub(bus, DeliveryMode::Everyone, None);
    let topic = Uuid::new_v4();

    let (slow_user, mut slow) = join(&hub, topic).await;
    let (_, mut healthy) = join(&hub, topic).await;
    // Never drained: its queue (depth 8) fills and overflows.
    let mut slow_rx = slow.take_outbound();
    let mut healthy_rx = healthy.take_outbound();

    for _ in 0..10 {
        hub.publish(Event::from_sender(event::CHAT, topic, slow_user), None)
            .await;
    }
    sleep(Duration::from_millis(100)).await;

    // The healthy consumer got everything.
    for _ in 0..10 {
        next_frame(&mut healthy_rx).await;
    }

    // The slow consumer's queue holds the first 8 frames, then closes.
    let mut drained = 0;
    while let Ok(Some(_)) = timeout(Duration::from_millis(100), slow_rx.recv()).await {
        drained += 1;
    }
    assert_eq!(drained, 8);
}

#[tokio::test]
async fn replicas_exchange_events_exactly_once() {
    let bus = Arc::new(LocalBus::new());
    // Two hubs with the same name share bus channels, like two replicas
    // behind a load balancer.
    let replica_a = test_hub(bus.clone(), DeliveryMode::ExcludeSender, None);
    let replica_b = test_hub(bus, DeliveryMode::ExcludeSender, None);
    let topic = Uuid::new_v4();

    let (sender, mut on_a) = join(&replica_a, topic).await;
    let (_, mut peer_a) = join(&replica_a, topic).await;
    let (_, mut on_b) = join(&replica_b, topic).await;
    let mut sender_rx = on_a.take_outbound();
    let mut peer_a_rx = peer_a.take_outbound();
    let mut on_b_rx = on_b.take_outbound();

    let mut ev = Event::from_sender(event::CHAT, topic, sender);
    ev.content = Some("cross".to_string());
    replica_a.publish(ev, Some(on_a.conn_id)).await;

    // Local peer via fanout, remote peer via the bus; each exactly once.
    assert_eq!(next_frame(&mut peer_a_rx).await.content.as_deref(), Some("cross"));
    assert_eq!(next_frame(&mut on_b_rx).await.content.as_deref(), Some("cross"));

    sleep(Duration::from_millis(100)).await;
    assert_silent(&mut sender_rx);
    assert_silent(&mut peer_a_rx);
    assert_silent(&mut on_b_rx);
}

#[tokio::test]
async fn bridge_deliveries_never_outrun_a_prior_registration() {
    let bus = Arc::new(LocalBus::new());
    let replica_a = test_hub(bus.clone(), DeliveryMode::ExcludeSender, None);
    let replica_b = test_hub(bus, DeliveryMode::ExcludeSender, None);

    // Register on B and publish from A back to back, repeatedly. The
    // fresh connection must see the frame every time: the control loop
    // drains its registration before any bus delivery queued behind it.
    for _ in 0..20 {
        let topic = Uuid::new_v4();
        let (_, mut on_b) = join(&replica_b, topic).await;
        let mut on_b_rx = on_b.take_outbound();
        let (sender, on_a) = join(&replica_a, topic).await;

        replica_a
            .publish(Event::from_sender(event::CHAT, topic, sender), Some(on_a.conn_id))
            .await;
        assert_eq!(next_frame(&mut on_b_rx).await.kind, event::CHAT);
    }
}

#[tokio::test]
async fn announce_events_flow_on_register_and_unregister() {
    let bus = Arc::new(LocalBus::new());
    let hub = spawn_hub(
        HubConfig {
            name: "chat",
            mode: DeliveryMode::ExcludeSender,
            max_connections: None,
            queue_depth: 8,
            announce: Some(converse_server::hub::Announce {
                joined: event::USER_JOINED,
                left: event::USER_LEFT,
            }),
            client_kinds: event::CHAT_CLIENT_KINDS,
        },
        bus,
        Uuid::new_v4(),
    );
    let topic = Uuid::new_v4();

    let (_, mut a) = join(&hub, topic).await;
    let mut a_rx = a.take_outbound();

    let (joiner, b) = join(&hub, topic).await;
    let frame = next_frame(&mut a_rx).await;
    assert_eq!(frame.kind, event::USER_JOINED);
    assert_eq!(frame.sender_id, Some(joiner));

    hub.unregister(topic, b.conn_id).await;
    drop(b);
    let frame = next_frame(&mut a_rx).await;
    assert_eq!(frame.kind, event::USER_LEFT);
    assert_eq!(frame.sender_id, Some(joiner));
}
