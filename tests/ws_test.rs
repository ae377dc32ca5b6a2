//! End-to-end tests over real sockets: upgrade policy, keepalive-level
//! wiring, chat fanout, capacity, and the presence REST surface.
//!
//! The server runs against an unreachable Redis, exercising degraded
//! mode throughout, with an in-process bus standing in for pub/sub.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use converse_server::auth::issue_access_token;
use converse_server::config::Config;
use converse_server::error::UpgradeError;
use converse_server::hub::bus::{Bus, LocalBus};
use converse_server::hub::event::Event;
use converse_server::membership::TopicMembership;
use converse_server::routes::build_router;
use converse_server::state::AppState;
use converse_server::store::SharedRedis;

const SECRET: &[u8] = b"test-secret";
const ORIGIN: &str = "http://localhost:3000";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct DenyAll;

#[async_trait]
impl TopicMembership for DenyAll {
    async fn is_participant(&self, _user: Uuid, _topic: Uuid) -> Result<bool, UpgradeError> {
        Ok(false)
    }
}

/// Start the server on a random port. Redis is unreachable on purpose,
/// so session and presence state run on the fallback cache.
async fn start_server(
    tune: impl FnOnce(&mut Config),
    membership: Option<Arc<dyn TopicMembership>>,
) -> (String, AppState) {
    let mut config = Config::default();
    config.jwt_secret = "test-secret".to_string();
    tune(&mut config);

    let redis = SharedRedis::connect("redis://127.0.0.1:59999")
        .await
        .expect("client opens even when unreachable");
    assert!(redis.is_degraded());

    let bus: Arc<dyn Bus> = Arc::new(LocalBus::new());
    let mut state = AppState::with_bus(Arc::new(config), redis, bus);
    if let Some(membership) = membership {
        state.membership = membership;
    }

    let app = build_router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    (format!("127.0.0.1:{}", addr.port()), state)
}

async fn connect_ws(url: &str, origin: Option<&str>) -> Result<WsStream, tungstenite::Error> {
    let mut request = url.into_client_request().unwrap();
    if let Some(origin) = origin {
        request
            .headers_mut()
            .insert("Origin", origin.parse().unwrap());
    }
    let (stream, _) = tokio_tungstenite::connect_async(request).await?;
    Ok(stream)
}

fn chat_url(base: &str, topic: Uuid, token: &str) -> String {
    format!("ws://{base}/ws/chat?conversation_id={topic}&token={token}")
}

fn reject_status(err: tungstenite::Error) -> u16 {
    match err {
        tungstenite::Error::Http(resp) => resp.status().as_u16(),
        other => panic!("expected HTTP rejection, got {other:?}"),
    }
}

/// Next frame of the given kind, skipping announces and pings.
async fn next_of_kind(stream: &mut WsStream, kind: &str) -> Event {
    loop {
        let msg = timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("socket error");
        if let Message::Text(text) = msg {
            let event: Event = serde_json::from_str(&text).expect("frame parses");
            if event.kind == kind {
                return event;
            }
        }
    }
}

fn assert_no_chat_frame(stream: &mut WsStream) {
    // bounded peek: anything buffered must not be a chat event
    let waker = futures_util::task::noop_waker();
    let mut cx = std::task::Context::from_waker(&waker);
    while let std::task::Poll::Ready(Some(Ok(Message::Text(text)))) =
        stream.poll_next_unpin(&mut cx)
    {
        let event: Event = serde_json::from_str(&text).expect("frame parses");
        assert_ne!(event.kind, "chat", "sender received its own event");
    }
}

#[tokio::test]
async fn upgrade_without_origin_is_rejected() {
    let (base, _) = start_server(|_| {}, None).await;
    let token = issue_access_token(SECRET, Uuid::new_v4()).unwrap();
    let err = connect_ws(&chat_url(&base, Uuid::new_v4(), &token), None)
        .await
        .unwrap_err();
    assert_eq!(reject_status(err), 403);
}

#[tokio::test]
async fn upgrade_with_unlisted_origin_is_rejected() {
    let (base, _) = start_server(|_| {}, None).await;
    let token = issue_access_token(SECRET, Uuid::new_v4()).unwrap();
    let err = connect_ws(
        &chat_url(&base, Uuid::new_v4(), &token),
        Some("http://evil.example"),
    )
    .await
    .unwrap_err();
    assert_eq!(reject_status(err), 403);
}

#[tokio::test]
async fn upgrade_with_bad_token_is_rejected() {
    let (base, _) = start_server(|_| {}, None).await;
    let err = connect_ws(&chat_url(&base, Uuid::new_v4(), "not-a-token"), Some(ORIGIN))
        .await
        .unwrap_err();
    assert_eq!(reject_status(err), 401);
}

#[tokio::test]
async fn upgrade_with_revoked_token_is_rejected() {
    let (base, state) = start_server(|_| {}, None).await;
    let user = Uuid::new_v4();
    let token = issue_access_token(SECRET, user).unwrap();
    let claims = converse_server::auth::validate_access_token(SECRET, &token).unwrap();
    state
        .sessions
        .blacklist_token(&claims.jti, Duration::from_secs(60))
        .await;

    let err = connect_ws(&chat_url(&base, Uuid::new_v4(), &token), Some(ORIGIN))
        .await
        .unwrap_err();
    assert_eq!(reject_status(err), 401);
}

#[tokio::test]
async fn non_participant_upgrade_is_rejected() {
    let (base, _) = start_server(|_| {}, Some(Arc::new(DenyAll))).await;
    let token = issue_access_token(SECRET, Uuid::new_v4()).unwrap();
    let err = connect_ws(&chat_url(&base, Uuid::new_v4(), &token), Some(ORIGIN))
        .await
        .unwrap_err();
    assert_eq!(reject_status(err), 403);
}

#[tokio::test]
async fn poll_capacity_cap_rejects_the_excess_connection() {
    let (base, _) = start_server(
        |config| config.hubs.max_poll_connections = Some(2),
        None,
    )
    .await;
    let topic = Uuid::new_v4();
    let url = |token: &str| format!("ws://{base}/ws/poll?conversation_id={topic}&token={token}");

    let t1 = issue_access_token(SECRET, Uuid::new_v4()).unwrap();
    let t2 = issue_access_token(SECRET, Uuid::new_v4()).unwrap();
    let t3 = issue_access_token(SECRET, Uuid::new_v4()).unwrap();

    let _first = connect_ws(&url(&t1), Some(ORIGIN)).await.unwrap();
    let _second = connect_ws(&url(&t2), Some(ORIGIN)).await.unwrap();
    let err = connect_ws(&url(&t3), Some(ORIGIN)).await.unwrap_err();
    assert_eq!(reject_status(err), 503);
}

#[tokio::test]
async fn chat_fanout_excludes_sender_and_follows_departures() {
    let (base, _) = start_server(|_| {}, None).await;
    let topic = Uuid::new_v4();

    let user_a = Uuid::new_v4();
    let token_a = issue_access_token(SECRET, user_a).unwrap();
    let token_b = issue_access_token(SECRET, Uuid::new_v4()).unwrap();
    let token_c = issue_access_token(SECRET, Uuid::new_v4()).unwrap();

    let mut a = connect_ws(&chat_url(&base, topic, &token_a), Some(ORIGIN))
        .await
        .unwrap();
    let mut b = connect_ws(&chat_url(&base, topic, &token_b), Some(ORIGIN))
        .await
        .unwrap();
    let mut c = connect_ws(&chat_url(&base, topic, &token_c), Some(ORIGIN))
        .await
        .unwrap();
    // Let the join announces land before publishing.
    tokio::time::sleep(Duration::from_millis(100)).await;

    a.send(Message::Text(r#"{"type":"chat","content":"hi"}"#.into()))
        .await
        .unwrap();

    let to_b = next_of_kind(&mut b, "chat").await;
    assert_eq!(to_b.content.as_deref(), Some("hi"));
    assert_eq!(to_b.sender_id, Some(user_a));
    assert_eq!(to_b.topic_id, topic);
    let to_c = next_of_kind(&mut c, "chat").await;
    assert_eq!(to_c.content.as_deref(), Some("hi"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_no_chat_frame(&mut a);

    // C leaves; another publish reaches only B.
    c.close(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    a.send(Message::Text(r#"{"type":"chat","content":"again"}"#.into()))
        .await
        .unwrap();
    let to_b = next_of_kind(&mut b, "chat").await;
    assert_eq!(to_b.content.as_deref(), Some("again"));
}

#[tokio::test]
async fn unknown_event_kinds_are_dropped_without_fanout() {
    let (base, _) = start_server(|_| {}, None).await;
    let topic = Uuid::new_v4();
    let token_a = issue_access_token(SECRET, Uuid::new_v4()).unwrap();
    let token_b = issue_access_token(SECRET, Uuid::new_v4()).unwrap();

    let mut a = connect_ws(&chat_url(&base, topic, &token_a), Some(ORIGIN))
        .await
        .unwrap();
    let mut b = connect_ws(&chat_url(&base, topic, &token_b), Some(ORIGIN))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // A kind outside the chat vocabulary, then a real one. Delivery is
    // ordered per connection, so if the first had fanned out it would
    // arrive at B before the second.
    a.send(Message::Text(r#"{"type":"no_such_kind","content":"x"}"#.into()))
        .await
        .unwrap();
    a.send(Message::Text(r#"{"type":"chat","content":"real"}"#.into()))
        .await
        .unwrap();

    loop {
        let msg = timeout(Duration::from_secs(2), b.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("socket error");
        if let Message::Text(text) = msg {
            let event: Event = serde_json::from_str(&text).expect("frame parses");
            assert_ne!(event.kind, "no_such_kind", "unvalidated kind fanned out");
            if event.kind == "chat" {
                assert_eq!(event.content.as_deref(), Some("real"));
                break;
            }
        }
    }
}

#[tokio::test]
async fn silent_connection_is_closed_after_the_read_deadline() {
    let (base, _) = start_server(
        |config| {
            config.keepalive.read_deadline_secs = 1;
            // No pings; the client's auto-pongs would reset the deadline.
            config.keepalive.ping_interval_secs = 60;
        },
        None,
    )
    .await;
    let token = issue_access_token(SECRET, Uuid::new_v4()).unwrap();
    let mut ws = connect_ws(&chat_url(&base, Uuid::new_v4(), &token), Some(ORIGIN))
        .await
        .unwrap();

    let ended = timeout(Duration::from_secs(3), async {
        loop {
            match ws.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "silent connection survived past the deadline");
}

#[tokio::test]
async fn server_pings_on_the_keepalive_interval() {
    let (base, _) = start_server(
        |config| {
            config.keepalive.ping_interval_secs = 1;
            config.keepalive.read_deadline_secs = 60;
        },
        None,
    )
    .await;
    let token = issue_access_token(SECRET, Uuid::new_v4()).unwrap();
    let mut ws = connect_ws(&chat_url(&base, Uuid::new_v4(), &token), Some(ORIGIN))
        .await
        .unwrap();

    let pinged = timeout(Duration::from_secs(3), async {
        while let Some(Ok(msg)) = ws.next().await {
            if matches!(msg, Message::Ping(_)) {
                return true;
            }
        }
        false
    })
    .await
    .expect("timed out waiting for a keepalive ping");
    assert!(pinged);
}

#[tokio::test]
async fn malformed_frames_are_dropped_without_closing() {
    let (base, _) = start_server(|_| {}, None).await;
    let topic = Uuid::new_v4();
    let token_a = issue_access_token(SECRET, Uuid::new_v4()).unwrap();
    let token_b = issue_access_token(SECRET, Uuid::new_v4()).unwrap();

    let mut a = connect_ws(&chat_url(&base, topic, &token_a), Some(ORIGIN))
        .await
        .unwrap();
    let mut b = connect_ws(&chat_url(&base, topic, &token_b), Some(ORIGIN))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    a.send(Message::Text("{not even json".into())).await.unwrap();
    // The connection survives and the next well-formed frame flows.
    a.send(Message::Text(r#"{"type":"chat","content":"still here"}"#.into()))
        .await
        .unwrap();
    let got = next_of_kind(&mut b, "chat").await;
    assert_eq!(got.content.as_deref(), Some("still here"));
}

#[tokio::test]
async fn health_reports_degraded_backend() {
    let (base, _) = start_server(|_| {}, None).await;
    let body: serde_json::Value = reqwest::get(format!("http://{base}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["degraded"], true);
}

#[tokio::test]
async fn heartbeat_marks_the_caller_online() {
    let (base, _) = start_server(|_| {}, None).await;
    let user = Uuid::new_v4();
    let token = issue_access_token(SECRET, user).unwrap();
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("http://{base}/api/presence/heartbeat"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    let body: serde_json::Value = client
        .get(format!("http://{base}/api/presence"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let online: Vec<Uuid> = serde_json::from_value(body["online"].clone()).unwrap();
    assert!(online.contains(&user));
}

#[tokio::test]
async fn presence_endpoints_require_a_token() {
    let (base, _) = start_server(|_| {}, None).await;
    let resp = reqwest::get(format!("http://{base}/api/presence"))
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);
}
