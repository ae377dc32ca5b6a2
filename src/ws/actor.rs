//! Actor-per-connection socket handling.
//!
//! Each upgraded socket gets a writer task that owns the sink and a
//! reader loop on the calling task. The writer drains the hub's
//! outbound queue and emits keepalive pings; the reader enforces the
//! read deadline and feeds inbound frames to the hub. When either side
//! ends, the connection unregisters and its permit and bridge guard
//! release with it.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::KeepaliveConfig;
use crate::hub::event::Event;
use crate::hub::HubHandle;
use crate::presence::PresenceTracker;

/// Close code sent when the hub evicts a consumer that stopped
/// draining its queue.
const CLOSE_SLOW_CONSUMER: u16 = 1013;

pub struct ConnectionCtx {
    pub user_id: Uuid,
    pub topic: Uuid,
    pub permit: Option<OwnedSemaphorePermit>,
    pub keepalive: KeepaliveConfig,
    /// Set for hubs that mark users online for the connection's
    /// lifetime (chat); None elsewhere.
    pub presence: Option<Arc<PresenceTracker>>,
}

pub async fn run_connection(socket: WebSocket, hub: HubHandle, ctx: ConnectionCtx) {
    let mut registration = hub.register(ctx.topic, ctx.user_id, ctx.permit).await;
    let conn_id = registration.conn_id;

    if let Some(presence) = &ctx.presence {
        presence.set_online(ctx.user_id).await;
    }

    info!(user_id = %ctx.user_id, topic = %ctx.topic, conn_id, "socket connected");

    let (sink, mut ws_receiver) = socket.split();
    let ping_interval = Duration::from_secs(ctx.keepalive.ping_interval_secs);
    let read_deadline = Duration::from_secs(ctx.keepalive.read_deadline_secs);

    let writer = tokio::spawn(writer_task(sink, registration.take_outbound(), ping_interval));

    loop {
        match timeout(read_deadline, ws_receiver.next()).await {
            Err(_) => {
                warn!(user_id = %ctx.user_id, conn_id, "read deadline exceeded, closing");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                debug!(error = %err, conn_id, "socket read error");
                break;
            }
            Ok(Some(Ok(msg))) => match msg {
                Message::Text(text) => {
                    match Event::from_client(&text, ctx.topic, ctx.user_id) {
                        Ok(event) if !hub.accepts_kind(&event.kind) => {
                            warn!(kind = %event.kind, user_id = %ctx.user_id, conn_id, "unknown event kind dropped");
                        }
                        Ok(event) => hub.publish(event, Some(conn_id)).await,
                        Err(err) => {
                            warn!(error = %err, user_id = %ctx.user_id, conn_id, "malformed frame dropped");
                        }
                    }
                }
                Message::Close(_) => break,
                // Pings and pongs already reset the deadline by arriving.
                Message::Ping(_) | Message::Pong(_) => {}
                Message::Binary(_) => {
                    debug!(conn_id, "binary frame ignored");
                }
            },
        }
    }

    writer.abort();
    hub.unregister(ctx.topic, conn_id).await;
    if let Some(presence) = &ctx.presence {
        presence.set_offline(ctx.user_id).await;
    }
    drop(registration);
    info!(user_id = %ctx.user_id, topic = %ctx.topic, conn_id, "socket disconnected");
}

/// Owns the sink: forwards hub fanout and emits keepalive pings. The
/// outbound channel closing means the hub dropped us (eviction or
/// shutdown); the client gets a close frame saying so.
async fn writer_task(
    mut sink: SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<String>,
    ping_interval: Duration,
) {
    let mut ticker = interval(ping_interval);
    ticker.tick().await;

    loop {
        tokio::select! {
            payload = outbound.recv() => match payload {
                Some(payload) => {
                    if sink.send(Message::Text(payload.into())).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CLOSE_SLOW_CONSUMER,
                            reason: "delivery queue overflow".into(),
                        })))
                        .await;
                    break;
                }
            },
            _ = ticker.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }
}
