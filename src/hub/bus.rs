//! Cross-replica event bus.
//!
//! [`RedisBus`] carries frames over Redis pub/sub, one channel per
//! topic, which is how replicas behind a load balancer see each other's
//! events. [`LocalBus`] is an in-process bus over broadcast channels
//! with the same contract, used in tests and single-replica setups
//! where Redis pub/sub buys nothing.
//!
//! `subscribe` resolves only after the subscription is active, so a
//! caller that awaits it before admitting a connection cannot miss
//! frames published afterwards.

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::store::SharedRedis;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus backend error: {0}")]
    Backend(#[from] redis::RedisError),

    #[error("bus backend unavailable")]
    Unavailable,

    #[error("bus frame encode failed: {0}")]
    Codec(#[from] serde_json::Error),
}

#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError>;

    /// Open a confirmed subscription on `channel`. Payloads arrive on
    /// the returned receiver until `cancel` fires.
    async fn subscribe(
        &self,
        channel: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<String>, BusError>;
}

/// Redis pub/sub bus. Publishing goes through the shared multiplexed
/// connection; each subscription holds its own pub/sub connection,
/// which Redis requires.
pub struct RedisBus {
    redis: SharedRedis,
}

impl RedisBus {
    pub fn new(redis: SharedRedis) -> Self {
        Self { redis }
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        if self.redis.is_degraded() {
            return Err(BusError::Unavailable);
        }
        self.redis.publish(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<String>, BusError> {
        if self.redis.is_degraded() {
            return Err(BusError::Unavailable);
        }
        let mut pubsub = self.redis.client().get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        debug!(channel, "bus subscription active");

        let (tx, rx) = mpsc::channel(64);
        let channel = channel.to_string();
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = messages.next() => {
                        let Some(msg) = msg else { break };
                        match msg.get_payload::<String>() {
                            Ok(payload) => {
                                if tx.send(payload).await.is_err() {
                                    break;
                                }
                            }
                            Err(err) => {
                                warn!(error = %err, channel, "undecodable bus payload dropped");
                            }
                        }
                    }
                }
            }
            // Dropping the pub/sub connection tears the subscription down.
            debug!(channel, "bus subscription closed");
        });
        Ok(rx)
    }
}

/// In-process bus: one broadcast channel per topic channel name.
pub struct LocalBus {
    channels: DashMap<String, broadcast::Sender<String>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn publish(&self, channel: &str, payload: &str) -> Result<(), BusError> {
        // No receivers is not an error; nobody on this topic yet.
        let _ = self.sender(channel).send(payload.to_string());
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<String>, BusError> {
        let mut source = self.sender(channel).subscribe();
        let (tx, rx) = mpsc::channel(64);
        let channel = channel.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    msg = source.recv() => match msg {
                        Ok(payload) => {
                            if tx.send(payload).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(channel, missed, "bus subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_bus_delivers_after_subscribe() {
        let bus = LocalBus::new();
        let cancel = CancellationToken::new();
        let mut rx = bus.subscribe("t1", cancel.clone()).await.unwrap();
        bus.publish("t1", "hello").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn local_bus_isolates_channels() {
        let bus = LocalBus::new();
        let cancel = CancellationToken::new();
        let mut rx = bus.subscribe("t1", cancel.clone()).await.unwrap();
        bus.publish("t2", "other").await.unwrap();
        bus.publish("t1", "mine").await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "mine");
    }

    #[tokio::test]
    async fn cancel_closes_subscription() {
        let bus = LocalBus::new();
        let cancel = CancellationToken::new();
        let mut rx = bus.subscribe("t1", cancel.clone()).await.unwrap();
        cancel.cancel();
        // The forwarding task exits; the receiver drains to None.
        assert_eq!(rx.recv().await, None);
    }
}
