//! Shared Redis backend with degraded-mode tracking.
//!
//! Wraps a `ConnectionManager` behind a health-checked availability flag.
//! The server starts even when Redis is unreachable: components that
//! depend on the shared backend consult [`SharedRedis::is_degraded`] and
//! fall back to process-local state until recovery, which is announced
//! on a watch channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::{watch, RwLock};
use tokio::time::timeout;

/// Timeout applied to health-check pings and the initial connect.
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct SharedRedis {
    inner: Arc<Inner>,
}

struct Inner {
    client: redis::Client,
    conn: RwLock<Option<ConnectionManager>>,
    degraded: AtomicBool,
    // true = shared backend available
    health_tx: watch::Sender<bool>,
}

impl SharedRedis {
    /// Open a client for `url` and attempt the initial connection. A
    /// connection failure does not fail construction: the store starts
    /// in degraded mode and the health loop keeps retrying.
    pub async fn connect(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;

        let conn = match timeout(HEALTH_CHECK_TIMEOUT, ConnectionManager::new(client.clone())).await
        {
            Ok(Ok(manager)) => Some(manager),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Redis unreachable at startup, entering degraded mode");
                None
            }
            Err(_) => {
                tracing::warn!("Redis connect timed out at startup, entering degraded mode");
                None
            }
        };

        let available = conn.is_some();
        let (health_tx, _) = watch::channel(available);

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                conn: RwLock::new(conn),
                degraded: AtomicBool::new(!available),
                health_tx,
            }),
        })
    }

    /// True while the shared backend is unreachable.
    pub fn is_degraded(&self) -> bool {
        self.inner.degraded.load(Ordering::Relaxed)
    }

    /// Watch availability transitions (true = available). Used to
    /// trigger reconciliation of fallback state after recovery.
    pub fn availability(&self) -> watch::Receiver<bool> {
        self.inner.health_tx.subscribe()
    }

    /// Ping the backend, reconnecting if necessary, and update the
    /// degraded flag. Flag transitions are published on the watch
    /// channel.
    pub async fn health_check(&self) {
        let manager = { self.inner.conn.read().await.clone() };

        let healthy = match manager {
            Some(mut conn) => matches!(
                timeout(
                    HEALTH_CHECK_TIMEOUT,
                    redis::cmd("PING").query_async::<String>(&mut conn)
                )
                .await,
                Ok(Ok(_))
            ),
            None => {
                // No live manager yet; try to establish one.
                match timeout(
                    HEALTH_CHECK_TIMEOUT,
                    ConnectionManager::new(self.inner.client.clone()),
                )
                .await
                {
                    Ok(Ok(manager)) => {
                        *self.inner.conn.write().await = Some(manager);
                        true
                    }
                    _ => false,
                }
            }
        };

        self.set_available(healthy);
    }

    /// Drive the availability flag directly, bypassing the health loop.
    /// Lets callers simulate an outage and recovery against a live
    /// backend.
    #[doc(hidden)]
    pub fn force_availability(&self, available: bool) {
        self.set_available(available);
    }

    fn set_available(&self, available: bool) {
        let was_degraded = self.inner.degraded.swap(!available, Ordering::Relaxed);
        if was_degraded == !available {
            return;
        }
        if available {
            tracing::info!("Redis recovered, leaving degraded mode");
        } else {
            tracing::warn!("Redis health check failed, entering degraded mode");
        }
        let _ = self.inner.health_tx.send(available);
    }

    /// Run periodic health checks until the process exits.
    pub fn spawn_health_loop(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                store.health_check().await;
            }
        })
    }

    async fn manager(&self) -> redis::RedisResult<ConnectionManager> {
        self.inner.conn.read().await.clone().ok_or_else(|| {
            redis::RedisError::from((redis::ErrorKind::IoError, "redis unavailable"))
        })
    }

    // Typed command helpers. Callers are expected to branch on
    // `is_degraded()` first; these error if no connection exists.

    pub async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> redis::RedisResult<()> {
        let mut conn = self.manager().await?;
        conn.set_ex(key, value, ttl.as_secs().max(1)).await
    }

    pub async fn get(&self, key: &str) -> redis::RedisResult<Option<String>> {
        let mut conn = self.manager().await?;
        conn.get(key).await
    }

    pub async fn del(&self, key: &str) -> redis::RedisResult<()> {
        let mut conn = self.manager().await?;
        conn.del(key).await
    }

    pub async fn exists(&self, key: &str) -> redis::RedisResult<bool> {
        let mut conn = self.manager().await?;
        conn.exists(key).await
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> redis::RedisResult<bool> {
        let mut conn = self.manager().await?;
        conn.expire(key, ttl.as_secs().max(1) as i64).await
    }

    pub async fn incr(&self, key: &str) -> redis::RedisResult<i64> {
        let mut conn = self.manager().await?;
        conn.incr(key, 1).await
    }

    pub async fn sadd(&self, key: &str, member: &str) -> redis::RedisResult<()> {
        let mut conn = self.manager().await?;
        conn.sadd(key, member).await
    }

    pub async fn srem(&self, key: &str, member: &str) -> redis::RedisResult<()> {
        let mut conn = self.manager().await?;
        conn.srem(key, member).await
    }

    pub async fn smembers(&self, key: &str) -> redis::RedisResult<Vec<String>> {
        let mut conn = self.manager().await?;
        conn.smembers(key).await
    }

    pub async fn sismember(&self, key: &str, member: &str) -> redis::RedisResult<bool> {
        let mut conn = self.manager().await?;
        conn.sismember(key, member).await
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> redis::RedisResult<()> {
        let mut conn = self.manager().await?;
        conn.publish(channel, payload).await
    }

    /// Client handle for dedicated pub/sub connections (subscriptions
    /// cannot share the multiplexed command connection).
    pub fn client(&self) -> redis::Client {
        self.inner.client.clone()
    }
}
