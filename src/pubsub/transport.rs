//! Notification transports
//!
//! [`PgNotifyTransport`] rides on PostgreSQL `pg_notify` and `LISTEN`.
//! [`InProcessTransport`] is a broadcast hub: every bus built on a clone of the
//! same hub forms one coordination domain, which is how several nodes are
//! simulated inside a single process.

use async_trait::async_trait;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use std::collections::HashSet;
use std::fmt::Debug;
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};

use crate::error::{CoordinationError, Result};

/// One notification as delivered by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNotification {
    pub channel: String,
    pub payload: String,
}

/// Sends notifications and opens listening sessions
#[async_trait]
pub trait NotificationTransport: Send + Sync + Debug {
    /// Deliver `payload` to every session listening on `channel`
    async fn notify(&self, channel: &str, payload: &str) -> Result<()>;

    /// Open a dedicated session listening on `channels`
    async fn listen(&self, channels: &[String]) -> Result<Box<dyn NotificationStream>>;

    fn name(&self) -> &'static str;
}

/// A live listening session
#[async_trait]
pub trait NotificationStream: Send {
    /// Start receiving on one more channel
    async fn listen(&mut self, channel: &str) -> Result<()>;

    /// Wait for the next notification; an error means the session is gone
    async fn recv(&mut self) -> Result<RawNotification>;
}

/// `pg_notify` / `LISTEN` over a PostgreSQL pool
#[derive(Debug, Clone)]
pub struct PgNotifyTransport {
    pool: PgPool,
}

impl PgNotifyTransport {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationTransport for PgNotifyTransport {
    #[instrument(skip(self, payload), fields(payload_len = payload.len()))]
    async fn notify(&self, channel: &str, payload: &str) -> Result<()> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn listen(&self, channels: &[String]) -> Result<Box<dyn NotificationStream>> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        if !channels.is_empty() {
            listener
                .listen_all(channels.iter().map(String::as_str))
                .await?;
        }
        debug!(channels = ?channels, "PostgreSQL listener connected");
        Ok(Box::new(PgNotificationStream { listener }))
    }

    fn name(&self) -> &'static str {
        "pg_notify"
    }
}

struct PgNotificationStream {
    listener: PgListener,
}

#[async_trait]
impl NotificationStream for PgNotificationStream {
    async fn listen(&mut self, channel: &str) -> Result<()> {
        self.listener.listen(channel).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<RawNotification> {
        // try_recv surfaces a dropped connection instead of silently reconnecting
        match self.listener.try_recv().await? {
            Some(notification) => Ok(RawNotification {
                channel: notification.channel().to_string(),
                payload: notification.payload().to_string(),
            }),
            None => Err(CoordinationError::Database(sqlx::Error::Io(
                std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "listener connection closed",
                ),
            ))),
        }
    }
}

/// Broadcast hub shared by every bus in one process-local coordination domain
#[derive(Debug, Clone)]
pub struct InProcessTransport {
    sender: broadcast::Sender<RawNotification>,
}

impl Default for InProcessTransport {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InProcessTransport {
    /// Hub buffering up to `capacity` undelivered notifications per listener
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Sessions currently attached to the hub
    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl NotificationTransport for InProcessTransport {
    async fn notify(&self, channel: &str, payload: &str) -> Result<()> {
        let notification = RawNotification {
            channel: channel.to_string(),
            payload: payload.to_string(),
        };
        // No listeners means nobody to deliver to, same as NOTIFY
        if self.sender.send(notification).is_err() {
            debug!(channel = %channel, "No in-process listeners, notification dropped");
        }
        Ok(())
    }

    async fn listen(&self, channels: &[String]) -> Result<Box<dyn NotificationStream>> {
        Ok(Box::new(InProcessStream {
            receiver: self.sender.subscribe(),
            channels: channels.iter().cloned().collect(),
        }))
    }

    fn name(&self) -> &'static str {
        "in_process"
    }
}

struct InProcessStream {
    receiver: broadcast::Receiver<RawNotification>,
    channels: HashSet<String>,
}

#[async_trait]
impl NotificationStream for InProcessStream {
    async fn listen(&mut self, channel: &str) -> Result<()> {
        self.channels.insert(channel.to_string());
        Ok(())
    }

    async fn recv(&mut self) -> Result<RawNotification> {
        loop {
            match self.receiver.recv().await {
                Ok(notification) if self.channels.contains(&notification.channel) => {
                    return Ok(notification)
                }
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "In-process listener lagged, notifications lost");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(CoordinationError::Database(sqlx::Error::Io(
                        std::io::Error::new(
                            std::io::ErrorKind::BrokenPipe,
                            "in-process hub closed",
                        ),
                    )));
                }
            }
        }
    }
}
