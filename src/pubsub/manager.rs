//! The event bus: subscriptions, publishing, and the listen/reconnect loop.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::dispatch::{DispatchPool, DispatchStats};
use super::events::{generate_node_id, EventPayload, EventType, NodeEnvelope};
use super::transport::{NotificationTransport, PgNotifyTransport, RawNotification};
use super::validate_channel_name;
use crate::config::PubSubConfig;
use crate::database::DatabaseBackend;
use crate::error::{CoordinationError, Result};
use crate::resilience::ReconnectConfig;

type ErasedHandler =
    Arc<dyn Fn(Value) -> std::result::Result<BoxFuture<'static, ()>, serde_json::Error> + Send + Sync>;

/// Handle returned by [`PubSubManager::subscribe`]
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

struct Subscription {
    channel: String,
    handler: ErasedHandler,
}

#[derive(Default)]
struct Registry {
    subscriptions: HashMap<SubscriptionId, Subscription>,
    by_channel: HashMap<String, Vec<SubscriptionId>>,
}

/// Listener statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ListenerStats {
    pub connected: bool,
    pub channels_listening: usize,
    pub events_received: u64,
    pub parse_errors: u64,
    pub connection_errors: u64,
    pub reconnect_attempts: u64,
    pub last_event_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
}

/// Bus statistics: listener side plus handler dispatch
#[derive(Debug, Clone, Default, Serialize)]
pub struct PubSubStats {
    pub listener: ListenerStats,
    pub dispatch: DispatchStats,
}

/// Cross-node event bus over a [`NotificationTransport`].
///
/// Without a transport (SQLite, tests) the bus runs in mock mode: publishing
/// is a no-op and [`Self::start_listening`] just waits for cancellation.
/// [`Self::dispatch_local`] works in every mode.
pub struct PubSubManager {
    node_id: String,
    config: PubSubConfig,
    transport: Option<Arc<dyn NotificationTransport>>,
    registry: Mutex<Registry>,
    reconnect: Mutex<ReconnectConfig>,
    listening: AtomicBool,
    stop: Mutex<CancellationToken>,
    channels_changed: Notify,
    pool: DispatchPool,
    stats: RwLock<ListenerStats>,
}

impl fmt::Debug for PubSubManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PubSubManager")
            .field("node_id", &self.node_id)
            .field("transport", &self.transport.as_ref().map(|t| t.name()))
            .field("listening", &self.is_listening())
            .finish()
    }
}

/// Clears the listening flag however the listen loop exits
struct ListeningGuard<'a>(&'a AtomicBool);

impl Drop for ListeningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl PubSubManager {
    pub fn new(config: PubSubConfig, transport: Option<Arc<dyn NotificationTransport>>) -> Self {
        let node_id = generate_node_id();
        info!(
            node_id = %node_id,
            transport = transport.as_ref().map(|t| t.name()).unwrap_or("mock"),
            "📡 Pub/sub bus created"
        );
        Self {
            node_id,
            reconnect: Mutex::new(config.reconnect.clone()),
            pool: DispatchPool::new("pubsub", &config.dispatch),
            config,
            transport,
            registry: Mutex::new(Registry::default()),
            listening: AtomicBool::new(false),
            stop: Mutex::new(CancellationToken::new()),
            channels_changed: Notify::new(),
            stats: RwLock::new(ListenerStats::default()),
        }
    }

    /// Bus without a transport
    pub fn mock(config: PubSubConfig) -> Self {
        Self::new(config, None)
    }

    /// `pg_notify` on PostgreSQL, mock mode on SQLite
    pub fn for_backend(backend: &DatabaseBackend, config: PubSubConfig) -> Self {
        let transport: Option<Arc<dyn NotificationTransport>> = match backend {
            DatabaseBackend::Postgres(pool) => Some(Arc::new(PgNotifyTransport::new(pool.clone()))),
            DatabaseBackend::Sqlite(_) => None,
        };
        Self::new(config, transport)
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &PubSubConfig {
        &self.config
    }

    pub fn is_mock(&self) -> bool {
        self.transport.is_none()
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    pub fn set_reconnect_config(&self, config: ReconnectConfig) {
        *self.reconnect.lock() = config;
    }

    pub fn stats(&self) -> PubSubStats {
        PubSubStats {
            listener: self.stats.read().clone(),
            dispatch: self.pool.stats(),
        }
    }

    /// Wait for every handler task started so far to finish
    pub async fn wait_for_handlers(&self) {
        self.pool.wait_idle().await;
    }

    /// Register `handler` for payloads of type `P` arriving on `channel`.
    ///
    /// Handlers run on the bus's dispatch pool, never under the registry lock,
    /// so they may subscribe or unsubscribe themselves.
    pub fn subscribe<P, F, Fut>(&self, channel: &str, handler: F) -> Result<SubscriptionId>
    where
        P: NodeEnvelope,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        validate_channel_name(channel)?;

        let erased: ErasedHandler = Arc::new(move |value: Value| {
            let payload = serde_json::from_value::<P>(value)?;
            Ok(handler(payload).boxed())
        });

        let id = SubscriptionId::generate();
        let new_channel = {
            let mut registry = self.registry.lock();
            registry.subscriptions.insert(
                id.clone(),
                Subscription {
                    channel: channel.to_string(),
                    handler: erased,
                },
            );
            let ids = registry.by_channel.entry(channel.to_string()).or_default();
            ids.push(id.clone());
            ids.len() == 1
        };

        if new_channel {
            // A running listener picks the channel up without reconnecting
            self.channels_changed.notify_waiters();
        }

        debug!(channel = %channel, subscription_id = %id, "Subscribed");
        Ok(id)
    }

    /// Remove a subscription; unknown ids are ignored
    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        let mut registry = self.registry.lock();
        let Some(subscription) = registry.subscriptions.remove(id) else {
            return false;
        };
        if let Some(ids) = registry.by_channel.get_mut(&subscription.channel) {
            ids.retain(|existing| existing != id);
            if ids.is_empty() {
                registry.by_channel.remove(&subscription.channel);
            }
        }
        debug!(channel = %subscription.channel, subscription_id = %id, "Unsubscribed");
        true
    }

    /// Channels with at least one subscription
    pub fn subscribed_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.registry.lock().by_channel.keys().cloned().collect();
        channels.sort();
        channels
    }

    pub fn subscription_count(&self, channel: &str) -> usize {
        self.registry
            .lock()
            .by_channel
            .get(channel)
            .map_or(0, Vec::len)
    }

    /// Stamp `payload` with this node's id (and the current time if unset),
    /// then send it on `channel`.
    ///
    /// Oversized payloads fail with [`CoordinationError::PayloadTooLarge`]
    /// before anything is sent. In mock mode nothing is sent.
    #[instrument(skip(self, payload), fields(node_id = %self.node_id))]
    pub async fn publish<P: NodeEnvelope>(&self, channel: &str, mut payload: P) -> Result<()> {
        let Some(transport) = self.transport.as_ref() else {
            debug!(channel = %channel, "Mock mode, publish skipped");
            return Ok(());
        };

        validate_channel_name(channel)?;

        payload.set_node_id(self.node_id.clone());
        if payload.timestamp() == 0 {
            payload.set_timestamp(Utc::now().timestamp());
        }

        let body = serde_json::to_string(&payload)?;
        if body.len() > self.config.max_payload_size {
            return Err(CoordinationError::PayloadTooLarge {
                size: body.len(),
                limit: self.config.max_payload_size,
            });
        }

        transport.notify(channel, &body).await
    }

    pub async fn publish_record_change(
        &self,
        event: EventType,
        collection: &str,
        record_id: &str,
        data: Map<String, Value>,
    ) -> Result<()> {
        let payload = EventPayload::new(event)
            .with_collection(collection)
            .with_record_id(record_id)
            .with_data(data);
        self.publish(&self.config.record_changes_channel(), payload)
            .await
    }

    pub async fn publish_collection_change(&self, event: EventType, collection: &str) -> Result<()> {
        let payload = EventPayload::new(event).with_collection(collection);
        self.publish(&self.config.collection_changes_channel(), payload)
            .await
    }

    pub async fn publish_cache_invalidation(&self, collection: &str, record_id: &str) -> Result<()> {
        let payload = EventPayload::new(EventType::CacheInvalidate)
            .with_collection(collection)
            .with_record_id(record_id);
        self.publish(&self.config.cache_invalidation_channel(), payload)
            .await
    }

    /// Deliver `payload` as if it had arrived on `channel`
    pub async fn dispatch_local<P: NodeEnvelope>(&self, channel: &str, payload: &P) -> Result<()> {
        let value = serde_json::to_value(payload)?;
        self.dispatch_value(channel, value).await;
        Ok(())
    }

    /// Single delivery chokepoint: drop our own events, fan out the rest
    async fn dispatch_value(&self, channel: &str, value: Value) {
        let origin = value.get("node_id").and_then(Value::as_str);
        if origin == Some(self.node_id.as_str()) {
            self.pool.record_self_filtered();
            return;
        }

        let handlers: Vec<(SubscriptionId, ErasedHandler)> = {
            let registry = self.registry.lock();
            registry
                .by_channel
                .get(channel)
                .map(|ids| {
                    ids.iter()
                        .filter_map(|id| {
                            registry
                                .subscriptions
                                .get(id)
                                .map(|s| (id.clone(), Arc::clone(&s.handler)))
                        })
                        .collect()
                })
                .unwrap_or_default()
        };

        for (id, handler) in handlers {
            match handler(value.clone()) {
                Ok(task) => {
                    self.pool
                        .submit(format!("{channel}/{id}"), task.map(Ok))
                        .await;
                }
                Err(e) => {
                    self.record_parse_error();
                    warn!(
                        channel = %channel,
                        subscription_id = %id,
                        error = %e,
                        "Payload does not decode for subscriber"
                    );
                }
            }
        }
    }

    /// Listen until `cancel` fires or [`Self::stop_listening`] is called.
    ///
    /// Returns `Ok(())` immediately if already listening and `Ok(())` on
    /// shutdown. Connection failures are retried with the reconnect policy;
    /// exhausting it yields [`CoordinationError::ReconnectExhausted`].
    pub async fn start_listening(&self, cancel: &CancellationToken) -> Result<()> {
        if self.listening.swap(true, Ordering::SeqCst) {
            debug!("Listener already running");
            return Ok(());
        }
        let _guard = ListeningGuard(&self.listening);

        let stop = {
            let token = CancellationToken::new();
            *self.stop.lock() = token.clone();
            token
        };

        let Some(transport) = self.transport.clone() else {
            debug!("Mock mode, listener idles until shutdown");
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = stop.cancelled() => {}
            }
            return Ok(());
        };

        let result = self.listen_with_reconnect(transport.as_ref(), cancel, &stop).await;
        self.stats.write().connected = false;
        result
    }

    /// Ask a running listener to return
    pub fn stop_listening(&self) {
        if self.is_listening() {
            info!("Stopping pub/sub listener");
            self.stop.lock().cancel();
        }
    }

    async fn listen_with_reconnect(
        &self,
        transport: &dyn NotificationTransport,
        cancel: &CancellationToken,
        stop: &CancellationToken,
    ) -> Result<()> {
        let mut attempts: u32 = 0;

        loop {
            if cancel.is_cancelled() || stop.is_cancelled() {
                return Ok(());
            }

            let mut connected = false;
            let error = match self.listen_session(transport, cancel, stop, &mut connected).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if cancel.is_cancelled() || stop.is_cancelled() {
                return Ok(());
            }

            // A session that got going earns a fresh retry budget
            if connected {
                attempts = 0;
            }
            attempts += 1;
            {
                let mut stats = self.stats.write();
                stats.connected = false;
                stats.connection_errors += 1;
                stats.last_error_at = Some(Utc::now());
            }

            let policy = self.reconnect.lock().clone();
            if policy.is_exhausted(attempts) {
                error!(attempts, error = %error, "Listener reconnect limit reached");
                return Err(CoordinationError::ReconnectExhausted {
                    attempts,
                    last_error: Box::new(error),
                });
            }

            let delay = policy.delay_for(attempts);
            self.stats.write().reconnect_attempts += 1;
            warn!(
                attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Listener connection failed, reconnecting"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = stop.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn listen_session(
        &self,
        transport: &dyn NotificationTransport,
        cancel: &CancellationToken,
        stop: &CancellationToken,
        connected: &mut bool,
    ) -> Result<()> {
        let channels = self.subscribed_channels();
        let mut stream = transport.listen(&channels).await?;
        let mut listened: HashSet<String> = channels.into_iter().collect();

        *connected = true;
        {
            let mut stats = self.stats.write();
            stats.connected = true;
            stats.channels_listening = listened.len();
        }
        info!(
            node_id = %self.node_id,
            channels = listened.len(),
            transport = transport.name(),
            "📡 Listening for notifications"
        );

        loop {
            let changed = self.channels_changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            for channel in self.subscribed_channels() {
                if !listened.contains(&channel) {
                    stream.listen(&channel).await?;
                    debug!(channel = %channel, "LISTEN on newly subscribed channel");
                    listened.insert(channel);
                }
            }
            self.stats.write().channels_listening = listened.len();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = stop.cancelled() => return Ok(()),
                    _ = &mut changed => break,
                    received = stream.recv() => {
                        let notification = received?;
                        self.handle_notification(notification).await;
                    }
                }
            }
        }
    }

    async fn handle_notification(&self, notification: RawNotification) {
        {
            let mut stats = self.stats.write();
            stats.events_received += 1;
            stats.last_event_at = Some(Utc::now());
        }

        match serde_json::from_str::<Value>(&notification.payload) {
            Ok(value) => self.dispatch_value(&notification.channel, value).await,
            Err(e) => {
                self.record_parse_error();
                warn!(
                    channel = %notification.channel,
                    error = %e,
                    "Ignoring notification with invalid JSON payload"
                );
            }
        }
    }

    fn record_parse_error(&self) {
        let mut stats = self.stats.write();
        stats.parse_errors += 1;
        stats.last_error_at = Some(Utc::now());
    }
}
