//! Cross-node cache invalidation over the pub/sub bus.

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::config::CacheConfig;
use crate::constants::INVALIDATE_ALL_RECORDS;
use crate::error::{CoordinationError, Result};
use crate::pubsub::{DispatchPool, DispatchStats, EventPayload, EventType, PubSubManager};

/// Handler for one collection; receives the record id (`"*"` for all records)
pub type InvalidateHandler = Arc<dyn Fn(String) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Handler for every collection; receives `(collection, record_id)`
pub type InvalidateAllHandler =
    Arc<dyn Fn(String, String) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Default)]
struct Handlers {
    by_collection: HashMap<String, Vec<InvalidateHandler>>,
    global: Vec<InvalidateAllHandler>,
}

/// Shared between the invalidator and its bus subscription
struct Inner {
    handlers: RwLock<Handlers>,
    pool: DispatchPool,
}

impl Inner {
    async fn handle(&self, payload: EventPayload) {
        if payload.event != EventType::CacheInvalidate {
            debug!(event = %payload.event, "Ignoring non-invalidation event");
            return;
        }

        let (specific, global) = {
            let handlers = self.handlers.read();
            (
                handlers
                    .by_collection
                    .get(&payload.collection)
                    .cloned()
                    .unwrap_or_default(),
                handlers.global.clone(),
            )
        };

        debug!(
            collection = %payload.collection,
            record_id = %payload.record_id,
            origin = %payload.node_id,
            handlers = specific.len() + global.len(),
            "🧹 Remote cache invalidation"
        );

        for handler in specific {
            let task = handler(payload.record_id.clone());
            self.pool
                .submit(
                    format!("invalidate:{}", payload.collection),
                    task.map(|r| r.map_err(CoordinationError::from_handler)),
                )
                .await;
        }
        for handler in global {
            let task = handler(payload.collection.clone(), payload.record_id.clone());
            self.pool
                .submit(
                    "invalidate:*".to_string(),
                    task.map(|r| r.map_err(CoordinationError::from_handler)),
                )
                .await;
        }
    }
}

/// Publishes invalidations and runs local handlers for invalidations made on
/// other nodes.
///
/// Invalidations published by this node never reach its own handlers; the
/// caller clears its local cache directly.
pub struct CacheInvalidator {
    bus: Arc<PubSubManager>,
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CacheInvalidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handlers = self.inner.handlers.read();
        f.debug_struct("CacheInvalidator")
            .field("node_id", &self.bus.node_id())
            .field("collections", &handlers.by_collection.len())
            .field("global_handlers", &handlers.global.len())
            .finish()
    }
}

impl CacheInvalidator {
    pub fn new(bus: Arc<PubSubManager>, config: &CacheConfig) -> Self {
        Self {
            bus,
            inner: Arc::new(Inner {
                handlers: RwLock::new(Handlers::default()),
                pool: DispatchPool::new("cache", &config.dispatch),
            }),
        }
    }

    pub fn on_invalidate<F, Fut>(&self, collection: &str, handler: F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: InvalidateHandler = Arc::new(move |record_id| handler(record_id).boxed());
        self.inner
            .handlers
            .write()
            .by_collection
            .entry(collection.to_string())
            .or_default()
            .push(handler);
    }

    pub fn on_invalidate_all<F, Fut>(&self, handler: F)
    where
        F: Fn(String, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: InvalidateAllHandler =
            Arc::new(move |collection, record_id| handler(collection, record_id).boxed());
        self.inner.handlers.write().global.push(handler);
    }

    pub fn clear_handlers(&self) {
        let mut handlers = self.inner.handlers.write();
        handlers.by_collection.clear();
        handlers.global.clear();
    }

    /// Tell other nodes to drop `record_id` of `collection`
    #[instrument(skip(self))]
    pub async fn invalidate_record(&self, collection: &str, record_id: &str) -> Result<()> {
        if collection.is_empty() {
            return Err(CoordinationError::invalid_argument(
                "collection must not be empty",
            ));
        }
        self.bus
            .publish_cache_invalidation(collection, record_id)
            .await
    }

    /// One publish per id, in order; the first failure stops the batch
    pub async fn invalidate_records(&self, collection: &str, record_ids: &[&str]) -> Result<()> {
        for record_id in record_ids {
            self.invalidate_record(collection, record_id).await?;
        }
        Ok(())
    }

    /// Tell other nodes to drop everything cached for `collection`
    pub async fn invalidate_collection(&self, collection: &str) -> Result<()> {
        self.invalidate_record(collection, INVALIDATE_ALL_RECORDS)
            .await
    }

    /// Receive invalidations until `cancel` fires.
    ///
    /// Only subscribes; the bus's own listener must be running for remote
    /// events to arrive.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        let channel = self.bus.config().cache_invalidation_channel();
        let inner = Arc::clone(&self.inner);
        let subscription = self.bus.subscribe(&channel, move |payload: EventPayload| {
            let inner = Arc::clone(&inner);
            async move { inner.handle(payload).await }
        })?;
        info!(channel = %channel, "🧹 Cache invalidator started");

        cancel.cancelled().await;

        self.bus.unsubscribe(&subscription);
        info!(channel = %channel, "Cache invalidator stopped");
        Ok(())
    }

    /// Wait for every invalidation handler started so far to finish
    pub async fn wait_for_handlers(&self) {
        self.inner.pool.wait_idle().await;
    }

    pub fn stats(&self) -> DispatchStats {
        self.inner.pool.stats()
    }
}
