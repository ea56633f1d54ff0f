//! # Coordination Bootstrap
//!
//! Builds one instance of every coordination component per process and wires
//! them together:
//!
//! - the cache invalidator and hook manager share one pub/sub bus
//! - the cron scheduler and compete-mode hooks share one lock manager
//!
//! [`CoordinationSystem::start`] spawns the bus listener and the cache/hook
//! receivers; [`CoordinationSystem::shutdown`] cancels and joins them.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cache::CacheInvalidator;
use crate::config::{ConfigManager, CoordinationConfig};
use crate::database::DatabaseBackend;
use crate::error::Result;
use crate::hooks::DistributedHookManager;
use crate::locks::{lock_manager_for, AdvisoryLockManager};
use crate::pubsub::{NotificationTransport, PubSubManager};
use crate::row_lock::RowLocker;
use crate::scheduler::DistributedCronScheduler;

/// Snapshot of the running system
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub running: bool,
    pub backend: String,
    pub node_id: String,
    pub lock_backend: String,
    pub listening: bool,
    pub cron_tasks: usize,
    pub hooks: usize,
}

/// Every coordination component for one process
pub struct CoordinationSystem {
    config: CoordinationConfig,
    backend: DatabaseBackend,
    locks: Arc<dyn AdvisoryLockManager>,
    bus: Arc<PubSubManager>,
    scheduler: Arc<DistributedCronScheduler>,
    cache: Arc<CacheInvalidator>,
    hooks: Arc<DistributedHookManager>,
    row_locker: RowLocker,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<(&'static str, JoinHandle<Result<()>>)>>,
}

impl std::fmt::Debug for CoordinationSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinationSystem")
            .field("backend", &self.backend.kind())
            .field("node_id", &self.bus.node_id())
            .field("running", &self.is_running())
            .finish()
    }
}

impl CoordinationSystem {
    /// Validate `config`, connect to its database and wire every component
    pub async fn bootstrap(config: CoordinationConfig) -> Result<Self> {
        info!("🚀 BOOTSTRAP: Starting coordination system bootstrap");
        config.validate()?;

        let backend = DatabaseBackend::connect(&config.database).await?;
        let system = Self::from_backend(backend, config);

        info!(
            backend = %system.backend.kind(),
            node_id = %system.bus.node_id(),
            "🎉 BOOTSTRAP: Coordination system ready"
        );
        Ok(system)
    }

    /// [`Self::bootstrap`] with configuration from a loaded [`ConfigManager`]
    pub async fn bootstrap_from_manager(manager: &ConfigManager) -> Result<Self> {
        info!(
            environment = %manager.environment(),
            "✅ BOOTSTRAP: Configuration loaded"
        );
        Self::bootstrap(manager.config().clone()).await
    }

    /// Wire components over an existing backend, choosing the transport and
    /// lock manager the backend supports
    pub fn from_backend(backend: DatabaseBackend, config: CoordinationConfig) -> Self {
        let bus = Arc::new(PubSubManager::for_backend(&backend, config.pubsub.clone()));
        Self::assemble(backend, config, bus)
    }

    /// Wire components over an existing backend with an explicit transport.
    ///
    /// `None` gives a mock bus; an in-process hub links several systems inside
    /// one process.
    pub fn with_transport(
        backend: DatabaseBackend,
        config: CoordinationConfig,
        transport: Option<Arc<dyn NotificationTransport>>,
    ) -> Self {
        let bus = Arc::new(PubSubManager::new(config.pubsub.clone(), transport));
        Self::assemble(backend, config, bus)
    }

    fn assemble(backend: DatabaseBackend, config: CoordinationConfig, bus: Arc<PubSubManager>) -> Self {
        let locks = lock_manager_for(&backend, &config.locks);
        let scheduler = Arc::new(DistributedCronScheduler::new(Arc::clone(&locks)));
        let cache = Arc::new(CacheInvalidator::new(Arc::clone(&bus), &config.cache));
        let hooks = Arc::new(DistributedHookManager::new(
            Arc::clone(&bus),
            Some(Arc::clone(&locks)),
            &config.hooks,
        ));
        let row_locker = RowLocker::new(backend.clone());

        Self {
            config,
            backend,
            locks,
            bus,
            scheduler,
            cache,
            hooks,
            row_locker,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the bus listener and the cache and hook receivers.
    ///
    /// Calling it again while running does nothing.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            warn!("Coordination system already started");
            return;
        }

        let cancel = self.shutdown.child_token();

        let bus = Arc::clone(&self.bus);
        let listener_cancel = cancel.clone();
        tasks.push((
            "pubsub_listener",
            tokio::spawn(async move { bus.start_listening(&listener_cancel).await }),
        ));

        let cache = Arc::clone(&self.cache);
        let cache_cancel = cancel.clone();
        tasks.push((
            "cache_invalidator",
            tokio::spawn(async move { cache.start(&cache_cancel).await }),
        ));

        let hooks = Arc::clone(&self.hooks);
        let hooks_cancel = cancel;
        tasks.push((
            "hook_manager",
            tokio::spawn(async move { hooks.start(&hooks_cancel).await }),
        ));

        info!("✅ BOOTSTRAP: Listener, cache invalidator and hook manager started");
    }

    /// Cancelled by [`shutdown`](Self::shutdown); pass it to triggers that
    /// should stop with the system
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.lock().is_empty() && !self.shutdown.is_cancelled()
    }

    /// Cancel background work, wait for it, then close the database pool
    pub async fn shutdown(&self) {
        info!("🛑 Coordination system shutdown requested");
        self.shutdown.cancel();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for (name, handle) in tasks {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(component = name, error = %e, "❌ Component exited with error"),
                Err(e) => error!(component = name, error = %e, "❌ Component task failed"),
            }
        }

        self.bus.wait_for_handlers().await;
        self.cache.wait_for_handlers().await;
        self.backend.close().await;
        info!("✅ Coordination system stopped");
    }

    pub fn status(&self) -> SystemStatus {
        SystemStatus {
            running: self.is_running(),
            backend: self.backend.kind().to_string(),
            node_id: self.bus.node_id().to_string(),
            lock_backend: self.locks.backend_name().to_string(),
            listening: self.bus.is_listening(),
            cron_tasks: self.scheduler.list_tasks().len(),
            hooks: self.hooks.list_hooks().len(),
        }
    }

    pub fn config(&self) -> &CoordinationConfig {
        &self.config
    }

    pub fn backend(&self) -> &DatabaseBackend {
        &self.backend
    }

    pub fn locks(&self) -> &Arc<dyn AdvisoryLockManager> {
        &self.locks
    }

    pub fn pubsub(&self) -> &Arc<PubSubManager> {
        &self.bus
    }

    pub fn scheduler(&self) -> &Arc<DistributedCronScheduler> {
        &self.scheduler
    }

    pub fn cache(&self) -> &Arc<CacheInvalidator> {
        &self.cache
    }

    pub fn hooks(&self) -> &Arc<DistributedHookManager> {
        &self.hooks
    }

    pub fn row_locker(&self) -> &RowLocker {
        &self.row_locker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::BackendKind;

    #[tokio::test]
    async fn test_sqlite_bootstrap_wires_fallbacks() {
        let system = CoordinationSystem::bootstrap(CoordinationConfig::default())
            .await
            .unwrap();

        let status = system.status();
        assert_eq!(status.backend, BackendKind::Sqlite.to_string());
        assert_eq!(status.lock_backend, "in_process");
        assert!(!status.running);
        assert!(system.pubsub().is_mock());
        assert_eq!(system.row_locker().kind(), BackendKind::Sqlite);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let system = CoordinationSystem::bootstrap(CoordinationConfig::default())
            .await
            .unwrap();
        system.start();
        system.start();
        assert!(system.is_running());

        tokio::time::timeout(std::time::Duration::from_secs(2), system.shutdown())
            .await
            .unwrap();
        assert!(!system.is_running());
        assert!(!system.pubsub().is_listening());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected_before_connecting() {
        let mut config = CoordinationConfig::default();
        config.pubsub.max_payload_size = 0;
        assert!(CoordinationSystem::bootstrap(config).await.is_err());
    }
}
