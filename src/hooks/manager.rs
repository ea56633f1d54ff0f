//! Named hooks executed locally, on every node, or on exactly one node.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::HookConfig;
use crate::constants::lock_prefixes;
use crate::error::{CoordinationError, Result};
use crate::locks::{AdvisoryLockGuard, AdvisoryLockManager};
use crate::logging::log_handler_failure;
use crate::pubsub::{HookMode, HookPayload, PubSubManager};
use crate::resilience::HookRetryConfig;
use crate::utils::panic::catch_handler_panic;

/// Type-erased hook body; receives the trigger's data
pub type HookHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Debug, Default)]
struct HookState {
    last_triggered: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

struct HookRegistration {
    name: String,
    mode: HookMode,
    handler: HookHandler,
    state: Mutex<HookState>,
}

impl HookRegistration {
    async fn invoke(&self, data: Value) -> Result<()> {
        let handler = Arc::clone(&self.handler);
        catch_handler_panic(&self.name, async move {
            handler(data).await.map_err(CoordinationError::from_handler)
        })
        .await
    }

    fn mark_triggered(&self) {
        self.state.lock().last_triggered = Some(Utc::now());
    }

    fn record(&self, outcome: &Result<()>) {
        self.state.lock().last_error = outcome.as_ref().err().map(ToString::to_string);
    }

    fn status(&self) -> HookStatus {
        let state = self.state.lock();
        HookStatus {
            name: self.name.clone(),
            mode: self.mode,
            last_triggered: state.last_triggered,
            last_error: state.last_error.clone(),
        }
    }

    /// Run a hook announced by another node
    async fn run_remote(&self, data: Value, timeout: Duration) {
        self.mark_triggered();
        let outcome = match tokio::time::timeout(timeout, self.invoke(data)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(CoordinationError::HookTimeout {
                name: self.name.clone(),
                timeout,
            }),
        };
        self.record(&outcome);
        if let Err(ref e) = outcome {
            log_handler_failure("hooks", &self.name, e);
        }
    }
}

/// Snapshot of a registered hook
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HookStatus {
    pub name: String,
    pub mode: HookMode,
    pub last_triggered: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Registry and dispatcher for [`HookMode`] hooks.
///
/// * `Local` runs on the triggering node.
/// * `Broadcast` runs on the triggering node and, if that succeeds, on every
///   other node receiving the hook channel.
/// * `Compete` runs on whichever node wins the hook's advisory lock. Without
///   a lock manager it runs locally.
pub struct DistributedHookManager {
    bus: Arc<PubSubManager>,
    locks: Option<Arc<dyn AdvisoryLockManager>>,
    hooks: Arc<DashMap<String, Arc<HookRegistration>>>,
    retry: Mutex<HookRetryConfig>,
    broadcast_timeout: Duration,
}

impl std::fmt::Debug for DistributedHookManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedHookManager")
            .field("node_id", &self.bus.node_id())
            .field("hooks", &self.hooks.len())
            .field(
                "lock_backend",
                &self.locks.as_ref().map(|locks| locks.backend_name()),
            )
            .finish()
    }
}

impl DistributedHookManager {
    pub fn new(
        bus: Arc<PubSubManager>,
        locks: Option<Arc<dyn AdvisoryLockManager>>,
        config: &HookConfig,
    ) -> Self {
        Self {
            bus,
            locks,
            hooks: Arc::new(DashMap::new()),
            retry: Mutex::new(config.retry.clone()),
            broadcast_timeout: config.broadcast_timeout,
        }
    }

    /// Lock name guarding a compete-mode hook
    pub fn lock_name(hook: &str) -> String {
        format!("{}{hook}", lock_prefixes::HOOK)
    }

    /// Register (or replace) a hook
    pub fn register_hook<F, Fut>(&self, name: &str, mode: HookMode, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let registration = HookRegistration {
            name: name.to_string(),
            mode,
            handler: Arc::new(move |data| handler(data).boxed()),
            state: Mutex::new(HookState::default()),
        };
        self.hooks.insert(name.to_string(), Arc::new(registration));
        info!(hook = %name, mode = %mode, "🪝 Hook registered");
    }

    pub fn unregister_hook(&self, name: &str) -> bool {
        self.hooks.remove(name).is_some()
    }

    pub fn set_retry_config(&self, config: HookRetryConfig) {
        *self.retry.lock() = config;
    }

    pub fn hook_status(&self, name: &str) -> Option<HookStatus> {
        self.hooks.get(name).map(|entry| entry.value().status())
    }

    /// All registered hooks, sorted by name
    pub fn list_hooks(&self) -> Vec<HookStatus> {
        let mut hooks: Vec<HookStatus> = self
            .hooks
            .iter()
            .map(|entry| entry.value().status())
            .collect();
        hooks.sort_by(|a, b| a.name.cmp(&b.name));
        hooks
    }

    /// Fire `name` according to its mode
    #[instrument(skip(self, data))]
    pub async fn trigger_hook(&self, name: &str, data: Value) -> Result<()> {
        let registration = self
            .hooks
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| CoordinationError::HookNotFound {
                name: name.to_string(),
            })?;

        registration.mark_triggered();
        let outcome = match registration.mode {
            HookMode::Local => registration.invoke(data).await,
            HookMode::Broadcast => self.trigger_broadcast(&registration, data).await,
            HookMode::Compete => self.trigger_compete(&registration, data).await,
        };
        registration.record(&outcome);

        if let Err(ref e) = outcome {
            log_handler_failure("hooks", name, e);
        }
        outcome
    }

    async fn trigger_broadcast(&self, registration: &HookRegistration, data: Value) -> Result<()> {
        registration.invoke(data.clone()).await?;

        let payload = HookPayload::broadcast(registration.name.as_str(), data);
        self.bus
            .publish(&self.bus.config().hook_events_channel(), payload)
            .await?;
        debug!(hook = %registration.name, "📣 Hook broadcast published");
        Ok(())
    }

    async fn trigger_compete(&self, registration: &HookRegistration, data: Value) -> Result<()> {
        let Some(locks) = self.locks.as_ref() else {
            warn!(
                hook = %registration.name,
                "No lock manager attached, compete hook running locally"
            );
            return registration.invoke(data).await;
        };

        let lock_name = Self::lock_name(&registration.name);
        let Some(lock) = AdvisoryLockGuard::try_acquire(locks, &lock_name).await? else {
            debug!(hook = %registration.name, "Compete hook claimed by another node");
            return Ok(());
        };

        // Dropped mid-run, the guard unlocks in the background
        let outcome = registration.invoke(data).await;
        if let Err(e) = lock.release().await {
            error!(lock_name = %lock_name, error = %e, "Failed to release hook lock");
        }
        outcome
    }

    /// [`Self::trigger_hook`], retrying while the hook returns
    /// [`CoordinationError::Retryable`].
    ///
    /// Makes at most `max_retries + 1` attempts. Any other error is returned
    /// as-is; cancellation during a wait yields [`CoordinationError::Cancelled`].
    pub async fn trigger_hook_with_retry(
        &self,
        name: &str,
        data: Value,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let policy = self.retry.lock().clone();
        let mut attempts: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(CoordinationError::Cancelled);
            }
            attempts += 1;

            let error = match self.trigger_hook(name, data.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable_marker() => e,
                Err(e) => return Err(e),
            };

            if attempts > policy.max_retries {
                return Err(CoordinationError::RetriesExhausted {
                    attempts,
                    last_error: Box::new(error),
                });
            }

            let delay = policy.delay_for(attempts - 1);
            debug!(
                hook = %name,
                attempts,
                delay_ms = delay.as_millis() as u64,
                "Retryable hook failure, backing off"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(CoordinationError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Run broadcast hooks announced by other nodes until `cancel` fires.
    ///
    /// Only subscribes; the bus's own listener must be running for remote
    /// announcements to arrive.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        let channel = self.bus.config().hook_events_channel();
        let hooks = Arc::clone(&self.hooks);
        let timeout = self.broadcast_timeout;

        let subscription = self.bus.subscribe(&channel, move |payload: HookPayload| {
            let hooks = Arc::clone(&hooks);
            async move {
                if payload.mode != HookMode::Broadcast {
                    debug!(hook = %payload.event_name, mode = %payload.mode, "Ignoring non-broadcast hook event");
                    return;
                }
                let Some(registration) = hooks
                    .get(&payload.event_name)
                    .map(|entry| Arc::clone(entry.value()))
                else {
                    debug!(hook = %payload.event_name, "Broadcast for unregistered hook ignored");
                    return;
                };
                if registration.mode != HookMode::Broadcast {
                    debug!(hook = %payload.event_name, "Local hook is not broadcast, ignoring");
                    return;
                }
                debug!(hook = %payload.event_name, origin = %payload.node_id, "📣 Running remote hook");
                registration.run_remote(payload.data, timeout).await;
            }
        })?;
        info!(channel = %channel, "🪝 Hook manager started");

        cancel.cancelled().await;

        self.bus.unsubscribe(&subscription);
        info!(channel = %channel, "Hook manager stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PubSubConfig;
    use crate::locks::InProcessLockManager;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager(locks: Option<Arc<dyn AdvisoryLockManager>>) -> (Arc<PubSubManager>, DistributedHookManager) {
        let bus = Arc::new(PubSubManager::mock(PubSubConfig::default()));
        let hooks = DistributedHookManager::new(bus.clone(), locks, &HookConfig::default());
        (bus, hooks)
    }

    fn counting(hits: &Arc<AtomicUsize>) -> impl Fn(Value) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync + 'static {
        let hits = hits.clone();
        move |_| {
            let hits = hits.clone();
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_unknown_hook_is_an_error() {
        let (_, hooks) = manager(None);
        assert!(matches!(
            hooks.trigger_hook("nope", Value::Null).await,
            Err(CoordinationError::HookNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_local_hook_runs_and_records_status() {
        let (_, hooks) = manager(None);
        hooks.register_hook("audit", HookMode::Local, |data| async move {
            anyhow::ensure!(data["ok"] == json!(true), "bad payload");
            Ok(())
        });

        hooks.trigger_hook("audit", json!({"ok": true})).await.unwrap();
        let status = hooks.hook_status("audit").unwrap();
        assert!(status.last_triggered.is_some());
        assert!(status.last_error.is_none());

        let err = hooks.trigger_hook("audit", json!({"ok": false})).await.unwrap_err();
        assert!(err.to_string().contains("bad payload"));
        assert!(hooks.hook_status("audit").unwrap().last_error.is_some());
    }

    #[tokio::test]
    async fn test_broadcast_failure_skips_publish() {
        let (_, hooks) = manager(None);
        hooks.register_hook("notify", HookMode::Broadcast, |_| async {
            anyhow::bail!("local failure")
        });
        let err = hooks.trigger_hook("notify", Value::Null).await.unwrap_err();
        assert!(matches!(err, CoordinationError::Handler(_)));
    }

    #[tokio::test]
    async fn test_compete_hook_skips_when_lock_taken() {
        let locks = Arc::new(InProcessLockManager::new());
        let (_, hooks) = manager(Some(locks.clone()));
        let hits = Arc::new(AtomicUsize::new(0));
        hooks.register_hook("rebuild-index", HookMode::Compete, counting(&hits));

        hooks.trigger_hook("rebuild-index", Value::Null).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(locks.held_lock_names().is_empty());

        assert!(locks.try_lock("hook:rebuild-index").await.unwrap());
        hooks.trigger_hook("rebuild-index", Value::Null).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dropped_compete_trigger_releases_lock() {
        let locks = Arc::new(InProcessLockManager::new());
        let (_, hooks) = manager(Some(locks.clone()));
        let hits = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(tokio::sync::Notify::new());
        {
            let hits = hits.clone();
            let gate = gate.clone();
            hooks.register_hook("reindex", HookMode::Compete, move |_| {
                let hits = hits.clone();
                let gate = gate.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    gate.notified().await;
                    Ok(())
                }
            });
        }

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            hooks.trigger_hook("reindex", Value::Null),
        )
        .await;
        assert!(abandoned.is_err());

        for _ in 0..50 {
            if locks.held_lock_names().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(locks.held_lock_names().is_empty());

        gate.notify_one();
        hooks.trigger_hook("reindex", Value::Null).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(locks.held_lock_names().is_empty());
    }

    #[tokio::test]
    async fn test_compete_without_locks_runs_locally() {
        let (_, hooks) = manager(None);
        let hits = Arc::new(AtomicUsize::new(0));
        hooks.register_hook("solo", HookMode::Compete, counting(&hits));
        hooks.trigger_hook("solo", Value::Null).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let (_, hooks) = manager(None);
        hooks.set_retry_config(HookRetryConfig {
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
        });
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let calls = calls.clone();
            hooks.register_hook("warmup", HookMode::Local, move |_| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        return Err(anyhow::Error::new(CoordinationError::retryable("not ready")));
                    }
                    Ok(())
                }
            });
        }

        let cancel = CancellationToken::new();
        hooks
            .trigger_hook_with_retry("warmup", Value::Null, &cancel)
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_and_permanent_errors() {
        let (_, hooks) = manager(None);
        hooks.set_retry_config(HookRetryConfig {
            max_retries: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 2.0,
        });
        hooks.register_hook("always-busy", HookMode::Local, |_| async {
            Err(anyhow::Error::new(CoordinationError::retryable("busy")))
        });
        hooks.register_hook("broken", HookMode::Local, |_| async { anyhow::bail!("fatal") });

        let cancel = CancellationToken::new();
        match hooks
            .trigger_hook_with_retry("always-busy", Value::Null, &cancel)
            .await
        {
            Err(CoordinationError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected exhaustion, got {other:?}"),
        }

        assert!(matches!(
            hooks
                .trigger_hook_with_retry("broken", Value::Null, &cancel)
                .await,
            Err(CoordinationError::Handler(_))
        ));
    }

    #[tokio::test]
    async fn test_retry_cancelled_during_backoff() {
        let (_, hooks) = manager(None);
        hooks.set_retry_config(HookRetryConfig {
            max_retries: 5,
            initial_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
        });
        hooks.register_hook("slow", HookMode::Local, |_| async {
            Err(anyhow::Error::new(CoordinationError::retryable("busy")))
        });

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            hooks.trigger_hook_with_retry("slow", Value::Null, &cancel),
        )
        .await
        .unwrap();
        assert!(matches!(result, Err(CoordinationError::Cancelled)));
    }

    #[tokio::test]
    async fn test_remote_broadcast_runs_handler() {
        let (bus, hooks) = manager(None);
        let hooks = Arc::new(hooks);
        let hits = Arc::new(AtomicUsize::new(0));
        hooks.register_hook("reload-config", HookMode::Broadcast, counting(&hits));

        let cancel = CancellationToken::new();
        let running = {
            let hooks = hooks.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { hooks.start(&cancel).await })
        };
        let channel = bus.config().hook_events_channel();
        tokio::time::timeout(Duration::from_secs(1), async {
            while bus.subscription_count(&channel) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let mut remote = HookPayload::broadcast("reload-config", json!({"section": "cache"}));
        remote.node_id = "other-node-fedcba9876543210".to_string();
        bus.dispatch_local(&channel, &remote).await.unwrap();
        bus.wait_for_handlers().await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(hooks.hook_status("reload-config").unwrap().last_triggered.is_some());

        cancel.cancel();
        running.await.unwrap().unwrap();
    }
}
