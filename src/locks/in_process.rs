//! In-process advisory locks for backends without engine-level locking.
//!
//! Exclusion holds only among callers sharing one manager instance. Waiters
//! park on a [`Notify`] and are woken by every release.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use super::advisory::AdvisoryLockManager;
use super::key::generate_lock_key;
use crate::error::{CoordinationError, Result};
use crate::logging::log_lock_operation;

#[derive(Debug, Default)]
pub struct InProcessLockManager {
    held: Mutex<HashMap<i64, String>>,
    released: Notify,
}

impl InProcessLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the locks currently held through this manager
    pub fn held_lock_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.held.lock().values().cloned().collect();
        names.sort();
        names
    }

    fn acquire(&self, name: &str) -> bool {
        let key = generate_lock_key(name);
        let mut held = self.held.lock();
        if held.contains_key(&key) {
            return false;
        }
        held.insert(key, name.to_string());
        true
    }

    fn release(&self, name: &str) -> bool {
        let key = generate_lock_key(name);
        let removed = self.held.lock().remove(&key).is_some();
        if removed {
            self.released.notify_waiters();
        }
        removed
    }
}

#[async_trait]
impl AdvisoryLockManager for InProcessLockManager {
    async fn try_lock(&self, name: &str) -> Result<bool> {
        let acquired = self.acquire(name);
        log_lock_operation(
            "try_lock",
            name,
            generate_lock_key(name),
            if acquired { "acquired" } else { "contended" },
        );
        Ok(acquired)
    }

    #[instrument(skip(self, cancel), level = "debug")]
    async fn lock(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(CoordinationError::Cancelled);
            }

            // Register for the wake-up before checking so a release in between is not missed
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.acquire(name) {
                log_lock_operation("lock", name, generate_lock_key(name), "acquired");
                return Ok(());
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(CoordinationError::Cancelled),
                _ = &mut notified => {}
            }
        }
    }

    async fn unlock(&self, name: &str) -> Result<()> {
        if self.release(name) {
            log_lock_operation("unlock", name, generate_lock_key(name), "released");
        } else {
            warn!(lock_name = %name, "Unlock of in-process lock not held by this manager");
        }
        Ok(())
    }

    async fn force_unlock(&self, name: &str) -> Result<()> {
        if self.release(name) {
            log_lock_operation("force_unlock", name, generate_lock_key(name), "released");
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "in_process"
    }
}
