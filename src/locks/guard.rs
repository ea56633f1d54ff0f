//! Scoped ownership of an advisory lock.

use std::sync::Arc;
use tracing::{error, warn};

use super::advisory::AdvisoryLockManager;
use crate::error::Result;

/// A lock taken through [`AdvisoryLockGuard::try_acquire`].
///
/// Call [`release`](Self::release) on the normal path. If the guard is
/// dropped instead, for example because the future holding it was cancelled,
/// the unlock is spawned onto the current runtime.
#[must_use = "dropping the guard releases the lock"]
pub struct AdvisoryLockGuard {
    locks: Arc<dyn AdvisoryLockManager>,
    name: String,
    armed: bool,
}

impl std::fmt::Debug for AdvisoryLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdvisoryLockGuard")
            .field("name", &self.name)
            .field("lock_backend", &self.locks.backend_name())
            .field("armed", &self.armed)
            .finish()
    }
}

impl AdvisoryLockGuard {
    /// `Ok(None)` when another holder has `name`
    pub async fn try_acquire(
        locks: &Arc<dyn AdvisoryLockManager>,
        name: &str,
    ) -> Result<Option<Self>> {
        if !locks.try_lock(name).await? {
            return Ok(None);
        }
        Ok(Some(Self {
            locks: Arc::clone(locks),
            name: name.to_string(),
            armed: true,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Unlock now and report the outcome
    pub async fn release(mut self) -> Result<()> {
        self.armed = false;
        let locks = Arc::clone(&self.locks);
        let name = std::mem::take(&mut self.name);
        locks.unlock(&name).await
    }
}

impl Drop for AdvisoryLockGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let locks = Arc::clone(&self.locks);
        let name = std::mem::take(&mut self.name);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(lock_name = %name, "Lock guard dropped before release, unlocking in background");
                handle.spawn(async move {
                    if let Err(e) = locks.unlock(&name).await {
                        error!(lock_name = %name, error = %e, "Background unlock failed");
                    }
                });
            }
            Err(_) => {
                error!(lock_name = %name, "Lock guard dropped outside a runtime, lock left held");
            }
        }
    }
}
