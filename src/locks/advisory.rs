//! The advisory lock contract shared by the engine-backed and in-process managers.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Named mutual exclusion across nodes (engine-backed) or within one manager
/// instance (in-process).
///
/// Lock names are hashed with [`super::generate_lock_key`]. Failing to acquire
/// is not an error: `try_lock` reports `Ok(false)`.
#[async_trait]
pub trait AdvisoryLockManager: Send + Sync {
    /// Acquire `name` if free; never waits
    async fn try_lock(&self, name: &str) -> Result<bool>;

    /// Wait until `name` is acquired or `cancel` fires
    /// ([`crate::CoordinationError::Cancelled`])
    async fn lock(&self, name: &str, cancel: &CancellationToken) -> Result<()>;

    /// Release `name`; a lock this manager does not hold is a logged no-op
    async fn unlock(&self, name: &str) -> Result<()>;

    /// Release `name` regardless of which session holds it
    async fn force_unlock(&self, name: &str) -> Result<()>;

    /// Whether some holder currently has `name`.
    ///
    /// Probes by acquiring and immediately releasing, so the lock is held
    /// briefly by this manager. Called by the current holder it reports `true`
    /// and leaves the lock held.
    async fn is_locked(&self, name: &str) -> Result<bool> {
        if self.try_lock(name).await? {
            self.unlock(name).await?;
            Ok(false)
        } else {
            Ok(true)
        }
    }

    /// Short identifier for logs
    fn backend_name(&self) -> &'static str;
}
