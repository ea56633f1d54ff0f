//! PostgreSQL session-scoped advisory locks.
//!
//! A session lock belongs to the connection that took it, so every held lock
//! pins its pooled connection until `unlock` runs on that same connection.

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::pool::PoolConnection;
use sqlx::{Connection, PgConnection, PgPool, Postgres};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::advisory::AdvisoryLockManager;
use super::key::{generate_lock_key, split_key};
use crate::error::{CoordinationError, Result};
use crate::logging::log_lock_operation;

/// Connection pinned to an advisory lock (or to a lock attempt in flight).
///
/// Dropped while pinned, the session is closed instead of returned to the
/// pool, so the server releases whatever it holds.
struct HeldLock {
    name: String,
    conn: Option<PoolConnection<Postgres>>,
}

impl HeldLock {
    fn new(name: &str, conn: PoolConnection<Postgres>) -> Self {
        Self {
            name: name.to_string(),
            conn: Some(conn),
        }
    }

    fn session(&mut self) -> Result<&mut PgConnection> {
        // `conn` is only taken by the consuming methods below and by Drop
        self.conn
            .as_deref_mut()
            .ok_or(CoordinationError::Database(sqlx::Error::PoolClosed))
    }

    /// Session holds no lock any more; hand it back to the pool
    fn unpin(mut self) {
        drop(self.conn.take());
    }

    async fn close(mut self) {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = conn.detach().close().await {
                debug!(error = %e, "Closing pinned connection failed");
            }
        }
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            debug!(lock_name = %self.name, "Dropping pinned advisory lock session");
            drop(conn.detach());
        }
    }
}

/// Advisory locks backed by `pg_try_advisory_lock` / `pg_advisory_unlock`
pub struct PgAdvisoryLockManager {
    pool: PgPool,
    poll_interval: Duration,
    held: Mutex<HashMap<i64, HeldLock>>,
}

impl std::fmt::Debug for PgAdvisoryLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgAdvisoryLockManager")
            .field("poll_interval", &self.poll_interval)
            .field("held", &self.held_lock_names())
            .finish()
    }
}

impl PgAdvisoryLockManager {
    pub fn new(pool: PgPool, poll_interval: Duration) -> Self {
        Self {
            pool,
            poll_interval,
            held: Mutex::new(HashMap::new()),
        }
    }

    /// Names of the locks this manager currently holds
    pub fn held_lock_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.held.lock().values().map(|h| h.name.clone()).collect();
        names.sort();
        names
    }

    /// Release every lock this manager holds
    pub async fn release_all(&self) -> Result<()> {
        let drained: Vec<(i64, HeldLock)> = self.held.lock().drain().collect();
        let mut first_error = None;
        for (key, held) in drained {
            if let Err(e) = Self::release_on(key, held).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn release_on(key: i64, mut held: HeldLock) -> Result<()> {
        let released = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(key)
            .fetch_one(held.session()?)
            .await;

        match released {
            Ok(true) => {
                log_lock_operation("unlock", &held.name, key, "released");
                held.unpin();
                Ok(())
            }
            Ok(false) => {
                warn!(
                    lock_name = %held.name,
                    lock_key = key,
                    "Session no longer held advisory lock at unlock"
                );
                held.unpin();
                Ok(())
            }
            Err(e) => {
                // Ending the session releases whatever it still holds
                warn!(
                    lock_name = %held.name,
                    lock_key = key,
                    error = %e,
                    "Advisory unlock failed, closing pinned connection"
                );
                held.close().await;
                Err(CoordinationError::Database(e))
            }
        }
    }
}

#[async_trait]
impl AdvisoryLockManager for PgAdvisoryLockManager {
    #[instrument(skip(self), level = "debug")]
    async fn try_lock(&self, name: &str) -> Result<bool> {
        let key = generate_lock_key(name);

        // Session locks are re-entrant; this manager's own holdings are not
        if self.held.lock().contains_key(&key) {
            log_lock_operation("try_lock", name, key, "held_by_self");
            return Ok(false);
        }

        // Pinned before the query: if this future is dropped mid-flight the
        // session closes rather than returning a locked connection to the pool
        let mut session = HeldLock::new(name, self.pool.acquire().await?);
        let acquired = sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(session.session()?)
            .await?;

        if acquired {
            self.held.lock().insert(key, session);
            log_lock_operation("try_lock", name, key, "acquired");
        } else {
            session.unpin();
            log_lock_operation("try_lock", name, key, "contended");
        }

        Ok(acquired)
    }

    #[instrument(skip(self, cancel), level = "debug")]
    async fn lock(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(CoordinationError::Cancelled);
            }
            if self.try_lock(name).await? {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(CoordinationError::Cancelled),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn unlock(&self, name: &str) -> Result<()> {
        let key = generate_lock_key(name);
        let Some(held) = self.held.lock().remove(&key) else {
            warn!(lock_name = %name, lock_key = key, "Unlock of advisory lock not held by this manager");
            return Ok(());
        };
        Self::release_on(key, held).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn force_unlock(&self, name: &str) -> Result<()> {
        let key = generate_lock_key(name);
        let local = self.held.lock().remove(&key);
        if let Some(held) = local {
            return Self::release_on(key, held).await;
        }

        let (classid, objid) = split_key(key);
        let terminated: Vec<bool> = sqlx::query_scalar(
            "SELECT pg_terminate_backend(pid) FROM pg_locks \
             WHERE locktype = 'advisory' AND classid::int8 = $1 AND objid::int8 = $2 \
             AND objsubid = 1 AND granted AND pid <> pg_backend_pid()",
        )
        .bind(i64::from(classid))
        .bind(i64::from(objid))
        .fetch_all(&self.pool)
        .await?;

        let count = terminated.into_iter().filter(|t| *t).count();
        warn!(
            lock_name = %name,
            lock_key = key,
            terminated_sessions = count,
            "Force-unlocked advisory lock held by another session"
        );
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

impl Drop for PgAdvisoryLockManager {
    fn drop(&mut self) {
        for (_, held) in self.held.get_mut().drain() {
            warn!(lock_name = %held.name, "Advisory lock still held at shutdown, dropping its session");
            drop(held);
        }
    }
}
