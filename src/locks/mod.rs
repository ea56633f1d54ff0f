//! # Advisory Locks
//!
//! Named mutual exclusion keyed by a 64-bit hash of the lock name.
//!
//! - [`PgAdvisoryLockManager`]: PostgreSQL session locks, exclusive across every
//!   node sharing the database
//! - [`InProcessLockManager`]: the SQLite fallback, exclusive within one
//!   manager instance
//!
//! [`AdvisoryLockGuard`] releases its lock even when the owning future is
//! dropped. [`lock_manager_for`] picks the implementation matching a backend.

pub mod advisory;
pub mod guard;
pub mod in_process;
pub mod key;
pub mod postgres;

use std::sync::Arc;

pub use advisory::AdvisoryLockManager;
pub use guard::AdvisoryLockGuard;
pub use in_process::InProcessLockManager;
pub use key::generate_lock_key;
pub use postgres::PgAdvisoryLockManager;

use crate::config::LockConfig;
use crate::database::DatabaseBackend;

/// Engine-backed locks on PostgreSQL, in-process locks everywhere else
pub fn lock_manager_for(
    backend: &DatabaseBackend,
    config: &LockConfig,
) -> Arc<dyn AdvisoryLockManager> {
    match backend {
        DatabaseBackend::Postgres(pool) => Arc::new(PgAdvisoryLockManager::new(
            pool.clone(),
            config.poll_interval,
        )),
        DatabaseBackend::Sqlite(_) => Arc::new(InProcessLockManager::new()),
    }
}
