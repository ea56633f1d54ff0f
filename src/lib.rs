#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLite in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # dbcoord
//!
//! Distributed coordination primitives for application nodes sharing one
//! relational database.
//!
//! ## Overview
//!
//! Several processes running the same application against one database need
//! to agree on who runs scheduled work, tell each other when cached data goes
//! stale, fan application hooks out across the fleet, retry conflicting writes
//! and lock individual rows. This crate provides those primitives over two
//! backends:
//!
//! - **PostgreSQL**: session advisory locks, `LISTEN`/`NOTIFY` and row locks
//! - **SQLite**: the embedded fallback, where locks and pub/sub degrade to
//!   in-process equivalents and row locks become plain reads serialized by the
//!   engine's single writer
//!
//! ## Module Organization
//!
//! - [`locks`] - Named advisory locks keyed by a 64-bit hash
//! - [`scheduler`] - At most one executor per cron task across the fleet
//! - [`pubsub`] - Cross-node event bus with self-origin filtering
//! - [`cache`] - Cache invalidation over the bus
//! - [`hooks`] - Local, broadcast and compete-mode hooks
//! - [`resilience`] - Retry classification and backoff
//! - [`row_lock`] - `FOR UPDATE` style helpers
//! - [`bootstrap`] - One wired instance of everything per process
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Structured error handling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dbcoord::bootstrap::CoordinationSystem;
//! use dbcoord::config::CoordinationConfig;
//! use dbcoord::hooks::HookMode;
//!
//! # async fn example() -> dbcoord::Result<()> {
//! dbcoord::logging::init_structured_logging();
//!
//! let system = CoordinationSystem::bootstrap(CoordinationConfig::default()).await?;
//! system.start();
//!
//! system.scheduler().register_task("nightly-export", "0 2 * * *", || async {
//!     // runs on one node only
//!     Ok(())
//! });
//! system.cache().on_invalidate("users", |record_id| async move {
//!     tracing::info!(%record_id, "dropping cached user");
//!     Ok(())
//! });
//! system
//!     .hooks()
//!     .register_hook("settings.reload", HookMode::Broadcast, |_data| async { Ok(()) });
//!
//! system
//!     .scheduler()
//!     .trigger_task("nightly-export", &system.shutdown_token())
//!     .await?;
//! system.cache().invalidate_record("users", "123").await?;
//!
//! system.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test                                  # Unit and SQLite tests
//! DATABASE_URL=postgres://... cargo test -- --ignored   # PostgreSQL tests
//! ```

pub mod bootstrap;
pub mod cache;
pub mod config;
pub mod constants;
pub mod database;
pub mod error;
pub mod hooks;
pub mod locks;
pub mod logging;
pub mod pubsub;
pub mod resilience;
pub mod row_lock;
pub mod scheduler;
pub mod utils;

pub use bootstrap::CoordinationSystem;
pub use config::{ConfigManager, CoordinationConfig};
pub use database::{BackendKind, DatabaseBackend};
pub use error::{CoordinationError, Result};
