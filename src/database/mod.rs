//! # Backend Handle
//!
//! One handle over the two supported engines. PostgreSQL exposes the full
//! coordination surface (advisory locks, LISTEN/NOTIFY, row locks); SQLite is
//! the embedded single-writer fallback where every coordination primitive
//! degrades to an in-process equivalent.
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use dbcoord::config::DatabaseConfig;
//! use dbcoord::database::DatabaseBackend;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = DatabaseBackend::connect(&DatabaseConfig::default()).await?;
//! assert!(!backend.kind().supports_advisory_locks());
//! assert!(backend.health_check().await?);
//! # Ok(())
//! # }
//! ```

use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::error::{CoordinationError, Result};

/// Engine family behind a [`DatabaseBackend`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Postgres,
    Sqlite,
}

impl BackendKind {
    /// Infer the engine from a connection URL
    pub fn from_url(url: &str) -> Result<Self> {
        let lowered = url.trim().to_ascii_lowercase();
        if lowered.starts_with("postgres://") || lowered.starts_with("postgresql://") {
            Ok(Self::Postgres)
        } else if lowered.starts_with("sqlite:") {
            Ok(Self::Sqlite)
        } else {
            Err(CoordinationError::config(format!(
                "unsupported database url scheme (expected postgres:// or sqlite:): {}",
                url.split("://").next().unwrap_or_default()
            )))
        }
    }

    pub fn supports_advisory_locks(self) -> bool {
        matches!(self, Self::Postgres)
    }

    pub fn supports_notifications(self) -> bool {
        matches!(self, Self::Postgres)
    }

    pub fn supports_row_locks(self) -> bool {
        matches!(self, Self::Postgres)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::Sqlite => "sqlite",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pooled connection to one of the supported engines
#[derive(Debug, Clone)]
pub enum DatabaseBackend {
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

impl DatabaseBackend {
    /// Open a pool for `config.url`
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let kind = BackendKind::from_url(&config.url)?;

        let backend = match kind {
            BackendKind::Postgres => {
                let pool = PgPoolOptions::new()
                    .max_connections(config.max_connections)
                    .acquire_timeout(config.acquire_timeout)
                    .connect(&config.url)
                    .await?;
                Self::Postgres(pool)
            }
            BackendKind::Sqlite => {
                // Writers queue on the busy timeout rather than failing fast
                let options = SqliteConnectOptions::from_str(&config.url)?
                    .create_if_missing(true)
                    .busy_timeout(config.acquire_timeout);
                // In-memory databases vanish with their last connection; keep one open
                let pool = SqlitePoolOptions::new()
                    .max_connections(config.max_connections)
                    .min_connections(1)
                    .acquire_timeout(config.acquire_timeout)
                    .idle_timeout(None)
                    .max_lifetime(None)
                    .connect_with(options)
                    .await?;
                Self::Sqlite(pool)
            }
        };

        info!(
            backend = %kind,
            url = %config.redacted_url(),
            max_connections = config.max_connections,
            "💾 Database backend connected"
        );

        Ok(backend)
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Self::Postgres(_) => BackendKind::Postgres,
            Self::Sqlite(_) => BackendKind::Sqlite,
        }
    }

    pub fn as_postgres(&self) -> Option<&PgPool> {
        match self {
            Self::Postgres(pool) => Some(pool),
            Self::Sqlite(_) => None,
        }
    }

    pub fn as_sqlite(&self) -> Option<&SqlitePool> {
        match self {
            Self::Sqlite(pool) => Some(pool),
            Self::Postgres(_) => None,
        }
    }

    pub async fn health_check(&self) -> Result<bool> {
        let health: i64 = match self {
            Self::Postgres(pool) => sqlx::query("SELECT 1::int8 AS health")
                .fetch_one(pool)
                .await?
                .try_get("health")?,
            Self::Sqlite(pool) => sqlx::query("SELECT 1 AS health")
                .fetch_one(pool)
                .await?
                .try_get("health")?,
        };
        Ok(health == 1)
    }

    pub async fn close(&self) {
        match self {
            Self::Postgres(pool) => pool.close().await,
            Self::Sqlite(pool) => pool.close().await,
        }
    }
}

impl From<PgPool> for DatabaseBackend {
    fn from(pool: PgPool) -> Self {
        Self::Postgres(pool)
    }
}

impl From<SqlitePool> for DatabaseBackend {
    fn from(pool: SqlitePool) -> Self {
        Self::Sqlite(pool)
    }
}
