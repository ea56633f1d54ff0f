//! # Resilience Module
//!
//! Conflict-retry policy for every component of the coordination layer and for
//! external callers (job dispatchers, flush pipelines) that need the same
//! classification.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use dbcoord::resilience::{retry_with_backoff, RetryConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
//! let cancel = CancellationToken::new();
//! let rows = retry_with_backoff(&RetryConfig::default(), &cancel, |_attempt| {
//!     let pool = pool.clone();
//!     async move {
//!         sqlx::query("UPDATE jobs SET state = 'claimed' WHERE state = 'ready'")
//!             .execute(&pool)
//!             .await
//!             .map(|done| done.rows_affected())
//!     }
//! })
//! .await?;
//! # let _ = rows;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod classifier;

pub use backoff::{retry_with_backoff, HookRetryConfig, ReconnectConfig, RetryConfig, RetryError};
pub use classifier::{
    classify_error, classify_message, is_deadlock_error, is_lock_timeout_error,
    is_retryable_error, is_retryable_result, is_serialization_error, ErrorClass, PgErrorCode,
};
