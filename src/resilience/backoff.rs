//! # Backoff Policies
//!
//! Exponential-with-cap delay calculation shared by the retry helper, the
//! listener reconnect loop and hook retries, plus [`retry_with_backoff`], the
//! generic conflict-retry driver external callers reuse instead of
//! re-implementing classification.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{CoordinationError, Result};
use crate::resilience::classifier::is_retryable_error;
use crate::utils::serde::duration_millis;

/// `initial * multiplier^(attempt-1)`, clamped at `max`; attempt <= 1 yields `initial`
fn exponential_delay(initial: Duration, max: Duration, multiplier: f64, attempt: u32) -> Duration {
    let multiplier = if multiplier.is_finite() && multiplier >= 1.0 {
        multiplier
    } else {
        1.0
    };

    let mut delay = initial;
    for _ in 1..attempt {
        delay = match Duration::try_from_secs_f64(delay.as_secs_f64() * multiplier) {
            Ok(next) => next,
            Err(_) => return max,
        };
        if delay >= max {
            return max;
        }
    }
    delay
}

fn validate_policy(
    section: &str,
    initial: Duration,
    max: Duration,
    multiplier: f64,
) -> Result<()> {
    if initial.is_zero() {
        return Err(CoordinationError::config(format!(
            "{section}: initial delay must be greater than 0"
        )));
    }
    if max < initial {
        return Err(CoordinationError::config(format!(
            "{section}: max delay must be >= initial delay"
        )));
    }
    if !multiplier.is_finite() || multiplier < 1.0 {
        return Err(CoordinationError::config(format!(
            "{section}: multiplier must be a finite value >= 1.0"
        )));
    }
    Ok(())
}

/// Retry policy for transient backend conflicts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    #[serde(with = "duration_millis")]
    pub initial_backoff: Duration,
    #[serde(with = "duration_millis")]
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Extra random delay as a fraction of the computed backoff (0.0 disables jitter)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }
}

impl RetryConfig {
    /// Deterministic backoff before retrying after `attempt` (1-based) failed
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        exponential_delay(
            self.initial_backoff,
            self.max_backoff,
            self.backoff_multiplier,
            attempt,
        )
    }

    /// [`Self::backoff_for`] plus up to `jitter_factor` random extra, still clamped
    pub fn jittered_backoff(&self, attempt: u32) -> Duration {
        let delay = self.backoff_for(attempt);
        if self.jitter_factor <= 0.0 || !self.jitter_factor.is_finite() {
            return delay;
        }
        let jitter = fastrand::f64() * self.jitter_factor;
        delay.mul_f64(1.0 + jitter).min(self.max_backoff)
    }

    pub fn validate(&self) -> Result<()> {
        validate_policy(
            "retry",
            self.initial_backoff,
            self.max_backoff,
            self.backoff_multiplier,
        )?;
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(CoordinationError::config(
                "retry: jitter_factor must be within 0.0..=1.0",
            ));
        }
        Ok(())
    }
}

/// Listener reconnect policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Failed connection attempts tolerated; 0 retries forever
    pub max_retries: u32,
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl ReconnectConfig {
    /// Delay before reconnect attempt `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        exponential_delay(self.initial_delay, self.max_delay, self.multiplier, attempt)
    }

    /// Whether `attempts` failures exhaust the policy
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        self.max_retries > 0 && attempts >= self.max_retries
    }

    pub fn validate(&self) -> Result<()> {
        validate_policy(
            "reconnect",
            self.initial_delay,
            self.max_delay,
            self.multiplier,
        )
    }
}

/// Retry policy for hooks returning [`CoordinationError::Retryable`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HookRetryConfig {
    pub max_retries: u32,
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,
    #[serde(with = "duration_millis")]
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for HookRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
        }
    }
}

impl HookRetryConfig {
    /// `initial_delay * multiplier^retry`, capped; `retry` is 0 for the first wait
    pub fn delay_for(&self, retry: u32) -> Duration {
        exponential_delay(
            self.initial_delay,
            self.max_delay,
            self.multiplier,
            retry.saturating_add(1),
        )
    }

    pub fn validate(&self) -> Result<()> {
        validate_policy(
            "hooks.retry",
            self.initial_delay,
            self.max_delay,
            self.multiplier,
        )
    }
}

/// Outcome of a failed [`retry_with_backoff`] run
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// The operation's own error: permanent, or the last transient one
    #[error("Operation failed: {0}")]
    Operation(E),

    /// Cancellation was observed before or between attempts
    #[error("Retry cancelled")]
    Cancelled,
}

impl<E> RetryError<E> {
    /// The operation error, if any
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Operation(e) => Some(e),
            RetryError::Cancelled => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled)
    }
}

impl From<RetryError<CoordinationError>> for CoordinationError {
    fn from(value: RetryError<CoordinationError>) -> Self {
        match value {
            RetryError::Operation(e) => e,
            RetryError::Cancelled => CoordinationError::Cancelled,
        }
    }
}

/// Run `operation(attempt)` for attempt = 1..=max_retries+1.
///
/// Stops on success, returns a non-retryable error unchanged on the attempt it
/// occurred, sleeps [`RetryConfig::jittered_backoff`] between transient
/// failures and returns the last error once attempts run out. Every wait
/// selects on `cancel`.
pub async fn retry_with_backoff<T, E, F, Fut>(
    config: &RetryConfig,
    cancel: &CancellationToken,
    mut operation: F,
) -> std::result::Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::error::Error + 'static,
{
    let max_attempts = config.max_retries.saturating_add(1);
    let mut attempt = 1;

    loop {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        let error = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if !is_retryable_error(&error) {
            debug!(attempt, error = %error, "Non-retryable error, giving up");
            return Err(RetryError::Operation(error));
        }

        if attempt >= max_attempts {
            warn!(
                attempts = attempt,
                error = %error,
                "Retry attempts exhausted"
            );
            return Err(RetryError::Operation(error));
        }

        let delay = config.jittered_backoff(attempt);
        debug!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Transient error, backing off"
        );

        tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
    }
}
