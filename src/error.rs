//! Error types for the coordination layer

use std::time::Duration;
use thiserror::Error;

/// Result type for coordination operations
pub type Result<T> = std::result::Result<T, CoordinationError>;

/// Errors that can occur in coordination operations
#[derive(Error, Debug)]
pub enum CoordinationError {
    /// Database connection or query errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration source could not be read or deserialized
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// Invalid configuration value
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Invalid notification channel name
    #[error("Invalid channel name '{channel}': {reason}")]
    InvalidChannel { channel: String, reason: String },

    /// Serialized notification exceeds the backend limit
    #[error("Payload size {size} exceeds limit {limit}")]
    PayloadTooLarge { size: usize, limit: usize },

    /// Caller supplied an unusable argument
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// The operation observed cancellation before completing
    #[error("Operation cancelled")]
    Cancelled,

    /// Marker error a handler returns to request another attempt
    #[error("Retryable error: {message}")]
    Retryable { message: String },

    /// A user-supplied task or hook handler failed
    #[error("Handler error: {0}")]
    Handler(#[from] anyhow::Error),

    /// A user-supplied task or hook handler panicked
    #[error("Handler '{name}' panicked: {message}")]
    HandlerPanicked { name: String, message: String },

    /// A hook name was triggered that was never registered
    #[error("Hook not found: {name}")]
    HookNotFound { name: String },

    /// A remotely triggered hook ran past its deadline
    #[error("Hook '{name}' timed out after {timeout:?}")]
    HookTimeout { name: String, timeout: Duration },

    /// Retry loop gave up
    #[error("Giving up after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        attempts: u32,
        last_error: Box<CoordinationError>,
    },

    /// Listener reconnect ceiling reached
    #[error("Listener reconnect limit reached after {attempts} attempts: {last_error}")]
    ReconnectExhausted {
        attempts: u32,
        last_error: Box<CoordinationError>,
    },

    /// Row lock refused the mutation (for example a decrement below its floor)
    #[error("Lock violation during {operation}: {reason}")]
    LockViolation { operation: String, reason: String },

    /// Target row for a locked operation does not exist
    #[error("Row not found in {table}: {id}")]
    RowNotFound { table: String, id: String },
}

impl CoordinationError {
    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an invalid channel error
    pub fn invalid_channel<C: Into<String>, R: Into<String>>(channel: C, reason: R) -> Self {
        Self::InvalidChannel {
            channel: channel.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid argument error
    pub fn invalid_argument<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create the retryable marker error; only this variant is retried by
    /// [`crate::hooks::DistributedHookManager::trigger_hook_with_retry`]
    pub fn retryable<S: Into<String>>(message: S) -> Self {
        Self::Retryable {
            message: message.into(),
        }
    }

    /// Create a lock violation error
    pub fn lock_violation<O: Into<String>, R: Into<String>>(operation: O, reason: R) -> Self {
        Self::LockViolation {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a row not found error
    pub fn row_not_found<T: Into<String>, I: Into<String>>(table: T, id: I) -> Self {
        Self::RowNotFound {
            table: table.into(),
            id: id.into(),
        }
    }

    /// Convert a handler's `anyhow` error, recovering a wrapped coordination
    /// error (notably the retryable marker) instead of nesting it
    pub fn from_handler(error: anyhow::Error) -> Self {
        match error.downcast::<CoordinationError>() {
            Ok(coordination) => coordination,
            Err(other) => Self::Handler(other),
        }
    }

    /// Whether this is the distinguished retryable marker
    pub fn is_retryable_marker(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }

    /// Whether this is a lock/floor violation
    pub fn is_lock_violation(&self) -> bool {
        matches!(self, Self::LockViolation { .. })
    }

    /// Whether the error is transient according to the classifier
    pub fn is_transient(&self) -> bool {
        crate::resilience::is_retryable_error(self)
    }
}
