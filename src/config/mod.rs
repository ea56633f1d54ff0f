//! # Coordination Configuration
//!
//! Typed, validated configuration for every coordination component. Values
//! come from `config/coordination.toml`, an optional per-environment overlay
//! (`config/{env}.toml`) and `COORD__*` environment overrides; see
//! [`ConfigManager`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use dbcoord::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let config = manager.config();
//! println!("lock poll interval: {:?}", config.locks.poll_interval);
//! println!("cache channel: {}", config.pubsub.cache_invalidation_channel());
//! # Ok(())
//! # }
//! ```

pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::{channels, limits};
use crate::error::{CoordinationError, Result};
use crate::resilience::{HookRetryConfig, ReconnectConfig, RetryConfig};
use crate::utils::serde::duration_millis;

pub use loader::ConfigManager;

/// Root configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub database: DatabaseConfig,
    pub locks: LockConfig,
    pub pubsub: PubSubConfig,
    pub cache: CacheConfig,
    pub hooks: HookConfig,
    pub retry: RetryConfig,
}

impl CoordinationConfig {
    pub fn validate(&self) -> Result<()> {
        self.database.validate()?;
        self.locks.validate()?;
        self.pubsub.validate()?;
        self.cache.dispatch.validate("cache.dispatch")?;
        self.hooks.validate()?;
        self.retry.validate()?;
        Ok(())
    }
}

/// Backend connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// `postgres://…` selects the engine-backed implementations, `sqlite:…` the fallback
    pub url: String,
    pub max_connections: u32,
    #[serde(with = "duration_millis")]
    pub acquire_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite::memory:".to_string(),
            max_connections: 10,
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

impl DatabaseConfig {
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(CoordinationError::config("database.url must not be empty"));
        }
        if self.max_connections == 0 {
            return Err(CoordinationError::config(
                "database.max_connections must be greater than 0",
            ));
        }
        Ok(())
    }

    /// URL with any password replaced, for logs
    pub fn redacted_url(&self) -> String {
        let Some((scheme, rest)) = self.url.split_once("://") else {
            return self.url.clone();
        };
        let Some((credentials, host)) = rest.rsplit_once('@') else {
            return self.url.clone();
        };
        match credentials.split_once(':') {
            Some((user, _)) => format!("{scheme}://{user}:***@{host}"),
            None => self.url.clone(),
        }
    }
}

/// Advisory lock settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Interval between `try_lock` attempts while blocking on an engine-backed lock
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl LockConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            return Err(CoordinationError::config(
                "locks.poll_interval must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// What a dispatch pool does when every handler slot is busy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait for a free slot, back-pressuring whoever delivers events
    #[default]
    Block,
    /// Discard the incoming handler invocation and count it
    DropNewest,
}

/// Bounded handler execution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Handler invocations allowed to run concurrently
    pub max_in_flight: usize,
    pub overflow_policy: OverflowPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 256,
            overflow_policy: OverflowPolicy::Block,
        }
    }
}

impl DispatchConfig {
    pub fn validate(&self, section: &str) -> Result<()> {
        if self.max_in_flight == 0 {
            return Err(CoordinationError::config(format!(
                "{section}.max_in_flight must be greater than 0"
            )));
        }
        Ok(())
    }
}

/// Event bus settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PubSubConfig {
    /// Optional prefix for all channels, e.g. "app1" gives "app1_coord_hook_events"
    pub channels_prefix: Option<String>,
    /// Maximum serialized payload size in bytes (pg_notify limit is 8000)
    pub max_payload_size: usize,
    pub reconnect: ReconnectConfig,
    pub dispatch: DispatchConfig,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            channels_prefix: None,
            max_payload_size: limits::DEFAULT_MAX_PAYLOAD_SIZE,
            reconnect: ReconnectConfig::default(),
            dispatch: DispatchConfig::default(),
        }
    }
}

impl PubSubConfig {
    /// Set the channels prefix
    pub fn with_channels_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.channels_prefix = Some(prefix.into());
        self
    }

    /// Set maximum payload size, capped at the pg_notify limit
    pub fn with_max_payload_size(mut self, size: usize) -> Self {
        self.max_payload_size = size.min(limits::PG_NOTIFY_PAYLOAD_LIMIT);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_payload_size == 0 || self.max_payload_size > limits::PG_NOTIFY_PAYLOAD_LIMIT {
            return Err(CoordinationError::config(format!(
                "pubsub.max_payload_size must be within 1..={} bytes (pg_notify limit)",
                limits::PG_NOTIFY_PAYLOAD_LIMIT
            )));
        }

        if let Some(ref prefix) = self.channels_prefix {
            if prefix.is_empty() || prefix.len() > 20 {
                return Err(CoordinationError::config(
                    "pubsub.channels_prefix must be 1-20 characters",
                ));
            }
        }

        for channel in [
            self.record_changes_channel(),
            self.collection_changes_channel(),
            self.cache_invalidation_channel(),
            self.hook_events_channel(),
        ] {
            crate::pubsub::validate_channel_name(&channel)?;
        }

        self.reconnect.validate()?;
        self.dispatch.validate("pubsub.dispatch")
    }

    /// Build channel name with optional prefix
    pub fn build_channel_name(&self, base_channel: &str) -> String {
        match &self.channels_prefix {
            Some(prefix) => format!("{prefix}_{base_channel}"),
            None => base_channel.to_string(),
        }
    }

    pub fn record_changes_channel(&self) -> String {
        self.build_channel_name(channels::RECORD_CHANGES)
    }

    pub fn collection_changes_channel(&self) -> String {
        self.build_channel_name(channels::COLLECTION_CHANGES)
    }

    pub fn cache_invalidation_channel(&self) -> String {
        self.build_channel_name(channels::CACHE_INVALIDATION)
    }

    pub fn hook_events_channel(&self) -> String {
        self.build_channel_name(channels::HOOK_EVENTS)
    }
}

/// Cache invalidator settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub dispatch: DispatchConfig,
}

/// Hook manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HookConfig {
    /// Deadline for a broadcast hook executed on a receiving node
    #[serde(with = "duration_millis")]
    pub broadcast_timeout: Duration,
    pub retry: HookRetryConfig,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            broadcast_timeout: Duration::from_secs(30),
            retry: HookRetryConfig::default(),
        }
    }
}

impl HookConfig {
    pub fn validate(&self) -> Result<()> {
        if self.broadcast_timeout.is_zero() {
            return Err(CoordinationError::config(
                "hooks.broadcast_timeout must be greater than 0",
            ));
        }
        self.retry.validate()
    }
}
