//! # Cross-Node Pub/Sub
//!
//! JSON events over named notification channels. Every published payload
//! carries the publishing node's id, and each node drops events it published
//! itself, so a subscriber only ever sees changes made elsewhere.
//!
//! PostgreSQL deployments use [`PgNotifyTransport`]; SQLite deployments get a
//! mock bus where publishing is a no-op. [`InProcessTransport`] links several
//! buses inside one process.

pub mod dispatch;
pub mod events;
pub mod manager;
pub mod transport;

pub use dispatch::{DispatchPool, DispatchStats};
pub use events::{generate_node_id, EventPayload, EventType, HookMode, HookPayload, NodeEnvelope};
pub use manager::{ListenerStats, PubSubManager, PubSubStats, SubscriptionId};
pub use transport::{
    InProcessTransport, NotificationStream, NotificationTransport, PgNotifyTransport,
    RawNotification,
};

use crate::constants::limits::MAX_CHANNEL_NAME_BYTES;
use crate::error::{CoordinationError, Result};

/// Channel names are 1..=63 bytes of ASCII letters, digits and `_`
pub fn validate_channel_name(channel: &str) -> Result<()> {
    if channel.is_empty() {
        return Err(CoordinationError::invalid_channel(channel, "channel name is empty"));
    }
    if channel.len() > MAX_CHANNEL_NAME_BYTES {
        return Err(CoordinationError::invalid_channel(
            channel,
            format!("channel name exceeds {MAX_CHANNEL_NAME_BYTES} bytes"),
        ));
    }
    if let Some(bad) = channel
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '_'))
    {
        return Err(CoordinationError::invalid_channel(
            channel,
            format!("invalid character {bad:?}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_name_rules() {
        assert!(validate_channel_name("coord_record_changes").is_ok());
        assert!(validate_channel_name(&"a".repeat(63)).is_ok());

        assert!(validate_channel_name("").is_err());
        assert!(validate_channel_name(&"a".repeat(64)).is_err());
        assert!(validate_channel_name("has-dash").is_err());
        assert!(validate_channel_name("semi;colon").is_err());
        assert!(validate_channel_name("ünïcode").is_err());
    }
}
