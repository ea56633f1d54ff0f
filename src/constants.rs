//! # Coordination Constants
//!
//! Channel names, lock-name prefixes and backend limits shared across the
//! coordination components.

/// Notification channels used by the coordination layer
pub mod channels {
    /// Record create/update/delete events
    pub const RECORD_CHANGES: &str = "coord_record_changes";
    /// Collection schema create/update/delete events
    pub const COLLECTION_CHANGES: &str = "coord_collection_changes";
    /// Cache invalidation events
    pub const CACHE_INVALIDATION: &str = "coord_cache_invalidation";
    /// Broadcast hook events
    pub const HOOK_EVENTS: &str = "coord_hook_events";
}

/// Prefixes applied to human-readable lock names
pub mod lock_prefixes {
    /// Cron task leader election
    pub const CRON: &str = "cron:";
    /// Compete-mode hook leader election
    pub const HOOK: &str = "hook:";
}

/// Backend limits
pub mod limits {
    /// PostgreSQL identifier length limit (NAMEDATALEN - 1), applies to channel names
    pub const MAX_CHANNEL_NAME_BYTES: usize = 63;
    /// Hard pg_notify payload limit
    pub const PG_NOTIFY_PAYLOAD_LIMIT: usize = 8000;
    /// Default payload ceiling, leaving headroom under the hard limit
    pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 7800;
}

/// Record id sentinel meaning "every record in the collection"
pub const INVALIDATE_ALL_RECORDS: &str = "*";
