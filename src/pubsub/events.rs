//! Wire envelopes carried on the notification channels.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Change kinds carried by [`EventPayload`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "record.create")]
    RecordCreate,
    #[serde(rename = "record.update")]
    RecordUpdate,
    #[serde(rename = "record.delete")]
    RecordDelete,
    #[serde(rename = "collection.create")]
    CollectionCreate,
    #[serde(rename = "collection.update")]
    CollectionUpdate,
    #[serde(rename = "collection.delete")]
    CollectionDelete,
    #[serde(rename = "cache.invalidate")]
    CacheInvalidate,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RecordCreate => "record.create",
            Self::RecordUpdate => "record.update",
            Self::RecordDelete => "record.delete",
            Self::CollectionCreate => "collection.create",
            Self::CollectionUpdate => "collection.update",
            Self::CollectionDelete => "collection.delete",
            Self::CacheInvalidate => "cache.invalidate",
        }
    }

    pub fn is_record_event(self) -> bool {
        matches!(
            self,
            Self::RecordCreate | Self::RecordUpdate | Self::RecordDelete
        )
    }

    pub fn is_collection_event(self) -> bool {
        matches!(
            self,
            Self::CollectionCreate | Self::CollectionUpdate | Self::CollectionDelete
        )
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope shared by the record-change, collection-change and
/// cache-invalidation channels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    /// Publishing node, stamped by the bus
    #[serde(default)]
    pub node_id: String,
    pub event: EventType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub collection: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub record_id: String,
    /// Unix seconds; stamped at publish time when left at 0
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
}

impl EventPayload {
    pub fn new(event: EventType) -> Self {
        Self {
            node_id: String::new(),
            event,
            collection: String::new(),
            record_id: String::new(),
            timestamp: 0,
            data: Map::new(),
        }
    }

    pub fn with_collection<S: Into<String>>(mut self, collection: S) -> Self {
        self.collection = collection.into();
        self
    }

    pub fn with_record_id<S: Into<String>>(mut self, record_id: S) -> Self {
        self.record_id = record_id.into();
        self
    }

    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }
}

/// How a hook executes across the fleet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HookMode {
    /// Run on the triggering node only
    #[default]
    Local,
    /// Run locally, then on every other node
    Broadcast,
    /// Run on exactly one node at a time
    Compete,
}

impl fmt::Display for HookMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Local => "local",
            Self::Broadcast => "broadcast",
            Self::Compete => "compete",
        })
    }
}

/// Envelope for broadcast hooks on the hook channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookPayload {
    #[serde(default)]
    pub node_id: String,
    pub event_name: String,
    pub mode: HookMode,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(default)]
    pub timestamp: i64,
}

impl HookPayload {
    pub fn broadcast<S: Into<String>>(event_name: S, data: Value) -> Self {
        Self {
            node_id: String::new(),
            event_name: event_name.into(),
            mode: HookMode::Broadcast,
            data,
            timestamp: 0,
        }
    }
}

/// A payload the bus can stamp with its origin and send over a channel
pub trait NodeEnvelope: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn node_id(&self) -> &str;
    fn set_node_id(&mut self, node_id: String);
    fn timestamp(&self) -> i64;
    fn set_timestamp(&mut self, timestamp: i64);
}

impl NodeEnvelope for EventPayload {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn set_node_id(&mut self, node_id: String) {
        self.node_id = node_id;
    }

    fn timestamp(&self) -> i64 {
        self.timestamp
    }

    fn set_timestamp(&mut self, timestamp: i64) {
        self.timestamp = timestamp;
    }
}

impl NodeEnvelope for HookPayload {
    fn node_id(&self) -> &str {
        &self.node_id
    }

    fn set_node_id(&mut self, node_id: String) {
        self.node_id = node_id;
    }

    fn timestamp(&self) -> i64 {
        self.timestamp
    }

    fn set_timestamp(&mut self, timestamp: i64) {
        self.timestamp = timestamp;
    }
}

/// `{hostname}-{16 hex chars}`, unique per process
pub fn generate_node_id() -> String {
    let hostname = gethostname::gethostname().to_string_lossy().into_owned();
    let suffix = &uuid::Uuid::new_v4().simple().to_string()[..16];
    format!("{hostname}-{suffix}")
}
