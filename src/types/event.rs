use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Event type carrying operation updates.
pub const EVENT_TYPE_OPERATION: &str = "operation";
/// Event type carrying daemon log records.
pub const EVENT_TYPE_LOGGING: &str = "logging";
/// Event type carrying resource lifecycle notifications.
pub const EVENT_TYPE_LIFECYCLE: &str = "lifecycle";

/// An event as pushed on the `/events` stream.
///
/// This type is intentionally _lossless_:
/// - `event_type` keeps the original type string.
/// - `metadata` keeps an arbitrary JSON payload.
///
/// Use [`Event::metadata_as`] to decode the payload into a typed struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Event type (`operation`, `logging`, `lifecycle`, ...).
    #[serde(rename = "type", default)]
    pub event_type: String,

    /// RFC 3339 timestamp, when provided by the daemon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,

    /// Event payload.
    #[serde(default)]
    pub metadata: Value,

    /// Cluster member that emitted the event.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub location: String,

    /// Project the event belongs to.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub project: String,
}

impl Event {
    /// Create an event with the given type and payload.
    #[must_use]
    pub fn new(event_type: impl Into<String>, metadata: Value) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: None,
            metadata,
            location: String::new(),
            project: String::new(),
        }
    }

    /// Decode the payload.
    pub fn metadata_as<T: DeserializeOwned>(&self) -> Result<T> {
        T::deserialize(&self.metadata).map_err(Error::from)
    }
}
