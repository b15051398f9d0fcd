//! The event type and its canonical JSON form

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::identifiers::EntityIdentifiers;
use crate::rights::Rights;

/// A domain occurrence published on the event bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Stable event name, e.g. `as.up.data.forward`
    pub name: String,

    /// When the event occurred
    #[serde(serialize_with = "serialize_time")]
    pub time: DateTime<Utc>,

    /// Entities the event pertains to
    #[serde(default)]
    pub identifiers: Vec<EntityIdentifiers>,

    /// Event payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,

    /// Correlation IDs linking related events
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub correlation_ids: Vec<String>,

    /// Component that emitted the event
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub origin: String,

    /// Rights required to see the event
    #[serde(default)]
    pub visibility: Rights,

    /// Unique event ID
    pub unique_id: Uuid,
}

fn serialize_time<S: Serializer>(time: &DateTime<Utc>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&time.to_rfc3339_opts(SecondsFormat::AutoSi, true))
}

impl Event {
    /// Create an event occurring now
    ///
    /// Prefer [`Definition::new_event`](super::Definition::new_event), which
    /// stamps the event with its definition's visibility.
    pub fn new(
        name: impl Into<String>,
        identifiers: Vec<EntityIdentifiers>,
        data: Option<serde_json::Value>,
        visibility: Rights,
    ) -> Self {
        Self {
            name: name.into(),
            time: Utc::now(),
            identifiers,
            data,
            correlation_ids: Vec::new(),
            origin: String::new(),
            visibility,
            unique_id: Uuid::now_v7(),
        }
    }

    /// Set the event time
    #[must_use]
    pub fn with_time(mut self, time: DateTime<Utc>) -> Self {
        self.time = time;
        self
    }

    /// Set correlation IDs
    #[must_use]
    pub fn with_correlation_ids(mut self, ids: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.correlation_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    /// Set the origin
    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    /// Canonical JSON representation sent to clients
    pub fn to_proto_json(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self).map_err(|e| {
            Error::internal(
                "marshal_event",
                format!("failed to marshal event `{}`: {e}", self.name),
            )
        })
    }
}
