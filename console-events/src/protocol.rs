//! Wire protocol of the events endpoint
//!
//! Every WebSocket text frame carries one JSON envelope tagged by `type`.
//! Clients send [`Request`]s; the gateway answers with [`Response`]s:
//!
//! ```json
//! {"type":"subscribe","id":42,"identifiers":[{"application_ids":{"application_id":"foo"}}],"tail":10,"names":["as.up.*"]}
//! {"type":"subscribe","id":42}
//! {"type":"publish","id":42,"event":{"name":"as.up.data.forward", ...}}
//! {"type":"unsubscribe","id":42}
//! {"type":"error","id":42,"error":{"code":6,"message":"already subscribed with ID `42`"}}
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorDetails, Result};
use crate::identifiers::EntityIdentifiers;

/// Subprotocol negotiated for the events endpoint
pub const PROTOCOL_V1: &str = "ttn.lorawan.v3.console.internal.events.v1";

/// Client-chosen subscription ID, unique per connection
pub type SubscriptionId = u64;

const REQUEST_TYPES: &[&str] = &["subscribe", "unsubscribe"];

/// A request from the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Open a subscription
    Subscribe {
        id: SubscriptionId,

        /// Entities to receive events for
        #[serde(default)]
        identifiers: Vec<EntityIdentifiers>,

        /// Number of historical events to replay (0: none)
        #[serde(default)]
        tail: u32,

        /// Replay events at or after this time
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after: Option<DateTime<Utc>>,

        /// Event name patterns (empty: all events)
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        names: Vec<String>,
    },

    /// Close a subscription
    Unsubscribe { id: SubscriptionId },
}

impl Request {
    /// Subscription ID the request refers to
    pub fn id(&self) -> SubscriptionId {
        match self {
            Self::Subscribe { id, .. } | Self::Unsubscribe { id } => *id,
        }
    }

    /// Decode a request from a text frame
    pub fn decode(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text).map_err(|e| {
            Error::invalid_argument("malformed_request", format!("malformed request: {e}"))
        })?;

        let kind = value.get("type").and_then(serde_json::Value::as_str);
        match kind {
            Some(kind) if REQUEST_TYPES.contains(&kind) => {}
            Some(kind) => {
                return Err(Error::invalid_argument(
                    "message_type",
                    format!("unknown message type `{kind}`"),
                ))
            }
            None => {
                return Err(Error::invalid_argument(
                    "message_type",
                    "missing message type",
                ))
            }
        }

        let request: Request = serde_json::from_value(value).map_err(|e| {
            Error::invalid_argument("malformed_request", format!("malformed request: {e}"))
        })?;
        if request.id() == 0 {
            return Err(Error::invalid_argument(
                "subscription_id",
                "subscription ID must be non-zero",
            ));
        }
        Ok(request)
    }

    /// Encode the request as a text frame
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| {
            Error::internal("marshal_request", format!("failed to marshal request: {e}"))
        })
    }
}

/// A response or event sent to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Subscription opened
    Subscribe { id: SubscriptionId },

    /// Subscription closed
    Unsubscribe { id: SubscriptionId },

    /// An event for a subscription, in its canonical JSON form
    Publish {
        id: SubscriptionId,
        event: serde_json::Value,
    },

    /// A request failed
    Error {
        id: SubscriptionId,
        error: ErrorDetails,
    },
}

impl Response {
    /// Error response for a failed request
    pub fn error(id: SubscriptionId, err: &Error) -> Self {
        Self::Error {
            id,
            error: err.details(),
        }
    }

    /// Subscription ID the response refers to
    pub fn id(&self) -> SubscriptionId {
        match self {
            Self::Subscribe { id }
            | Self::Unsubscribe { id }
            | Self::Publish { id, .. }
            | Self::Error { id, .. } => *id,
        }
    }

    /// Decode a response from a text frame
    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| {
            Error::invalid_argument("malformed_response", format!("malformed response: {e}"))
        })
    }

    /// Encode the response as a text frame
    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| {
            Error::internal(
                "marshal_response",
                format!("failed to marshal response: {e}"),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_decode_subscribe() {
        let request = Request::decode(
            r#"{"type":"subscribe","id":42,"identifiers":[{"application_ids":{"application_id":"foo"}}],"tail":1,"after":"1973-11-29T21:33:09.012Z","names":["foo"]}"#,
        )
        .unwrap();

        let after = Utc.with_ymd_and_hms(1973, 11, 29, 21, 33, 9).unwrap()
            + chrono::Duration::milliseconds(12);
        assert_eq!(
            request,
            Request::Subscribe {
                id: 42,
                identifiers: vec![EntityIdentifiers::application("foo")],
                tail: 1,
                after: Some(after),
                names: vec!["foo".to_string()],
            }
        );
    }

    #[test]
    fn test_decode_defaults() {
        let request = Request::decode(r#"{"type":"subscribe","id":7}"#).unwrap();
        assert_eq!(
            request,
            Request::Subscribe {
                id: 7,
                identifiers: vec![],
                tail: 0,
                after: None,
                names: vec![],
            }
        );
    }

    #[test]
    fn test_after_is_normalized_to_utc() {
        let request = Request::decode(
            r#"{"type":"subscribe","id":1,"after":"2024-01-01T02:00:00+02:00"}"#,
        )
        .unwrap();
        let Request::Subscribe { after, .. } = request else {
            panic!("expected subscribe");
        };
        assert_eq!(
            after,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        for text in [
            r#"{"type":"publish","id":1,"event":{}}"#,
            r#"{"type":"bogus","id":1}"#,
            r#"{"id":1}"#,
        ] {
            let err = Request::decode(text).unwrap_err();
            assert_eq!(err.name(), "message_type", "{text}");
            assert!(matches!(err, Error::InvalidArgument { .. }));
        }
    }

    #[test]
    fn test_malformed_and_zero_id_rejected() {
        assert_eq!(
            Request::decode("not json").unwrap_err().name(),
            "malformed_request"
        );
        assert_eq!(
            Request::decode(r#"{"type":"unsubscribe","id":0}"#)
                .unwrap_err()
                .name(),
            "subscription_id"
        );
        assert_eq!(
            Request::decode(r#"{"type":"unsubscribe","id":"x"}"#)
                .unwrap_err()
                .name(),
            "malformed_request"
        );
    }

    #[test]
    fn test_response_wire_shape() {
        assert_eq!(
            serde_json::to_value(Response::Subscribe { id: 42 }).unwrap(),
            json!({"type": "subscribe", "id": 42})
        );
        assert_eq!(
            serde_json::to_value(Response::Publish {
                id: 42,
                event: json!({"name": "foo"})
            })
            .unwrap(),
            json!({"type": "publish", "id": 42, "event": {"name": "foo"}})
        );

        let err = Error::already_exists("already_subscribed", "already subscribed with ID `42`");
        let value = serde_json::to_value(Response::error(42, &err)).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["id"], 42);
        assert_eq!(value["error"]["code"], 6);
        assert_eq!(value["error"]["message"], "already subscribed with ID `42`");
    }

    #[test]
    fn test_large_ids_survive_round_trip() {
        let request = Request::Unsubscribe { id: u64::MAX };
        let decoded = Request::decode(&request.encode().unwrap()).unwrap();
        assert_eq!(decoded, request);

        let response = Response::error(u64::MAX, &Error::not_found("not_subscribed", "x"));
        let decoded = Response::decode(&response.encode().unwrap()).unwrap();
        assert_eq!(decoded, response);
    }
}
