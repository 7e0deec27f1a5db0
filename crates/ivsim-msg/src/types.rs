//! ---
//! ivsim_section: "02-messaging-transport"
//! ivsim_subsection: "module"
//! ivsim_type: "source"
//! ivsim_scope: "code"
//! ivsim_description: "Message envelopes and transport contracts."
//! ivsim_version: "v0.1.0"
//! ivsim_owner: "tbd"
//! ---
use std::borrow::Cow;

use chrono::{DateTime, SecondsFormat, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

/// Application property carrying the device-side creation time of a message.
pub const CREATION_TIME_PROPERTY: &str = "iothub-creation-time-utc";

/// Partial property document exchanged with the shadow service.
pub type PropertyPatch = Map<String, JsonValue>;

/// Device-to-cloud message handed to a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceMessage {
    /// Unique identifier for deduplication on the service side.
    pub id: Uuid,
    /// Encoded payload.
    pub body: Vec<u8>,
    /// MIME type of `body`.
    pub content_type: String,
    /// Character encoding of `body`.
    pub content_encoding: String,
    /// Application properties, sent in insertion order.
    #[serde(default)]
    pub properties: IndexMap<String, String>,
    /// Timestamp when the message was created.
    pub created_at: DateTime<Utc>,
}

impl DeviceMessage {
    /// Wrap a UTF-8 JSON body, stamping the creation-time application property.
    pub fn json(body: Vec<u8>) -> Self {
        let created_at = Utc::now();
        let mut properties = IndexMap::new();
        properties.insert(
            CREATION_TIME_PROPERTY.to_owned(),
            created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        Self {
            id: Uuid::new_v4(),
            body,
            content_type: "application/json".to_owned(),
            content_encoding: "utf-8".to_owned(),
            properties,
            created_at,
        }
    }

    /// Lossy text view of the body for logging.
    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Cloud-to-device message delivered by a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloudMessage {
    /// Service assigned message identifier, when present.
    pub message_id: Option<String>,
    /// Token used to complete (acknowledge) the message.
    pub lock_token: String,
    /// Raw payload; never interpreted by the simulator.
    pub body: Vec<u8>,
    /// Application properties attached by the sender.
    #[serde(default)]
    pub properties: IndexMap<String, String>,
}

impl CloudMessage {
    /// Construct a message with the supplied lock token and body.
    pub fn new(lock_token: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            message_id: None,
            lock_token: lock_token.into(),
            body: body.into(),
            properties: IndexMap::new(),
        }
    }

    /// Lossy text view of the body for logging.
    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Session level notifications published by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The session is established.
    Connected,
    /// The session was lost.
    Disconnected,
    /// A cloud-to-device message arrived.
    Message(CloudMessage),
    /// A non-fatal transport failure.
    Error(String),
}

impl TransportEvent {
    /// Convenience accessor returning the event kind as a static string.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportEvent::Connected => "connected",
            TransportEvent::Disconnected => "disconnected",
            TransportEvent::Message(_) => "message",
            TransportEvent::Error(_) => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_message_carries_creation_time_and_content_metadata() {
        let message = DeviceMessage::json(br#"{"flowrate":70.0}"#.to_vec());
        assert_eq!(message.content_type, "application/json");
        assert_eq!(message.content_encoding, "utf-8");
        let stamped = message
            .properties
            .get(CREATION_TIME_PROPERTY)
            .expect("creation time property");
        let parsed = DateTime::parse_from_rfc3339(stamped).expect("rfc3339 timestamp");
        let drift = parsed.with_timezone(&Utc) - message.created_at;
        assert!(drift.num_milliseconds().abs() <= 1);
        assert_eq!(message.body_text(), r#"{"flowrate":70.0}"#);
    }

    #[test]
    fn properties_keep_insertion_order() {
        let mut message = DeviceMessage::json(Vec::new());
        message.properties.insert("b".to_owned(), "2".to_owned());
        message.properties.insert("a".to_owned(), "1".to_owned());
        let keys: Vec<&str> = message.properties.keys().map(String::as_str).collect();
        assert_eq!(keys, vec![CREATION_TIME_PROPERTY, "b", "a"]);
    }
}
