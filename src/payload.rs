//! Inbound event documents and outbound acknowledgements
//!
//! Event topics carry a flat JSON document with a handful of recognized
//! fields; everything else stays reachable through `raw`. The nested
//! `metadata` document is re-serialized to a string so downstream code can
//! re-parse it with whatever schema it expects.

use crate::error::AgentError;
use serde::Serialize;
use serde_json::Value;

/// Event names used on the state/command dispatch path.
pub const ON_OK: &str = "on_ok";
pub const ON_WAIT: &str = "on_wait";
pub const ON_IDLE: &str = "on_idle";
pub const ON_HOLD: &str = "on_hold";
pub const ON_START_SESSION: &str = "on_start_session";
pub const ON_END_SESSION: &str = "on_end_session";
pub const ON_ERROR: &str = "on_error";

/// Parsed inbound event document.
///
/// Unrecognized or absent fields fall back to empty/zero rather than failing
/// the whole message; only documents that are not JSON objects at all are
/// rejected as malformed.
#[derive(Clone, Debug, Default)]
pub struct EventPayload {
    /// State/event name carried in the document (`state` field)
    pub event_name: String,
    pub reference_id: String,
    pub amount: i64,
    pub message_id: i64,
    pub active_session_id: i64,
    pub option_name: String,
    /// Nested metadata document re-serialized to a string
    pub metadata: String,
    /// Full document for fields the agent does not model
    pub raw: Value,
}

impl EventPayload {
    /// Parses a raw broker payload into an event document.
    pub fn from_json(raw: &str) -> Result<Self, AgentError> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| AgentError::MalformedPayload(e.to_string()))?;
        let object = value
            .as_object()
            .ok_or_else(|| AgentError::MalformedPayload("payload is not an object".into()))?;

        let text = |key: &str| {
            object
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let number = |key: &str| object.get(key).and_then(Value::as_i64).unwrap_or_default();

        let metadata = match object.get("metadata") {
            Some(Value::String(s)) => s.clone(),
            Some(nested) => nested.to_string(),
            None => String::new(),
        };

        Ok(Self {
            event_name: text("state"),
            reference_id: text("reference_id"),
            amount: number("amount"),
            message_id: number("message_id"),
            active_session_id: number("active_session_id"),
            option_name: text("option_name"),
            metadata,
            raw: value,
        })
    }
}

/// Acknowledgement published to the per-device callback topic when auto-ack
/// is enabled and the inbound event carried a message id.
#[derive(Serialize, Clone, Debug)]
pub struct AckPayload {
    pub state: &'static str,
    pub active_session_id: i64,
    pub message_id: i64,
}

impl AckPayload {
    pub fn for_event(event: &EventPayload) -> Self {
        Self {
            state: ON_OK,
            active_session_id: event.active_session_id,
            message_id: event.message_id,
        }
    }

    pub fn to_json(&self) -> String {
        // Serialization of three scalar fields cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Session-end document published to the device session topic.
pub fn end_session_payload() -> String {
    serde_json::json!({ "state": "end_session" }).to_string()
}
