//! Wire protocol - the `{type, payload}` JSON envelope.
//!
//! Every frame in either direction is a JSON object with a string `type`
//! and an object `payload`. Outbound frames that need acknowledgment carry
//! their client-generated id in `payload.clientTempId`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const CLIENT_HELLO: &str = "client:hello";
pub const PING: &str = "ping";
pub const TYPING_START: &str = "typing:start";
pub const TYPING_STOP: &str = "typing:stop";
pub const MESSAGE_SEND: &str = "message:send";

pub const MESSAGE_NEW: &str = "message:new";
pub const MESSAGE_DELIVERED: &str = "message:delivered";
pub const ACK: &str = "ack";
pub const MESSAGE_EDIT: &str = "message:edit";
pub const MESSAGE_DELETE: &str = "message:delete";
pub const REACTION_UPDATE: &str = "reaction:update";
pub const TYPING_UPDATE: &str = "typing:update";
pub const PRESENCE_UPDATE: &str = "presence:update";
pub const PONG: &str = "pong";
pub const ERROR: &str = "ERROR";

/// Payload key holding the idempotency id of an outbound event.
pub const CLIENT_TEMP_ID: &str = "clientTempId";

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Frame has empty type")]
    EmptyType,
}

/// The wire envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default = "empty_payload")]
    pub payload: Value,
}

fn empty_payload() -> Value {
    Value::Object(Map::new())
}

impl Envelope {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    /// Envelope with an empty object payload.
    pub fn bare(kind: impl Into<String>) -> Self {
        Self::new(kind, empty_payload())
    }

    /// A chat message send; acknowledged by the peer.
    pub fn message_send(payload: Value) -> Self {
        Self::new(MESSAGE_SEND, payload)
    }

    /// Whether the peer confirms this event by id.
    pub fn expects_ack(&self) -> bool {
        self.kind == MESSAGE_SEND
    }

    /// Writes `id` into `payload.clientTempId`.
    ///
    /// Non-object payloads are wrapped as `{"data": <payload>}` first, so
    /// every stamped frame carries its id at the same place.
    pub fn stamp_id(&mut self, id: &str) {
        if !self.payload.is_object() {
            let data = std::mem::replace(&mut self.payload, empty_payload());
            if !data.is_null() {
                self.payload["data"] = data;
            }
        }
        self.payload[CLIENT_TEMP_ID] = Value::String(id.to_string());
    }

    /// The `clientTempId` carried by this envelope, if any.
    pub fn client_temp_id(&self) -> Option<&str> {
        self.payload.get(CLIENT_TEMP_ID).and_then(Value::as_str)
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        let envelope: Envelope = serde_json::from_str(frame)?;
        if envelope.kind.is_empty() {
            return Err(ProtocolError::EmptyType);
        }
        Ok(envelope)
    }
}

/// A decoded inbound event, handed to the UI layer in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// New chat message; `ack_id` is set when it echoes one of our sends
    MessageNew { payload: Value, ack_id: Option<String> },
    /// Peer confirmed receipt of the outbound event with this id
    Delivered { id: String, payload: Value },
    MessageEdit(Value),
    MessageDelete(Value),
    ReactionUpdate(Value),
    TypingUpdate(Value),
    PresenceUpdate(Value),
    Pong,
    /// Peer-reported error; surfaced, never acted on
    PeerError(Value),
    /// Any other type, passed through untouched
    Other(Envelope),
}

impl InboundEvent {
    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        Ok(Self::from_envelope(Envelope::decode(frame)?))
    }

    pub fn from_envelope(envelope: Envelope) -> Self {
        let Envelope { kind, payload } = envelope;
        match kind.as_str() {
            MESSAGE_NEW => {
                let ack_id = payload.get(CLIENT_TEMP_ID).and_then(Value::as_str).map(str::to_string);
                Self::MessageNew { payload, ack_id }
            }
            MESSAGE_DELIVERED | ACK => match ack_id_of(&payload) {
                Some(id) => Self::Delivered { id, payload },
                None => Self::Other(Envelope { kind, payload }),
            },
            MESSAGE_EDIT => Self::MessageEdit(payload),
            MESSAGE_DELETE => Self::MessageDelete(payload),
            REACTION_UPDATE => Self::ReactionUpdate(payload),
            TYPING_UPDATE => Self::TypingUpdate(payload),
            PRESENCE_UPDATE => Self::PresenceUpdate(payload),
            PONG => Self::Pong,
            ERROR => Self::PeerError(payload),
            _ => Self::Other(Envelope { kind, payload }),
        }
    }

    /// The outbound id this event acknowledges, if any.
    pub fn acknowledged_id(&self) -> Option<&str> {
        match self {
            Self::Delivered { id, .. } => Some(id),
            Self::MessageNew { ack_id, .. } => ack_id.as_deref(),
            _ => None,
        }
    }
}

fn ack_id_of(payload: &Value) -> Option<String> {
    [CLIENT_TEMP_ID, "id"]
        .iter()
        .find_map(|key| payload.get(*key).and_then(Value::as_str))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_round_trip_shape() {
        let envelope = Envelope::new(PING, json!({"t": 15000}));
        let frame = envelope.encode().unwrap();

        let raw: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(raw["type"], "ping");
        assert_eq!(raw["payload"]["t"], 15000);
    }

    #[test]
    fn test_missing_payload_defaults_to_object() {
        let envelope = Envelope::decode(r#"{"type":"pong"}"#).unwrap();
        assert!(envelope.payload.is_object());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Envelope::decode("not json").is_err());
        assert!(matches!(
            Envelope::decode(r#"{"type":"","payload":{}}"#),
            Err(ProtocolError::EmptyType)
        ));
    }

    #[test]
    fn test_stamp_id() {
        let mut envelope = Envelope::message_send(json!({"text": "help"}));
        envelope.stamp_id("abc");

        assert_eq!(envelope.client_temp_id(), Some("abc"));
        assert_eq!(envelope.payload["text"], "help");
        assert!(envelope.expects_ack());
    }

    #[test]
    fn test_stamp_id_wraps_non_object_payload() {
        let mut envelope = Envelope::new("note", json!("plain"));
        envelope.stamp_id("x1");

        assert_eq!(envelope.payload["data"], "plain");
        assert_eq!(envelope.client_temp_id(), Some("x1"));
    }

    #[test]
    fn test_delivered_correlates_by_id() {
        let event = InboundEvent::decode(r#"{"type":"message:delivered","payload":{"clientTempId":"m-1"}}"#).unwrap();
        assert_eq!(event.acknowledged_id(), Some("m-1"));

        let ack = InboundEvent::decode(r#"{"type":"ack","payload":{"id":"m-2"}}"#).unwrap();
        assert_eq!(ack.acknowledged_id(), Some("m-2"));
    }

    #[test]
    fn test_message_new_echo_acknowledges() {
        let echo = InboundEvent::decode(r#"{"type":"message:new","payload":{"clientTempId":"m-3","text":"ok"}}"#).unwrap();
        assert_eq!(echo.acknowledged_id(), Some("m-3"));

        let foreign = InboundEvent::decode(r#"{"type":"message:new","payload":{"text":"hi"}}"#).unwrap();
        assert_eq!(foreign.acknowledged_id(), None);
    }

    #[test]
    fn test_error_sentinel_and_unknown() {
        let error = InboundEvent::decode(r#"{"type":"ERROR","payload":{"code":"RATE_LIMIT"}}"#).unwrap();
        assert!(matches!(error, InboundEvent::PeerError(_)));

        let other = InboundEvent::decode(r#"{"type":"thread:archived","payload":{}}"#).unwrap();
        assert!(matches!(other, InboundEvent::Other(ref e) if e.kind == "thread:archived"));
    }
}
