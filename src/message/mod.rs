//! Wire messages exchanged with the relay.
//!
//! Every frame on every channel is an [`AgentMessage`] envelope. The envelope
//! only says what kind of inner message `message_payload` holds; receivers
//! decode the payload according to [`MessageType`] alone.
//!
//! ```text
//! message/
//!   mod.rs           AgentMessage envelope, MessageType, byte-field serde
//!   keysplitting.rs  Syn / SynAck / Data / DataAck payloads + signed wrapper
//!   stream.rs        sequence-numbered stream envelopes
//!   error.rs         error envelope
//!   control.rs       control-channel and registration messages
//! ```

pub mod control;
pub mod error;
pub mod keysplitting;
pub mod stream;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use error::ErrorMessage;
pub use keysplitting::{KeysplittingMessage, KeysplittingPayload, KeysplittingType};
pub use stream::{StreamMessage, StreamType};

/// Envelope schema version stamped on every outgoing message.
pub const SCHEMA_VERSION: &str = "1.0";

/// Kind of payload carried in an [`AgentMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "keysplitting")]
    Keysplitting,
    #[serde(rename = "stream")]
    Stream,
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "newDatachannel")]
    NewDatachannel,
    #[serde(rename = "healthcheck")]
    HealthCheck,
    /// Anything this build does not understand; reported as a processing error.
    #[serde(other)]
    Unknown,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Keysplitting => "keysplitting",
            Self::Stream => "stream",
            Self::Error => "error",
            Self::NewDatachannel => "newDatachannel",
            Self::HealthCheck => "healthcheck",
            Self::Unknown => "unknown",
        }
    }
}

/// The common wire unit on every channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessage {
    pub message_type: MessageType,
    pub schema_version: String,
    #[serde(with = "bytes_field")]
    pub message_payload: Vec<u8>,
}

impl AgentMessage {
    /// Serialize `payload` to JSON and wrap it.
    pub fn new<T: Serialize>(message_type: MessageType, payload: &T) -> Result<Self> {
        Ok(Self {
            message_type,
            schema_version: SCHEMA_VERSION.to_string(),
            message_payload: serde_json::to_vec(payload)?,
        })
    }

    /// Decode the inner payload as `T`.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.message_payload)?)
    }
}

/// Serde adapter for byte fields: written as standard base64, read from
/// either a base64 string or an inline JSON value (kept as its JSON bytes).
pub(crate) mod bytes_field {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{de, Deserialize, Deserializer, Serializer};
    use serde_json::Value;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Null => Ok(Vec::new()),
            Value::String(s) => STANDARD.decode(s.as_bytes()).map_err(de::Error::custom),
            other => serde_json::to_vec(&other).map_err(de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_payload_is_base64_on_the_wire() {
        let msg = AgentMessage::new(MessageType::HealthCheck, &json!({"alive": true})).unwrap();
        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire["messageType"], "healthcheck");
        assert_eq!(wire["schemaVersion"], "1.0");
        // {"alive":true}
        assert_eq!(wire["messagePayload"], "eyJhbGl2ZSI6dHJ1ZX0=");
    }

    #[test]
    fn test_envelope_accepts_inline_json_payload() {
        let raw = r#"{"messageType":"stream","schemaVersion":"1.0","messagePayload":{"a":1}}"#;
        let msg: AgentMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.message_type, MessageType::Stream);
        let inner: serde_json::Value = msg.payload().unwrap();
        assert_eq!(inner["a"], 1);
    }

    #[test]
    fn test_unknown_message_type_parses() {
        let raw = r#"{"messageType":"telemetry","schemaVersion":"1.0","messagePayload":""}"#;
        let msg: AgentMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.message_type, MessageType::Unknown);
        assert!(msg.message_payload.is_empty());
    }
}
