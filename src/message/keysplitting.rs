//! Keysplitting payloads.
//!
//! Each variant is a flat record; the canonical hash is taken over exactly
//! these fields, so field names and shapes are part of the protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::bytes_field;
use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeysplittingType {
    Syn,
    SynAck,
    Data,
    DataAck,
}

impl KeysplittingType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Syn => "Syn",
            Self::SynAck => "SynAck",
            Self::Data => "Data",
            Self::DataAck => "DataAck",
        }
    }
}

impl std::fmt::Display for KeysplittingType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Client identity certificate binding an OIDC identity to a client keypair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BzCert {
    pub initial_id_token: String,
    pub current_id_token: String,
    pub client_public_key: String,
    pub rand: String,
    pub signature_on_rand: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynPayload {
    pub timestamp: String,
    pub schema_version: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub action: String,
    #[serde(with = "bytes_field", default)]
    pub action_payload: Vec<u8>,
    pub target_id: String,
    pub nonce: String,
    #[serde(rename = "bZCert")]
    pub bz_cert: BzCert,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynAckPayload {
    pub timestamp: String,
    pub schema_version: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub action: String,
    #[serde(with = "bytes_field", default)]
    pub action_response_payload: Vec<u8>,
    pub target_public_key: String,
    pub nonce: String,
    pub h_pointer: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataPayload {
    pub timestamp: String,
    pub schema_version: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub action: String,
    #[serde(with = "bytes_field", default)]
    pub action_payload: Vec<u8>,
    pub target_id: String,
    pub h_pointer: String,
    #[serde(rename = "bZCertHash")]
    pub bz_cert_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataAckPayload {
    pub timestamp: String,
    pub schema_version: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub action: String,
    #[serde(with = "bytes_field", default)]
    pub action_response_payload: Vec<u8>,
    pub target_public_key: String,
    pub h_pointer: String,
}

/// Tagged union over the four handshake payloads. Serializes as the bare
/// inner record; the tag lives in the outer message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum KeysplittingPayload {
    Syn(SynPayload),
    SynAck(SynAckPayload),
    Data(DataPayload),
    DataAck(DataAckPayload),
}

impl KeysplittingPayload {
    pub fn kind(&self) -> KeysplittingType {
        match self {
            Self::Syn(_) => KeysplittingType::Syn,
            Self::SynAck(_) => KeysplittingType::SynAck,
            Self::Data(_) => KeysplittingType::Data,
            Self::DataAck(_) => KeysplittingType::DataAck,
        }
    }

    pub fn action(&self) -> &str {
        match self {
            Self::Syn(p) => &p.action,
            Self::SynAck(p) => &p.action,
            Self::Data(p) => &p.action,
            Self::DataAck(p) => &p.action,
        }
    }

    /// The request or response blob, whichever this variant carries.
    pub fn action_bytes(&self) -> &[u8] {
        match self {
            Self::Syn(p) => &p.action_payload,
            Self::SynAck(p) => &p.action_response_payload,
            Self::Data(p) => &p.action_payload,
            Self::DataAck(p) => &p.action_response_payload,
        }
    }

    /// `None` for Syn, which starts a chain.
    pub fn h_pointer(&self) -> Option<&str> {
        match self {
            Self::Syn(_) => None,
            Self::SynAck(p) => Some(&p.h_pointer),
            Self::Data(p) => Some(&p.h_pointer),
            Self::DataAck(p) => Some(&p.h_pointer),
        }
    }

    fn inner_type(&self) -> &str {
        match self {
            Self::Syn(p) => &p.kind,
            Self::SynAck(p) => &p.kind,
            Self::Data(p) => &p.kind,
            Self::DataAck(p) => &p.kind,
        }
    }

    pub fn to_value(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}

/// Signed wrapper: `{type, keysplittingPayload, signature}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawKeysplittingMessage", into = "RawKeysplittingMessage")]
pub struct KeysplittingMessage {
    pub payload: KeysplittingPayload,
    /// Base64 Ed25519 signature over the canonical hash of `payload`.
    pub signature: String,
}

impl KeysplittingMessage {
    pub fn unsigned(payload: KeysplittingPayload) -> Self {
        Self {
            payload,
            signature: String::new(),
        }
    }

    pub fn kind(&self) -> KeysplittingType {
        self.payload.kind()
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawKeysplittingMessage {
    #[serde(rename = "type")]
    kind: KeysplittingType,
    keysplitting_payload: Value,
    #[serde(default)]
    signature: String,
}

impl TryFrom<RawKeysplittingMessage> for KeysplittingMessage {
    type Error = Error;

    fn try_from(raw: RawKeysplittingMessage) -> Result<Self, Self::Error> {
        let payload = match raw.kind {
            KeysplittingType::Syn => {
                KeysplittingPayload::Syn(serde_json::from_value(raw.keysplitting_payload)?)
            }
            KeysplittingType::SynAck => {
                KeysplittingPayload::SynAck(serde_json::from_value(raw.keysplitting_payload)?)
            }
            KeysplittingType::Data => {
                KeysplittingPayload::Data(serde_json::from_value(raw.keysplitting_payload)?)
            }
            KeysplittingType::DataAck => {
                KeysplittingPayload::DataAck(serde_json::from_value(raw.keysplitting_payload)?)
            }
        };
        if payload.inner_type() != raw.kind.as_str() {
            return Err(Error::validation(format!(
                "payload type {} does not match message type {}",
                payload.inner_type(),
                raw.kind
            )));
        }
        Ok(Self {
            payload,
            signature: raw.signature,
        })
    }
}

impl From<KeysplittingMessage> for RawKeysplittingMessage {
    fn from(msg: KeysplittingMessage) -> Self {
        Self {
            kind: msg.payload.kind(),
            // Serializing plain structs of strings and byte vectors cannot fail.
            keysplitting_payload: msg.payload.to_value().unwrap_or(Value::Null),
            signature: msg.signature,
        }
    }
}
