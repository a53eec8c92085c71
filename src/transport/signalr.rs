//! SignalR JSON hub protocol, the subset the relay speaks.
//!
//! Every record is a JSON object terminated by 0x1E; one websocket frame may
//! carry several. Only invocations (`type: 1`) carry envelopes; the
//! `CloseConnection` invocation and the protocol-level close (`type: 7`) end
//! the connection. Pings and the handshake ack are ignored.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::message::control::CloseMessage;
use crate::message::AgentMessage;

pub const RECORD_SEPARATOR: u8 = 0x1E;
pub const INVOCATION: u8 = 1;
pub const PING: u8 = 6;
pub const CLOSE: u8 = 7;
pub const CLOSE_CONNECTION_TARGET: &str = "CloseConnection";

#[derive(Debug, Serialize, Deserialize)]
struct Record {
    #[serde(rename = "type", default)]
    kind: u8,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    target: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    arguments: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, PartialEq)]
pub enum Inbound {
    Message(AgentMessage),
    /// The relay is closing this connection.
    Close(Option<String>),
    Ignored,
}

/// First frame after the upgrade.
pub fn handshake_frame() -> Vec<u8> {
    let mut frame = br#"{"protocol":"json","version":1}"#.to_vec();
    frame.push(RECORD_SEPARATOR);
    frame
}

pub fn ping_frame() -> Vec<u8> {
    let mut frame = format!(r#"{{"type":{PING}}}"#).into_bytes();
    frame.push(RECORD_SEPARATOR);
    frame
}

/// Wrap an envelope as an invocation of `target`.
pub fn encode(target: &str, msg: &AgentMessage) -> Result<Vec<u8>> {
    let record = Record {
        kind: INVOCATION,
        target: target.to_string(),
        arguments: vec![serde_json::to_value(msg)?],
        error: None,
    };
    let mut frame = serde_json::to_vec(&record)?;
    frame.push(RECORD_SEPARATOR);
    Ok(frame)
}

/// Records in one websocket frame, separators stripped, empties skipped.
pub fn split_records(raw: &[u8]) -> impl Iterator<Item = &[u8]> {
    raw.split(|b| *b == RECORD_SEPARATOR)
        .filter(|r| !r.iter().all(u8::is_ascii_whitespace))
}

pub fn decode(record: &[u8]) -> Result<Inbound> {
    let record: Record = serde_json::from_slice(record)?;
    match record.kind {
        INVOCATION => {
            let Some(first) = record.arguments.into_iter().next() else {
                return Ok(Inbound::Ignored);
            };
            let msg: AgentMessage = serde_json::from_value(first)?;
            if record.target == CLOSE_CONNECTION_TARGET {
                let reason = msg
                    .payload::<CloseMessage>()
                    .ok()
                    .map(|c| c.message)
                    .filter(|m| !m.is_empty());
                return Ok(Inbound::Close(reason));
            }
            Ok(Inbound::Message(msg))
        }
        CLOSE => Ok(Inbound::Close(record.error.filter(|e| !e.is_empty()))),
        _ => Ok(Inbound::Ignored),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;
    use serde_json::json;

    #[test]
    fn test_handshake_and_ping_frames() {
        assert_eq!(handshake_frame().last(), Some(&0x1E));
        let ping = ping_frame();
        let body: Value = serde_json::from_slice(&ping[..ping.len() - 1]).unwrap();
        assert_eq!(body, json!({"type": 6}));
    }

    #[test]
    fn test_encode_wraps_invocation() {
        let msg = AgentMessage::new(MessageType::Stream, &json!({"a": 1})).unwrap();
        let frame = encode("ResponseLogClusterToBastion", &msg).unwrap();
        assert_eq!(*frame.last().unwrap(), RECORD_SEPARATOR);
        let v: Value = serde_json::from_slice(&frame[..frame.len() - 1]).unwrap();
        assert_eq!(v["type"], 1);
        assert_eq!(v["target"], "ResponseLogClusterToBastion");
        assert_eq!(v["arguments"][0]["messageType"], "stream");
    }

    #[test]
    fn test_concatenated_records_split() {
        let msg = AgentMessage::new(MessageType::HealthCheck, &json!({})).unwrap();
        let mut raw = b"{}\x1e".to_vec();
        raw.extend(encode("X", &msg).unwrap());
        raw.extend(encode("Y", &msg).unwrap());

        let decoded: Vec<Inbound> = split_records(&raw).map(|r| decode(r).unwrap()).collect();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0], Inbound::Ignored);
        assert_eq!(decoded[1], Inbound::Message(msg.clone()));
        assert_eq!(decoded[2], Inbound::Message(msg));
    }

    #[test]
    fn test_non_invocations_ignored() {
        assert_eq!(decode(br#"{"type":6}"#).unwrap(), Inbound::Ignored);
        assert_eq!(
            decode(br#"{"type":3,"invocationId":"1"}"#).unwrap(),
            Inbound::Ignored
        );
    }

    #[test]
    fn test_close_connection_carries_reason() {
        let close = AgentMessage::new(
            MessageType::Error,
            &json!({"message": "cluster went away"}),
        )
        .unwrap();
        let frame = encode(CLOSE_CONNECTION_TARGET, &close).unwrap();
        let record = split_records(&frame).next().unwrap();
        assert_eq!(
            decode(record).unwrap(),
            Inbound::Close(Some("cluster went away".into()))
        );

        assert_eq!(
            decode(br#"{"type":7,"error":"Server timeout"}"#).unwrap(),
            Inbound::Close(Some("Server timeout".into()))
        );
        assert_eq!(decode(br#"{"type":7}"#).unwrap(), Inbound::Close(None));
    }
}
