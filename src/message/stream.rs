//! Sequence-numbered stream envelopes for long-lived actions.

use serde::{Deserialize, Serialize};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::Result;

/// Known stream message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    ExecStdout,
    ExecStderr,
    /// Agent-side end of an exec session; content is the optional reason.
    ExecExit,
    LogStdout,
    WatchStdout,
    StreamStdout,
    /// Cluster body reached EOF; sequenced after the last body chunk.
    StreamEnd,
}

impl StreamType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ExecStdout => "kube/exec/stdout",
            Self::ExecStderr => "kube/exec/stderr",
            Self::ExecExit => "kube/exec/exit",
            Self::LogStdout => "kube/log/stdout",
            Self::WatchStdout => "kube/watch/stdout",
            Self::StreamStdout => "kube/stream/stdout",
            Self::StreamEnd => "kube/stream/end",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "kube/exec/stdout" => Some(Self::ExecStdout),
            "kube/exec/stderr" => Some(Self::ExecStderr),
            "kube/exec/exit" => Some(Self::ExecExit),
            "kube/log/stdout" => Some(Self::LogStdout),
            "kube/watch/stdout" => Some(Self::WatchStdout),
            "kube/stream/stdout" => Some(Self::StreamStdout),
            "kube/stream/end" => Some(Self::StreamEnd),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub request_id: String,
    pub log_id: String,
    #[serde(rename = "sequenceId")]
    pub sequence_number: u64,
    /// Base64 of the raw bytes.
    pub content: String,
}

impl StreamMessage {
    pub fn new(
        kind: StreamType,
        request_id: &str,
        log_id: &str,
        sequence_number: u64,
        content: &[u8],
    ) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            request_id: request_id.to_string(),
            log_id: log_id.to_string(),
            sequence_number,
            content: STANDARD.encode(content),
        }
    }

    pub fn stream_type(&self) -> Option<StreamType> {
        StreamType::parse(&self.kind)
    }

    pub fn decode_content(&self) -> Result<Vec<u8>> {
        Ok(STANDARD.decode(self.content.as_bytes())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_message_wire_shape() {
        let msg = StreamMessage::new(StreamType::LogStdout, "req", "log", 3, b"hello");
        let v = serde_json::to_value(&msg).unwrap();
        assert_eq!(v["type"], "kube/log/stdout");
        assert_eq!(v["requestId"], "req");
        assert_eq!(v["logId"], "log");
        assert_eq!(v["sequenceId"], 3);
        assert_eq!(v["content"], "aGVsbG8=");
        assert_eq!(msg.decode_content().unwrap(), b"hello");
    }

    #[test]
    fn test_in_band_escape_is_plain_output() {
        let msg = StreamMessage::new(StreamType::ExecStdout, "r", "l", 1, b"^[");
        assert_eq!(msg.stream_type(), Some(StreamType::ExecStdout));
        assert_eq!(msg.decode_content().unwrap(), b"^[");
    }
}
