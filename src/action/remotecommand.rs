//! Kubernetes remote-command websocket framing (`v4`/`v5.channel.k8s.io`).
//!
//! Every binary frame starts with a channel byte. The error channel carries a
//! `metav1.Status` object once, when the command ends.

use serde_json::{json, Value};

pub const STDIN: u8 = 0;
pub const STDOUT: u8 = 1;
pub const STDERR: u8 = 2;
pub const ERROR: u8 = 3;
pub const RESIZE: u8 = 4;
/// v5 only: `[CLOSE, channel]` half-closes that channel.
pub const CLOSE: u8 = 255;

pub const V5_PROTOCOL: &str = "v5.channel.k8s.io";
pub const V4_PROTOCOL: &str = "v4.channel.k8s.io";

pub fn frame(channel: u8, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 1);
    out.push(channel);
    out.extend_from_slice(data);
    out
}

pub fn success_status() -> Vec<u8> {
    json!({"metadata": {}, "status": "Success"}).to_string().into_bytes()
}

pub fn failure_status(message: &str) -> Vec<u8> {
    json!({
        "metadata": {},
        "status": "Failure",
        "message": message,
        "reason": "InternalError",
        "code": 500,
    })
    .to_string()
    .into_bytes()
}

/// Status to write on the error channel for an exit payload: a forwarded
/// Status object as is, plain text wrapped as a failure, empty as success.
pub fn exit_status(content: &[u8]) -> Vec<u8> {
    if content.is_empty() {
        return success_status();
    }
    match serde_json::from_slice::<Value>(content) {
        Ok(v) if v.get("status").is_some() => content.to_vec(),
        _ => failure_status(&String::from_utf8_lossy(content)),
    }
}
