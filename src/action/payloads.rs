//! JSON bodies carried in `actionPayload` / `actionResponsePayload`.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::message::bytes_field;

/// `bodyEncoding` of a [`KubeRequest`] whose body is not UTF-8.
pub const BASE64_BODY: &str = "base64";

/// Multi-valued HTTP headers as they travel on the wire.
pub type HeaderMap = BTreeMap<String, Vec<String>>;

/// `kube/restapi` request, also the body of `kube/{log,watch,stream}/start`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubeRequest {
    pub endpoint: String,
    #[serde(default)]
    pub headers: HeaderMap,
    pub method: String,
    #[serde(default)]
    pub body: String,
    /// Absent for text bodies, which travel as-is.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_encoding: Option<String>,
    pub request_id: String,
    #[serde(default)]
    pub command_being_run: String,
    #[serde(default)]
    pub log_id: String,
}

impl KubeRequest {
    /// Store `bytes` as text when they are UTF-8, base64 otherwise.
    pub fn set_body(&mut self, bytes: Vec<u8>) {
        match String::from_utf8(bytes) {
            Ok(text) => {
                self.body = text;
                self.body_encoding = None;
            }
            Err(e) => {
                self.body = STANDARD.encode(e.as_bytes());
                self.body_encoding = Some(BASE64_BODY.to_string());
            }
        }
    }

    /// The body as sent by the operator.
    pub fn body_bytes(&self) -> Result<Vec<u8>> {
        match self.body_encoding.as_deref() {
            None => Ok(self.body.clone().into_bytes()),
            Some(BASE64_BODY) => STANDARD
                .decode(self.body.as_bytes())
                .map_err(|e| Error::processing(format!("malformed base64 request body: {e}"))),
            Some(other) => Err(Error::processing(format!(
                "unsupported request body encoding: {other}"
            ))),
        }
    }
}

/// `kube/restapi` DataAck body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestApiResponse {
    pub status_code: u16,
    pub request_id: String,
    #[serde(default)]
    pub headers: HeaderMap,
    #[serde(with = "bytes_field", default)]
    pub content: Vec<u8>,
}

/// Content of a stream's sequence 0 envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHeaders {
    #[serde(rename = "Headers", default)]
    pub headers: HeaderMap,
    #[serde(rename = "StatusCode", default = "ok_status")]
    pub status_code: u16,
}

fn ok_status() -> u16 {
    200
}

/// `kube/{log,watch,stream,exec}/stop`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopRequest {
    pub request_id: String,
    #[serde(default)]
    pub log_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecStartRequest {
    pub request_id: String,
    #[serde(default)]
    pub log_id: String,
    pub command: Vec<String>,
    pub endpoint: String,
    #[serde(default)]
    pub command_being_run: String,
    #[serde(default)]
    pub is_tty: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecInputRequest {
    pub request_id: String,
    #[serde(default)]
    pub log_id: String,
    #[serde(with = "bytes_field")]
    pub stdin: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    #[serde(alias = "Width")]
    pub width: u16,
    #[serde(alias = "Height")]
    pub height: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecResizeRequest {
    pub request_id: String,
    #[serde(default)]
    pub log_id: String,
    pub width: u16,
    pub height: u16,
}

/// Collapse a multi-valued map into (name, value) pairs, dropping
/// `Content-Length` which the local server recomputes.
pub fn header_pairs(headers: &HeaderMap) -> impl Iterator<Item = (&str, &str)> {
    headers
        .iter()
        .filter(|(name, _)| !name.eq_ignore_ascii_case("content-length"))
        .flat_map(|(name, values)| values.iter().map(move |v| (name.as_str(), v.as_str())))
}
