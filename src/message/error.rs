//! Error envelope.

use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorType};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    #[serde(rename = "type")]
    pub kind: ErrorType,
    pub message: String,
    /// Hash of the payload that failed, or the last hash this side sent.
    pub h_pointer: String,
}

impl ErrorMessage {
    pub fn from_error(err: &Error, h_pointer: impl Into<String>) -> Self {
        Self {
            kind: err.error_type(),
            message: err.to_string(),
            h_pointer: h_pointer.into(),
        }
    }
}
