//! Crate-wide error type.
//!
//! Every failure maps onto one of the four wire error classes carried in an
//! `error` envelope (see [`ErrorType`]), so a data channel can turn any
//! [`Error`] straight into an [`ErrorMessage`](crate::message::ErrorMessage).

use serde::{Deserialize, Serialize};

/// Wire taxonomy for `error` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorType {
    /// Signature, hash pointer, bzcert, nonce or token expiry failures.
    KeysplittingValidationError,
    /// The action itself failed (cluster API call, upgrade, stream read).
    KeysplittingExecutionError,
    /// Transport negotiation refused, config missing.
    ComponentStartupError,
    /// Unrecognized envelope, unknown request id, malformed JSON.
    ComponentProcessingError,
}

impl ErrorType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::KeysplittingValidationError => "KeysplittingValidationError",
            Self::KeysplittingExecutionError => "KeysplittingExecutionError",
            Self::ComponentStartupError => "ComponentStartupError",
            Self::ComponentProcessingError => "ComponentProcessingError",
        }
    }
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("startup failed: {0}")]
    Startup(String),

    #[error("processing failed: {0}")]
    Processing(String),

    /// The relay or the peer closed the channel, with an optional reason.
    #[error("connection closed{}", .0.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
    Closed(Option<String>),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("signature: {0}")]
    Signature(#[from] ed25519_dalek::SignatureError),

    #[error("id token: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn execution(msg: impl Into<String>) -> Self {
        Self::Execution(msg.into())
    }

    pub fn startup(msg: impl Into<String>) -> Self {
        Self::Startup(msg.into())
    }

    pub fn processing(msg: impl Into<String>) -> Self {
        Self::Processing(msg.into())
    }

    /// Wire class used when this error is reported to the peer.
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::Validation(_) | Self::Signature(_) | Self::Jwt(_) => {
                ErrorType::KeysplittingValidationError
            }
            Self::Execution(_) | Self::Http(_) | Self::WebSocket(_) | Self::Io(_) => {
                ErrorType::KeysplittingExecutionError
            }
            Self::Startup(_) => ErrorType::ComponentStartupError,
            Self::Processing(_) | Self::Closed(_) | Self::Json(_) | Self::Base64(_) => {
                ErrorType::ComponentProcessingError
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
