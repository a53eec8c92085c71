//! Localhost token check on every ingress request.
//!
//! kubectl sends `Authorization: Bearer <token>[++++<command>++++<logId>]`.
//! The token must equal the daemon's `--localhostToken`; the two optional
//! segments are audit metadata forwarded with every action.

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::warn;
use uuid::Uuid;

pub const AUTH_FAILURE: &str =
    "Localhost token did not validate. Ensure you are using the right Kube config file!";
const AUDIT_SEPARATOR: &str = "++++";

/// What the operator's kubeconfig told us about the command being run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Audit {
    pub command: String,
    pub log_id: String,
}

/// Expected token, injected as a router extension.
#[derive(Clone)]
pub struct LocalhostToken(pub String);

/// Rejects requests whose token does not match with 500, which is what
/// kubectl surfaces to the operator. Accepted requests carry an [`Audit`]
/// extension.
pub async fn require_localhost_token(mut request: Request, next: Next) -> Response {
    let Some(LocalhostToken(expected)) = request.extensions().get::<LocalhostToken>().cloned()
    else {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Server configuration error").into_response();
    };

    let header = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok());

    match authorize(header, &expected) {
        Some(audit) => {
            request.extensions_mut().insert(audit);
            next.run(request).await
        }
        None => {
            warn!("Auth: rejected request for {}", request.uri().path());
            (StatusCode::INTERNAL_SERVER_ERROR, AUTH_FAILURE).into_response()
        }
    }
}

/// `None` unless the header carries the expected token.
pub fn authorize(header: Option<&str>, expected: &str) -> Option<Audit> {
    let token = header?.strip_prefix("Bearer ")?;
    let mut segments = token.split(AUDIT_SEPARATOR);
    let presented = segments.next().unwrap_or_default();
    if !constant_time_eq(expected.as_bytes(), presented.as_bytes()) {
        return None;
    }

    Some(match (segments.next(), segments.next()) {
        (Some(command), Some(log_id)) => Audit {
            command: command.to_string(),
            log_id: log_id.to_string(),
        },
        _ => Audit {
            command: "N/A".to_string(),
            log_id: Uuid::new_v4().to_string(),
        },
    })
}

/// Compares over the full length of `expected` whatever `provided` is.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        diff |= e ^ provided.get(i).copied().unwrap_or(0xff);
    }
    diff == 0
}
