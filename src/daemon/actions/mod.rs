//! Local-side halves of the `kube` actions. Each one owns a [`Session`]
//! for the life of its local request.
//!
//! [`Session`]: super::Session

pub mod exec;
pub mod rest;
pub mod stream;

use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::debug;

use super::datachannel::DataChannel;
use crate::action::payloads::StopRequest;

/// How long a stop waits for its acknowledgement before the session is
/// torn down anyway.
pub const STOP_GRACE: Duration = Duration::from_secs(1);

/// The 500 kubectl shows when a session dies before its response started.
pub fn bastion_closed(reason: Option<&str>) -> Response {
    let message = format!(
        "Daemon connection has been closed by Bastion. Message: {}",
        reason.unwrap_or("connection closed")
    );
    (StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
}

/// Send `stop_action` and give the agent [`STOP_GRACE`] to acknowledge it.
pub async fn stop(channel: &mut DataChannel, stop_action: &str, request_id: &str, log_id: &str) {
    let body = StopRequest {
        request_id: request_id.to_string(),
        log_id: log_id.to_string(),
    };
    let payload = match serde_json::to_vec(&body) {
        Ok(payload) => payload,
        Err(e) => {
            debug!("Session: could not encode {stop_action}: {e}");
            return;
        }
    };
    if let Err(e) = channel.request(stop_action, payload).await {
        debug!("Session: could not send {stop_action}: {e}");
        return;
    }
    match tokio::time::timeout(STOP_GRACE, channel.wait_ack(stop_action)).await {
        Ok(Ok(_)) => debug!("Session: {stop_action} acknowledged"),
        Ok(Err(reason)) => debug!("Session: ended before {stop_action} was acknowledged: {reason:?}"),
        Err(_) => debug!("Session: no acknowledgement for {stop_action}"),
    }
}
