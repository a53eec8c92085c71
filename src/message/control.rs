//! Control-channel and agent-registration messages.

use serde::{Deserialize, Serialize};

/// Relay asks the agent to open a data channel for a daemon session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDatachannelMessage {
    pub connection_id: String,
    pub role: String,
    pub token: String,
}

/// Agent's answer to a `healthcheck`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AliveCheckMessage {
    pub alive: bool,
    pub cluster_users: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterAgentMessage {
    pub public_key: String,
    pub activation_code: String,
    pub agent_version: String,
    pub org_id: String,
    pub environment_id: String,
    pub cluster_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetChallengeMessage {
    pub org_id: String,
    pub cluster_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetChallengeResponse {
    pub challenge: String,
}

/// Payload of the relay's `CloseConnection` invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CloseMessage {
    #[serde(default)]
    pub message: String,
}
