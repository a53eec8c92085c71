//! First-start registration of a freshly generated agent key.

use tracing::info;

use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::keysplitting::KeyPair;
use crate::message::control::RegisterAgentMessage;
use crate::transport::service_host;

pub const REGISTER_ENDPOINT: &str = "/api/v1/kube/register-agent";
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn register_message(config: &AgentConfig, keys: &KeyPair) -> RegisterAgentMessage {
    RegisterAgentMessage {
        public_key: keys.public_key_b64(),
        activation_code: config.activation_token.clone(),
        agent_version: AGENT_VERSION.to_string(),
        org_id: config.org_id.clone(),
        environment_id: config.environment_id.clone(),
        cluster_name: config.cluster_name.clone(),
    }
}

/// Announce the agent's public key. Anything but 200 is fatal.
pub async fn register(http: &reqwest::Client, config: &AgentConfig, keys: &KeyPair) -> Result<()> {
    let url = format!("https://{}{REGISTER_ENDPOINT}", service_host(&config.service_url));
    info!("Registration: registering agent with {url}");
    let response = http
        .post(&url)
        .json(&register_message(config, keys))
        .send()
        .await?;
    if response.status() != reqwest::StatusCode::OK {
        return Err(Error::startup(format!(
            "agent registration failed with status {}",
            response.status()
        )));
    }
    info!("Registration: agent registered");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_message_wire_shape() {
        let config = AgentConfig {
            service_url: "relay.example.com".into(),
            org_id: "org".into(),
            cluster_name: "prod".into(),
            environment_id: "env".into(),
            activation_token: "act".into(),
            idp_provider: crate::keysplitting::oidc::IdpProvider::Google,
            vault_path: None,
        };
        let keys = KeyPair::generate();
        let v = serde_json::to_value(register_message(&config, &keys)).unwrap();
        assert_eq!(v["activationCode"], "act");
        assert_eq!(v["clusterName"], "prod");
        assert_eq!(v["publicKey"], keys.public_key_b64());
        assert_eq!(v["agentVersion"], AGENT_VERSION);
    }
}
