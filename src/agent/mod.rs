//! The cluster side of the tunnel.
//!
//! ```text
//! agent/
//!   mod.rs             startup: keys, registration, OIDC keys, control channel
//!   controlchannel.rs  liveness + data channel provisioning
//!   datachannel.rs     keysplitting server for one daemon session
//!   actions/           kube plugin (restapi, exec, log/watch/stream)
//!   kube.rs            in-cluster API client with impersonation
//!   vault.rs           persisted agent keys (secret or file)
//!   health.rs          healthcheck reply
//!   registration.rs    first-start key registration
//! ```

pub mod actions;
pub mod controlchannel;
pub mod datachannel;
pub mod health;
pub mod kube;
pub mod registration;
pub mod vault;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{AgentConfig, TransportConfig};
use crate::error::Result;
use crate::keysplitting::oidc::{IdTokenVerifier, JwksVerifier, OrgPolicy};
use crate::keysplitting::{AgentKeysplitting, KeyPair};
use crate::transport::target::agent_target;
use crate::transport::websocket::ChallengeParams;
use crate::transport::{HubOptions, Websocket};

use controlchannel::{relay_opener, ControlChannel, CONTROL_HUB};
use kube::KubeClient;
use registration::{register, AGENT_VERSION};
use vault::{load_or_create, FileVault, SecretVault, Vault};

const JWKS_REFRESH: Duration = Duration::from_secs(60 * 60);
const REGISTRATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything a data channel needs that outlives it.
pub struct AgentContext {
    pub keys: Arc<KeyPair>,
    pub tokens: Arc<dyn IdTokenVerifier>,
    pub policy: Arc<OrgPolicy>,
    pub kube: Arc<KubeClient>,
}

impl AgentContext {
    /// A fresh keysplitting engine; one per data channel.
    pub fn keysplitting(&self) -> AgentKeysplitting {
        AgentKeysplitting::new(self.keys.clone(), self.tokens.clone(), self.policy.clone())
    }
}

/// Run the agent until `cancel` fires or the control channel ends.
pub async fn run(
    config: AgentConfig,
    transport_config: TransportConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let kube = Arc::new(KubeClient::in_cluster()?);
    info!(
        cluster = %config.cluster_name,
        namespace = %kube.namespace(),
        "Agent: starting"
    );

    let vault = match &config.vault_path {
        Some(path) => Vault::File(FileVault::new(path)),
        None => Vault::Secret(SecretVault::new(kube.clone(), &config.cluster_name)),
    };
    let (keys, created) = load_or_create(&vault).await?;
    let keys = Arc::new(keys);
    if created {
        let http = reqwest::Client::builder()
            .timeout(REGISTRATION_TIMEOUT)
            .build()?;
        register(&http, &config, &keys).await?;
    }

    let policy = Arc::new(config.org_policy());
    let jwks = Arc::new(JwksVerifier::discover(&policy.issuer()).await?);
    let refresh = jwks.clone().spawn_refresh(JWKS_REFRESH);

    let context = Arc::new(AgentContext {
        keys: keys.clone(),
        tokens: jwks,
        policy,
        kube,
    });

    let control = Websocket::new(control_hub(&config, &keys), agent_target, transport_config.clone())?
        .connect(cancel.child_token())
        .await?;
    info!("Agent: control channel connected");

    let opener = relay_opener(config.service_url.clone(), transport_config);
    let outcome = ControlChannel::new(control, context, opener).run(cancel).await;
    refresh.abort();
    outcome
}

fn control_hub(config: &AgentConfig, keys: &Arc<KeyPair>) -> HubOptions {
    HubOptions {
        service_url: config.service_url.clone(),
        hub_endpoint: CONTROL_HUB.to_string(),
        params: vec![
            ("public_key".to_string(), keys.public_key_b64()),
            ("agent_version".to_string(), AGENT_VERSION.to_string()),
            ("org_id".to_string(), config.org_id.clone()),
            ("cluster_name".to_string(), config.cluster_name.clone()),
            ("environment_id".to_string(), config.environment_id.clone()),
        ],
        headers: Vec::new(),
        auto_reconnect: true,
        challenge: Some(ChallengeParams {
            org_id: config.org_id.clone(),
            cluster_name: config.cluster_name.clone(),
            keys: keys.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keysplitting::oidc::IdpProvider;

    #[test]
    fn test_control_hub_carries_identity_and_challenge() {
        let config = AgentConfig {
            service_url: "https://relay.example.com".into(),
            org_id: "org".into(),
            cluster_name: "prod".into(),
            environment_id: "env".into(),
            activation_token: "act".into(),
            idp_provider: IdpProvider::Google,
            vault_path: None,
        };
        let keys = Arc::new(KeyPair::generate());
        let hub = control_hub(&config, &keys);
        assert_eq!(hub.hub_endpoint, "/api/v1/hub/kube-control");
        assert!(hub.auto_reconnect);
        assert!(hub
            .params
            .contains(&("public_key".to_string(), keys.public_key_b64())));
        assert!(hub
            .params
            .contains(&("cluster_name".to_string(), "prod".to_string())));
        assert_eq!(hub.challenge.unwrap().cluster_name, "prod");
    }
}
