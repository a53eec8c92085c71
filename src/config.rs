//! Configuration loading and defaults.
//!
//! Three sources feed a running process:
//!
//! 1. **Command line / environment**: [`DaemonArgs`] and [`AgentArgs`],
//!    resolved into [`DaemonConfig`] / [`AgentConfig`]. For the agent, the
//!    environment wins over flags (`SERVICE_URL`, `ORG_ID`, `CLUSTER_NAME`,
//!    `ENVIRONMENT`, `ACTIVATION_TOKEN`, `IDP_PROVIDER`, `CUSTOM_IDP`,
//!    `VAULT_PATH`).
//! 2. **Tunnel tuning**: optional TOML, path via `BCTL_TRANSPORT_CONFIG` or
//!    `bctl.toml` in CWD, falling back to compiled defaults:
//!
//! ```toml
//! reconnect_delay_secs = 5       # first retry after a dropped transport
//! reconnect_max_delay_secs = 30  # backoff cap
//! negotiate_timeout_secs = 30    # relay negotiate POST
//! channel_capacity = 256         # outbound frame queue per transport
//! ```
//!
//! 3. **Daemon keysplitting state**: the JSON file at `--configPath`
//!    ([`ClientConfigFile`]), written by the login flow and re-read before
//!    every Syn.

use std::path::{Path, PathBuf};

use clap::Args;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::keysplitting::oidc::{IdpProvider, OrgPolicy};

/// Flags for `bctl daemon`. All are required; they are optional here so every
/// missing one can be reported at once.
#[derive(Debug, Clone, Default, Args)]
pub struct DaemonArgs {
    #[arg(long = "sessionId")]
    pub session_id: Option<String>,
    #[arg(long = "authHeader")]
    pub auth_header: Option<String>,
    #[arg(long = "serviceURL")]
    pub service_url: Option<String>,
    #[arg(long = "assumeRole")]
    pub assume_role: Option<String>,
    #[arg(long = "assumeClusterId")]
    pub assume_cluster_id: Option<String>,
    #[arg(long = "environmentId")]
    pub environment_id: Option<String>,
    #[arg(long = "daemonPort")]
    pub daemon_port: Option<String>,
    #[arg(long = "localhostToken")]
    pub localhost_token: Option<String>,
    #[arg(long = "certPath")]
    pub cert_path: Option<String>,
    #[arg(long = "keyPath")]
    pub key_path: Option<String>,
    #[arg(long = "configPath")]
    pub config_path: Option<String>,
    #[arg(long = "logPath")]
    pub log_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub session_id: String,
    pub auth_header: String,
    pub service_url: String,
    pub assume_role: String,
    pub assume_cluster_id: String,
    pub environment_id: String,
    pub daemon_port: u16,
    pub localhost_token: String,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub config_path: PathBuf,
    pub log_path: PathBuf,
}

fn take(value: Option<String>, flag: &'static str, missing: &mut Vec<&'static str>) -> String {
    match value.filter(|v| !v.is_empty()) {
        Some(v) => v,
        None => {
            missing.push(flag);
            String::new()
        }
    }
}

impl DaemonConfig {
    /// Every absent flag is listed in the returned error.
    pub fn from_args(args: DaemonArgs) -> Result<Self> {
        let mut missing = Vec::new();
        let session_id = take(args.session_id, "sessionId", &mut missing);
        let auth_header = take(args.auth_header, "authHeader", &mut missing);
        let service_url = take(args.service_url, "serviceURL", &mut missing);
        let assume_role = take(args.assume_role, "assumeRole", &mut missing);
        let assume_cluster_id = take(args.assume_cluster_id, "assumeClusterId", &mut missing);
        let environment_id = take(args.environment_id, "environmentId", &mut missing);
        let daemon_port = take(args.daemon_port, "daemonPort", &mut missing);
        let localhost_token = take(args.localhost_token, "localhostToken", &mut missing);
        let cert_path = take(args.cert_path, "certPath", &mut missing);
        let key_path = take(args.key_path, "keyPath", &mut missing);
        let config_path = take(args.config_path, "configPath", &mut missing);
        let log_path = take(args.log_path, "logPath", &mut missing);

        if !missing.is_empty() {
            return Err(Error::startup(format!(
                "missing flags: {}",
                missing.join(", ")
            )));
        }

        let daemon_port = daemon_port
            .parse()
            .map_err(|_| Error::startup(format!("daemonPort is not a port number: {daemon_port}")))?;

        Ok(Self {
            session_id,
            auth_header,
            service_url,
            assume_role,
            assume_cluster_id,
            environment_id,
            daemon_port,
            localhost_token,
            cert_path: cert_path.into(),
            key_path: key_path.into(),
            config_path: config_path.into(),
            log_path: log_path.into(),
        })
    }
}

/// Flags for `bctl agent`. Environment variables of the same meaning override
/// them.
#[derive(Debug, Clone, Default, Args)]
pub struct AgentArgs {
    #[arg(long = "serviceUrl")]
    pub service_url: Option<String>,
    #[arg(long = "orgId")]
    pub org_id: Option<String>,
    #[arg(long = "clusterName")]
    pub cluster_name: Option<String>,
    #[arg(long = "environmentId")]
    pub environment_id: Option<String>,
    #[arg(long = "activationToken")]
    pub activation_token: Option<String>,
    /// `google`, `microsoft` or `custom`.
    #[arg(long = "idpProvider")]
    pub idp_provider: Option<String>,
    /// Issuer URL when `--idpProvider custom`.
    #[arg(long = "customIss")]
    pub custom_iss: Option<String>,
    /// Keep agent keys in this file instead of the cluster secret.
    #[arg(long = "vaultPath")]
    pub vault_path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub service_url: String,
    pub org_id: String,
    pub cluster_name: String,
    pub environment_id: String,
    pub activation_token: String,
    pub idp_provider: IdpProvider,
    pub vault_path: Option<PathBuf>,
}

impl AgentConfig {
    pub fn from_env(args: AgentArgs) -> Result<Self> {
        Self::resolve(args, |name| std::env::var(name).ok())
    }

    /// `env` looks up an override by variable name.
    pub fn resolve(args: AgentArgs, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let pick = |name: &str, flag: Option<String>| env(name).filter(|v| !v.is_empty()).or(flag);

        let mut missing = Vec::new();
        let service_url = take(pick("SERVICE_URL", args.service_url), "serviceUrl", &mut missing);
        let org_id = take(pick("ORG_ID", args.org_id), "orgId", &mut missing);
        let cluster_name = take(pick("CLUSTER_NAME", args.cluster_name), "clusterName", &mut missing);
        let environment_id = take(
            pick("ENVIRONMENT", args.environment_id),
            "environmentId",
            &mut missing,
        );
        let activation_token = take(
            pick("ACTIVATION_TOKEN", args.activation_token),
            "activationToken",
            &mut missing,
        );
        if !missing.is_empty() {
            return Err(Error::startup(format!(
                "missing flags: {}",
                missing.join(", ")
            )));
        }

        let provider_name =
            pick("IDP_PROVIDER", args.idp_provider).unwrap_or_else(|| "google".to_string());
        let custom_iss = pick("CUSTOM_IDP", args.custom_iss);
        let idp_provider = IdpProvider::parse(&provider_name, custom_iss.as_deref())?;

        Ok(Self {
            service_url,
            org_id,
            cluster_name,
            environment_id,
            activation_token,
            idp_provider,
            vault_path: pick("VAULT_PATH", args.vault_path).map(PathBuf::from),
        })
    }

    pub fn org_policy(&self) -> OrgPolicy {
        OrgPolicy {
            provider: self.idp_provider.clone(),
            org_id: self.org_id.clone(),
        }
    }
}

/// Relay transport tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportConfig {
    /// First reconnect delay in seconds (default 5).
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Backoff cap in seconds (default 30).
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_secs: u64,
    /// Timeout for the negotiate POST (default 30).
    #[serde(default = "default_negotiate_timeout")]
    pub negotiate_timeout_secs: u64,
    /// Bounded outbound queue per transport (default 256).
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_reconnect_delay() -> u64 {
    5
}
fn default_reconnect_max_delay() -> u64 {
    30
}
fn default_negotiate_timeout() -> u64 {
    30
}
fn default_channel_capacity() -> usize {
    256
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_secs: default_reconnect_delay(),
            reconnect_max_delay_secs: default_reconnect_max_delay(),
            negotiate_timeout_secs: default_negotiate_timeout(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl TransportConfig {
    /// `BCTL_TRANSPORT_CONFIG` if set, else `bctl.toml` in CWD, else defaults.
    pub fn load() -> Result<Self> {
        match std::env::var("BCTL_TRANSPORT_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path)),
            Err(_) if Path::new("bctl.toml").exists() => Self::from_file(Path::new("bctl.toml")),
            Err(_) => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::startup(format!("failed to read config file {}: {e}", path.display()))
        })?;
        toml::from_str(&content).map_err(|e| {
            Error::startup(format!("failed to parse config file {}: {e}", path.display()))
        })
    }
}

/// The daemon's persisted login state.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfigFile {
    pub key_splitting: KeySplittingConfig,
    pub token_set: TokenSetConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySplittingConfig {
    pub private_key: String,
    pub public_key: String,
    pub cer_rand: String,
    pub cer_rand_sig: String,
    pub initial_id_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenSetConfig {
    #[serde(rename = "id_token")]
    pub current_id_token: String,
}

impl ClientConfigFile {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read(path)?;
        Ok(serde_json::from_slice(&content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn full_daemon_args() -> DaemonArgs {
        DaemonArgs {
            session_id: Some("s".into()),
            auth_header: Some("Bearer x".into()),
            service_url: Some("relay.example.com".into()),
            assume_role: Some("dev".into()),
            assume_cluster_id: Some("c1".into()),
            environment_id: Some("e1".into()),
            daemon_port: Some("6443".into()),
            localhost_token: Some("tok".into()),
            cert_path: Some("/tmp/c.pem".into()),
            key_path: Some("/tmp/k.pem".into()),
            config_path: Some("/tmp/config.json".into()),
            log_path: Some("/tmp/bctl.log".into()),
        }
    }

    #[test]
    fn test_daemon_config_complete() {
        let cfg = DaemonConfig::from_args(full_daemon_args()).unwrap();
        assert_eq!(cfg.daemon_port, 6443);
        assert_eq!(cfg.assume_role, "dev");
    }

    #[test]
    fn test_daemon_config_lists_every_missing_flag() {
        let mut args = full_daemon_args();
        args.session_id = None;
        args.log_path = Some(String::new());
        let err = DaemonConfig::from_args(args).unwrap_err().to_string();
        assert!(err.contains("sessionId"));
        assert!(err.contains("logPath"));
        assert!(!err.contains("certPath"));
    }

    #[test]
    fn test_agent_env_overrides_flags() {
        let args = AgentArgs {
            service_url: Some("flag-url".into()),
            org_id: Some("flag-org".into()),
            cluster_name: Some("c".into()),
            environment_id: Some("e".into()),
            activation_token: Some("a".into()),
            ..Default::default()
        };
        let env: HashMap<&str, &str> = [("ORG_ID", "env-org"), ("IDP_PROVIDER", "microsoft")]
            .into_iter()
            .collect();
        let cfg = AgentConfig::resolve(args, |k| env.get(k).map(ToString::to_string)).unwrap();
        assert_eq!(cfg.service_url, "flag-url");
        assert_eq!(cfg.org_id, "env-org");
        assert_eq!(cfg.idp_provider, IdpProvider::Microsoft);
        assert!(cfg.vault_path.is_none());
    }

    #[test]
    fn test_agent_missing_values_fatal() {
        let err = AgentConfig::resolve(AgentArgs::default(), |_| None).unwrap_err();
        assert_eq!(err.error_type(), crate::error::ErrorType::ComponentStartupError);
        assert!(err.to_string().contains("activationToken"));
    }

    #[test]
    fn test_transport_defaults_and_partial_toml() {
        let d = TransportConfig::default();
        assert_eq!(d.reconnect_delay_secs, 5);
        assert_eq!(d.reconnect_max_delay_secs, 30);

        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "reconnect_max_delay_secs = 10").unwrap();
        let cfg = TransportConfig::from_file(f.path()).unwrap();
        assert_eq!(cfg.reconnect_max_delay_secs, 10);
        assert_eq!(cfg.reconnect_delay_secs, 5);
        assert_eq!(cfg.channel_capacity, 256);
    }

    #[test]
    fn test_client_config_with_seed_key_loads_identity() {
        use crate::keysplitting::bzcert::testing::cert_for;
        use crate::keysplitting::{ClientIdentity, KeyPair};
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;

        let keys = KeyPair::generate();
        let cert = cert_for(&keys);
        let seed = STANDARD.encode(&STANDARD.decode(keys.private_key_b64()).unwrap()[..32]);
        let body = serde_json::json!({
            "keySplitting": {
                "privateKey": seed,
                "publicKey": keys.public_key_b64(),
                "cerRand": cert.rand,
                "cerRandSig": cert.signature_on_rand,
                "initialIdToken": cert.initial_id_token,
            },
            "tokenSet": {"id_token": cert.current_id_token},
        });
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(body.to_string().as_bytes()).unwrap();

        let identity = ClientIdentity::load(f.path()).unwrap();
        assert_eq!(identity.keys.private_key_b64(), keys.private_key_b64());
        assert_eq!(identity.cert, cert);
    }
}
