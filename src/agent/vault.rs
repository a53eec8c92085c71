//! Persistent storage for the agent's Ed25519 keypair.
//!
//! In a cluster the keys live in a secret in the agent's own namespace,
//! `bctl-<cluster>-secret`, under the data key `keyConfig`. Outside a
//! cluster a plain JSON file does the same job.

use std::path::PathBuf;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use super::kube::KubeClient;
use crate::error::{Error, Result};
use crate::keysplitting::KeyPair;

pub const SECRET_DATA_KEY: &str = "keyConfig";

/// What is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredKeys {
    pub public_key: String,
    pub private_key: String,
}

impl StoredKeys {
    pub fn from_keys(keys: &KeyPair) -> Self {
        Self {
            public_key: keys.public_key_b64(),
            private_key: keys.private_key_b64(),
        }
    }

    pub fn to_keys(&self) -> Result<KeyPair> {
        KeyPair::from_base64(&self.private_key, &self.public_key)
    }
}

pub fn secret_name(cluster_name: &str) -> String {
    format!("bctl-{cluster_name}-secret")
}

pub enum Vault {
    Secret(SecretVault),
    File(FileVault),
}

impl Vault {
    /// `None` when nothing has been stored yet.
    pub async fn load(&self) -> Result<Option<StoredKeys>> {
        match self {
            Self::Secret(v) => v.load().await,
            Self::File(v) => v.load().await,
        }
    }

    pub async fn save(&self, keys: &StoredKeys) -> Result<()> {
        match self {
            Self::Secret(v) => v.save(keys).await,
            Self::File(v) => v.save(keys).await,
        }
    }
}

pub struct SecretVault {
    kube: Arc<KubeClient>,
    name: String,
}

impl SecretVault {
    pub fn new(kube: Arc<KubeClient>, cluster_name: &str) -> Self {
        Self {
            kube,
            name: secret_name(cluster_name),
        }
    }

    fn secret_path(&self) -> String {
        format!(
            "/api/v1/namespaces/{}/secrets/{}",
            self.kube.namespace(),
            self.name
        )
    }

    async fn load(&self) -> Result<Option<StoredKeys>> {
        let response = self
            .kube
            .as_agent(Method::GET, &self.secret_path())
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Error::startup(format!(
                "reading secret {} failed with status {}",
                self.name,
                response.status()
            )));
        }
        let secret: Value = response.json().await?;
        decode_secret(&secret)
    }

    async fn save(&self, keys: &StoredKeys) -> Result<()> {
        let encoded = STANDARD.encode(serde_json::to_vec(keys)?);
        let body = json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": { "name": self.name, "namespace": self.kube.namespace() },
            "data": { SECRET_DATA_KEY: encoded },
        });

        let response = self
            .kube
            .as_agent(Method::PUT, &self.secret_path())
            .json(&body)
            .send()
            .await?;
        let status = if response.status() == StatusCode::NOT_FOUND {
            let create = format!("/api/v1/namespaces/{}/secrets", self.kube.namespace());
            self.kube
                .as_agent(Method::POST, &create)
                .json(&body)
                .send()
                .await?
                .status()
        } else {
            response.status()
        };
        if !status.is_success() {
            return Err(Error::startup(format!(
                "writing secret {} failed with status {status}",
                self.name
            )));
        }
        info!(secret = %self.name, "Vault: stored agent keys");
        Ok(())
    }
}

/// Keys from a Secret object; `None` if the data key is absent.
fn decode_secret(secret: &Value) -> Result<Option<StoredKeys>> {
    let Some(encoded) = secret
        .get("data")
        .and_then(|d| d.get(SECRET_DATA_KEY))
        .and_then(Value::as_str)
    else {
        return Ok(None);
    };
    let raw = STANDARD.decode(encoded)?;
    Ok(Some(serde_json::from_slice(&raw)?))
}

pub struct FileVault {
    path: PathBuf,
}

impl FileVault {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> Result<Option<StoredKeys>> {
        match tokio::fs::read(&self.path).await {
            Ok(raw) if raw.iter().all(u8::is_ascii_whitespace) => Ok(None),
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, keys: &StoredKeys) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(keys)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        info!(path = %self.path.display(), "Vault: stored agent keys");
        Ok(())
    }
}

/// Stored keys, or a fresh pair that has just been saved. The flag is true
/// when the pair is new, meaning the agent still has to register.
pub async fn load_or_create(vault: &Vault) -> Result<(KeyPair, bool)> {
    if let Some(stored) = vault.load().await? {
        return Ok((stored.to_keys()?, false));
    }
    let keys = KeyPair::generate();
    vault.save(&StoredKeys::from_keys(&keys)).await?;
    Ok((keys, true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_vault_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::File(FileVault::new(dir.path().join("keys/agent.json")));
        assert!(vault.load().await.unwrap().is_none());

        let (keys, created) = load_or_create(&vault).await.unwrap();
        assert!(created);

        let (again, created) = load_or_create(&vault).await.unwrap();
        assert!(!created);
        assert_eq!(again.public_key_b64(), keys.public_key_b64());
        assert_eq!(again.private_key_b64(), keys.private_key_b64());
    }

    #[tokio::test]
    async fn test_empty_file_counts_as_unset() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let vault = Vault::File(FileVault::new(file.path()));
        assert!(vault.load().await.unwrap().is_none());
    }

    #[test]
    fn test_decode_secret() {
        let keys = StoredKeys {
            public_key: "pub".into(),
            private_key: "priv".into(),
        };
        let secret = json!({
            "data": { "keyConfig": STANDARD.encode(serde_json::to_vec(&keys).unwrap()) }
        });
        assert_eq!(decode_secret(&secret).unwrap(), Some(keys));
        assert_eq!(decode_secret(&json!({"data": {}})).unwrap(), None);
    }

    #[test]
    fn test_secret_name() {
        assert_eq!(secret_name("prod"), "bctl-prod-secret");
    }
}
