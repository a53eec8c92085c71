//! Daemon half of the handshake: sends Syn and Data, validates SynAck and
//! DataAck.

use std::path::PathBuf;
use std::sync::Arc;

use super::bzcert::{cert_hash, now_secs};
use super::hash::{hash_payload_b64, nonce};
use super::keys::KeyPair;
use super::{sign_message, verify_message};
use crate::config::ClientConfigFile;
use crate::error::{Error, Result};
use crate::message::keysplitting::{BzCert, DataPayload, SynPayload};
use crate::message::{KeysplittingMessage, KeysplittingPayload, KeysplittingType, SCHEMA_VERSION};

/// The operator's signing key and certificate, read from the daemon config.
#[derive(Debug)]
pub struct ClientIdentity {
    pub keys: KeyPair,
    pub cert: BzCert,
    pub cert_hash: String,
}

impl ClientIdentity {
    pub fn load(config_path: &std::path::Path) -> Result<Self> {
        let file = ClientConfigFile::load(config_path)?;
        let ks = &file.key_splitting;
        let keys = KeyPair::from_base64(&ks.private_key, &ks.public_key)?;
        let cert = BzCert {
            initial_id_token: ks.initial_id_token.clone(),
            current_id_token: file.token_set.current_id_token.clone(),
            client_public_key: ks.public_key.clone(),
            rand: ks.cer_rand.clone(),
            signature_on_rand: ks.cer_rand_sig.clone(),
        };
        let cert_hash = cert_hash(&cert)?;
        Ok(Self {
            keys,
            cert,
            cert_hash,
        })
    }
}

/// Where the engine gets its identity from.
#[derive(Debug, Clone)]
pub enum IdentitySource {
    /// Re-read before every Syn so a fresh login is picked up.
    ConfigFile(PathBuf),
    Fixed(Arc<ClientIdentity>),
}

impl IdentitySource {
    fn resolve(&self) -> Result<Arc<ClientIdentity>> {
        match self {
            Self::ConfigFile(path) => ClientIdentity::load(path)
                .map(Arc::new)
                .map_err(|e| Error::startup(format!("could not load keysplitting config: {e}"))),
            Self::Fixed(identity) => Ok(identity.clone()),
        }
    }
}

pub struct DaemonKeysplitting {
    target_id: String,
    source: IdentitySource,
    identity: Option<Arc<ClientIdentity>>,
    h_pointer: String,
    expected_h_pointer: String,
    /// Agent key learned from the first SynAck; later acks must match it.
    target_public_key: Option<String>,
}

impl DaemonKeysplitting {
    pub fn new(target_id: impl Into<String>, source: IdentitySource) -> Self {
        Self {
            target_id: target_id.into(),
            source,
            identity: None,
            h_pointer: String::new(),
            expected_h_pointer: String::new(),
            target_public_key: None,
        }
    }

    pub fn h_pointer(&self) -> &str {
        &self.h_pointer
    }

    pub fn expected_h_pointer(&self) -> &str {
        &self.expected_h_pointer
    }

    /// Build and sign a Syn. Chains onto the previous session when the
    /// engine is reused.
    pub fn build_syn(&mut self, action: &str, action_payload: Vec<u8>) -> Result<KeysplittingMessage> {
        let nonce = if self.expected_h_pointer.is_empty() {
            nonce()
        } else {
            self.expected_h_pointer.clone()
        };

        let identity = self.source.resolve()?;
        let payload = SynPayload {
            timestamp: now_secs().to_string(),
            schema_version: SCHEMA_VERSION.to_string(),
            kind: KeysplittingType::Syn.as_str().to_string(),
            action: action.to_string(),
            action_payload,
            target_id: self.target_id.clone(),
            nonce,
            bz_cert: identity.cert.clone(),
        };

        let mut msg = KeysplittingMessage::unsigned(KeysplittingPayload::Syn(payload));
        sign_message(&mut msg, &identity.keys)?;
        self.expected_h_pointer = hash_payload_b64(&msg.payload)?;
        self.identity = Some(identity);
        Ok(msg)
    }

    pub fn validate(&mut self, msg: &KeysplittingMessage) -> Result<()> {
        let h_pointer = match &msg.payload {
            KeysplittingPayload::SynAck(p) => {
                match &self.target_public_key {
                    Some(pinned) if *pinned != p.target_public_key => {
                        return Err(Error::validation(
                            "SynAck target public key changed mid-session",
                        ));
                    }
                    _ => {}
                }
                verify_message(msg, &p.target_public_key)?;
                self.target_public_key = Some(p.target_public_key.clone());
                &p.h_pointer
            }
            KeysplittingPayload::DataAck(p) => {
                let pinned = self
                    .target_public_key
                    .as_deref()
                    .ok_or_else(|| Error::validation("DataAck received before SynAck"))?;
                if pinned != p.target_public_key {
                    return Err(Error::validation("DataAck signed by an unknown target key"));
                }
                verify_message(msg, pinned)?;
                &p.h_pointer
            }
            other => {
                return Err(Error::validation(format!(
                    "daemon cannot validate {} messages",
                    other.kind()
                )));
            }
        };

        if *h_pointer != self.expected_h_pointer {
            return Err(Error::validation(format!(
                "{} hash pointer did not match expected",
                msg.kind()
            )));
        }
        Ok(())
    }

    /// Answer a SynAck or DataAck with the next Data.
    pub fn build_response(
        &mut self,
        incoming: &KeysplittingMessage,
        action: &str,
        action_payload: Vec<u8>,
    ) -> Result<KeysplittingMessage> {
        if !matches!(
            incoming.kind(),
            KeysplittingType::SynAck | KeysplittingType::DataAck
        ) {
            return Err(Error::validation(format!(
                "daemon cannot respond to {} messages",
                incoming.kind()
            )));
        }
        let identity = self
            .identity
            .clone()
            .ok_or_else(|| Error::validation("Data requested before Syn"))?;

        let incoming_hash = hash_payload_b64(&incoming.payload)?;
        let payload = DataPayload {
            timestamp: now_secs().to_string(),
            schema_version: SCHEMA_VERSION.to_string(),
            kind: KeysplittingType::Data.as_str().to_string(),
            action: action.to_string(),
            action_payload,
            target_id: self.target_id.clone(),
            h_pointer: incoming_hash.clone(),
            bz_cert_hash: identity.cert_hash.clone(),
        };

        let mut msg = KeysplittingMessage::unsigned(KeysplittingPayload::Data(payload));
        sign_message(&mut msg, &identity.keys)?;
        self.h_pointer = incoming_hash;
        self.expected_h_pointer = hash_payload_b64(&msg.payload)?;
        Ok(msg)
    }
}
