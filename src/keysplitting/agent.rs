//! Agent half of the handshake: validates Syn and Data, answers with SynAck
//! and DataAck.

use std::collections::HashMap;
use std::sync::Arc;

use super::bzcert::{now_secs, CertVerifier};
use super::hash::nonce;
use super::keys::KeyPair;
use super::oidc::{IdTokenVerifier, OrgPolicy};
use super::{payload_hash, sign_message, verify_message};
use crate::error::{Error, Result};
use crate::message::keysplitting::{DataAckPayload, SynAckPayload};
use crate::message::{KeysplittingMessage, KeysplittingPayload, KeysplittingType, SCHEMA_VERSION};

#[derive(Debug, Clone)]
struct CachedCert {
    client_public_key: String,
    expires_at: i64,
}

pub struct AgentKeysplitting {
    keys: Arc<KeyPair>,
    tokens: Arc<dyn IdTokenVerifier>,
    policy: Arc<OrgPolicy>,
    /// bzcert hash -> what the Syn proved about it.
    certs: HashMap<String, CachedCert>,
    h_pointer: String,
    expected_h_pointer: String,
    syn_accepted: bool,
}

impl AgentKeysplitting {
    pub fn new(
        keys: Arc<KeyPair>,
        tokens: Arc<dyn IdTokenVerifier>,
        policy: Arc<OrgPolicy>,
    ) -> Self {
        Self {
            keys,
            tokens,
            policy,
            certs: HashMap::new(),
            h_pointer: String::new(),
            expected_h_pointer: String::new(),
            syn_accepted: false,
        }
    }

    pub fn h_pointer(&self) -> &str {
        &self.h_pointer
    }

    pub fn expected_h_pointer(&self) -> &str {
        &self.expected_h_pointer
    }

    pub fn validate(&mut self, msg: &KeysplittingMessage) -> Result<()> {
        match &msg.payload {
            KeysplittingPayload::Syn(syn) => {
                if self.syn_accepted {
                    return Err(Error::validation("only one Syn is allowed per data channel"));
                }
                let verified = CertVerifier {
                    tokens: self.tokens.as_ref(),
                    policy: self.policy.as_ref(),
                }
                .verify(&syn.bz_cert)?;
                verify_message(msg, &syn.bz_cert.client_public_key)?;

                self.certs.insert(
                    verified.hash,
                    CachedCert {
                        client_public_key: syn.bz_cert.client_public_key.clone(),
                        expires_at: verified.expires_at,
                    },
                );
                self.syn_accepted = true;
                Ok(())
            }
            KeysplittingPayload::Data(data) => {
                let cert = self.certs.get(&data.bz_cert_hash).ok_or_else(|| {
                    Error::validation("could not match bzcert hash to a previously received Syn")
                })?;
                if now_secs() > cert.expires_at {
                    return Err(Error::validation("bzcert has expired"));
                }
                verify_message(msg, &cert.client_public_key)?;

                if data.h_pointer != self.expected_h_pointer {
                    return Err(Error::validation("Data hash pointer did not match expected"));
                }
                Ok(())
            }
            other => Err(Error::validation(format!(
                "agent cannot validate {} messages",
                other.kind()
            ))),
        }
    }

    /// Build the signed SynAck or DataAck answering `incoming`.
    pub fn build_response(
        &mut self,
        incoming: &KeysplittingMessage,
        action: &str,
        action_response_payload: Vec<u8>,
    ) -> Result<KeysplittingMessage> {
        let incoming_hash = payload_hash(&incoming.payload)?;
        let timestamp = now_secs().to_string();

        let payload = match &incoming.payload {
            KeysplittingPayload::Syn(syn) => KeysplittingPayload::SynAck(SynAckPayload {
                timestamp,
                schema_version: SCHEMA_VERSION.to_string(),
                kind: KeysplittingType::SynAck.as_str().to_string(),
                action: syn.action.clone(),
                action_response_payload,
                target_public_key: self.keys.public_key_b64(),
                nonce: nonce(),
                h_pointer: incoming_hash.clone(),
            }),
            KeysplittingPayload::Data(_) => KeysplittingPayload::DataAck(DataAckPayload {
                timestamp,
                schema_version: SCHEMA_VERSION.to_string(),
                kind: KeysplittingType::DataAck.as_str().to_string(),
                action: action.to_string(),
                action_response_payload,
                target_public_key: self.keys.public_key_b64(),
                h_pointer: incoming_hash.clone(),
            }),
            other => {
                return Err(Error::validation(format!(
                    "agent cannot respond to {} messages",
                    other.kind()
                )))
            }
        };

        let mut msg = KeysplittingMessage::unsigned(payload);
        sign_message(&mut msg, &self.keys)?;
        self.h_pointer = incoming_hash;
        self.expected_h_pointer = payload_hash(&msg.payload)?;
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keysplitting::bzcert::cert_hash;
    use crate::keysplitting::bzcert::testing::{cert_for, policy, verifier};
    use crate::keysplitting::daemon::{ClientIdentity, DaemonKeysplitting, IdentitySource};
    use crate::message::keysplitting::DataPayload;

    fn client() -> (DaemonKeysplitting, Arc<ClientIdentity>) {
        let keys = KeyPair::generate();
        let cert = cert_for(&keys);
        let identity = Arc::new(ClientIdentity {
            cert_hash: cert_hash(&cert).unwrap(),
            keys,
            cert,
        });
        (
            DaemonKeysplitting::new("target-1", IdentitySource::Fixed(identity.clone())),
            identity,
        )
    }

    fn agent() -> (AgentKeysplitting, Arc<KeyPair>) {
        let keys = Arc::new(KeyPair::generate());
        let engine = AgentKeysplitting::new(keys.clone(), Arc::new(verifier()), Arc::new(policy()));
        (engine, keys)
    }

    /// Round-trips through JSON the way frames cross the relay.
    fn over_wire(msg: &KeysplittingMessage) -> KeysplittingMessage {
        serde_json::from_slice(&serde_json::to_vec(msg).unwrap()).unwrap()
    }

    #[test]
    fn test_full_handshake_keeps_hash_chain() {
        let (mut daemon, identity) = client();
        let (mut agent, agent_keys) = agent();

        let syn = over_wire(&daemon.build_syn("kube/restapi", Vec::new()).unwrap());
        verify_message(&syn, &identity.keys.public_key_b64()).unwrap();
        agent.validate(&syn).unwrap();

        let syn_ack = over_wire(&agent.build_response(&syn, "", Vec::new()).unwrap());
        verify_message(&syn_ack, &agent_keys.public_key_b64()).unwrap();
        assert_eq!(
            syn_ack.payload.h_pointer().unwrap(),
            payload_hash(&syn.payload).unwrap()
        );
        assert_eq!(syn_ack.payload.action(), "kube/restapi");
        daemon.validate(&syn_ack).unwrap();

        let mut previous = syn_ack;
        for i in 0..3 {
            let data = over_wire(
                &daemon
                    .build_response(&previous, "kube/restapi", format!("req {i}").into_bytes())
                    .unwrap(),
            );
            assert_eq!(
                data.payload.h_pointer().unwrap(),
                payload_hash(&previous.payload).unwrap()
            );
            assert_eq!(data.payload.h_pointer().unwrap(), agent.expected_h_pointer());
            agent.validate(&data).unwrap();

            let ack = over_wire(
                &agent
                    .build_response(&data, "kube/restapi", b"resp".to_vec())
                    .unwrap(),
            );
            assert_eq!(ack.payload.h_pointer().unwrap(), daemon.expected_h_pointer());
            assert_eq!(ack.payload.action_bytes(), b"resp");
            daemon.validate(&ack).unwrap();
            previous = ack;
        }
    }

    #[test]
    fn test_second_syn_rejected() {
        let (mut daemon, _) = client();
        let (mut agent, _) = agent();

        let syn = daemon.build_syn("kube/restapi", Vec::new()).unwrap();
        agent.validate(&syn).unwrap();
        agent.build_response(&syn, "", Vec::new()).unwrap();

        let again = daemon.build_syn("kube/restapi", Vec::new()).unwrap();
        let err = agent.validate(&again).unwrap_err();
        assert_eq!(err.error_type(), crate::error::ErrorType::KeysplittingValidationError);
    }

    #[test]
    fn test_replayed_data_rejected() {
        let (mut daemon, _) = client();
        let (mut agent, _) = agent();

        let syn = daemon.build_syn("kube/restapi", Vec::new()).unwrap();
        agent.validate(&syn).unwrap();
        let syn_ack = agent.build_response(&syn, "", Vec::new()).unwrap();
        daemon.validate(&syn_ack).unwrap();

        let data = daemon.build_response(&syn_ack, "kube/restapi", Vec::new()).unwrap();
        agent.validate(&data).unwrap();
        agent.build_response(&data, "kube/restapi", Vec::new()).unwrap();

        let err = agent.validate(&data).unwrap_err();
        assert!(err.to_string().contains("hash pointer"));
    }

    #[test]
    fn test_data_with_unknown_bzcert_rejected() {
        let (mut daemon, _) = client();
        let (mut agent, _) = agent();
        let syn = daemon.build_syn("kube/restapi", Vec::new()).unwrap();
        agent.validate(&syn).unwrap();
        let syn_ack = agent.build_response(&syn, "", Vec::new()).unwrap();

        let mut data = daemon.build_response(&syn_ack, "kube/restapi", Vec::new()).unwrap();
        if let KeysplittingPayload::Data(DataPayload { bz_cert_hash, .. }) = &mut data.payload {
            *bz_cert_hash = "not-a-known-cert".into();
        }
        let err = agent.validate(&data).unwrap_err();
        assert!(err.to_string().contains("bzcert"));
    }

    #[test]
    fn test_data_before_syn_rejected() {
        let (mut daemon, _) = client();
        let (mut agent, _) = agent();
        let (mut other_agent, _) = self::agent();

        let syn = daemon.build_syn("kube/restapi", Vec::new()).unwrap();
        other_agent.validate(&syn).unwrap();
        let syn_ack = other_agent.build_response(&syn, "", Vec::new()).unwrap();
        let data = daemon.build_response(&syn_ack, "kube/restapi", Vec::new()).unwrap();

        assert!(agent.validate(&data).is_err());
    }

    #[test]
    fn test_tampered_payload_fails_signature() {
        let (mut daemon, _) = client();
        let (mut agent, _) = agent();
        let mut syn = daemon.build_syn("kube/restapi", Vec::new()).unwrap();
        if let KeysplittingPayload::Syn(p) = &mut syn.payload {
            p.action = "kube/exec/start".into();
        }
        let err = agent.validate(&syn).unwrap_err();
        assert!(err.to_string().contains("signature"));
    }

    #[test]
    fn test_daemon_rejects_ack_from_different_agent() {
        let (mut daemon, _) = client();
        let (mut agent, _) = agent();
        let (mut impostor, _) = self::agent();

        let syn = daemon.build_syn("kube/restapi", Vec::new()).unwrap();
        agent.validate(&syn).unwrap();
        let syn_ack = agent.build_response(&syn, "", Vec::new()).unwrap();
        daemon.validate(&syn_ack).unwrap();

        let data = daemon.build_response(&syn_ack, "kube/restapi", Vec::new()).unwrap();
        impostor.validate(&syn).unwrap();
        impostor.build_response(&syn, "", Vec::new()).unwrap();
        impostor.expected_h_pointer = data.payload.h_pointer().unwrap().to_string();
        impostor.validate(&data).unwrap();
        let forged = impostor.build_response(&data, "kube/restapi", Vec::new()).unwrap();

        let err = daemon.validate(&forged).unwrap_err();
        assert!(err.to_string().contains("unknown target key"));
    }

    #[test]
    fn test_reused_daemon_engine_chains_nonce() {
        let (mut daemon, _) = client();
        let first = daemon.build_syn("kube/restapi", Vec::new()).unwrap();
        let expected = daemon.expected_h_pointer().to_string();
        let second = daemon.build_syn("kube/restapi", Vec::new()).unwrap();
        match (&first.payload, &second.payload) {
            (KeysplittingPayload::Syn(a), KeysplittingPayload::Syn(b)) => {
                assert_eq!(a.nonce.len(), 44);
                assert_eq!(b.nonce, expected);
            }
            _ => panic!("expected Syn payloads"),
        }
    }
}
