//! BZCert verification.

use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::hash::{hash_payload_b64, sha3_256};
use super::keys;
use super::oidc::{IdTokenVerifier, OrgPolicy};
use crate::error::{Error, Result};
use crate::message::keysplitting::BzCert;

/// How long an initial id token stays usable after its `iat`.
pub const INITIAL_TOKEN_LIFETIME_SECS: i64 = 60 * 60 * 24 * 365 * 5;

pub(crate) fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Canonical hash of the certificate; its identity on the wire.
pub fn cert_hash(cert: &BzCert) -> Result<String> {
    hash_payload_b64(cert)
}

/// `base64(sha3(client_public_key || signature_on_rand || rand))` over the
/// base64 strings, the value the IdP must have echoed as `nonce`.
pub fn auth_nonce(cert: &BzCert) -> String {
    let joined = format!(
        "{}{}{}",
        cert.client_public_key, cert.signature_on_rand, cert.rand
    );
    STANDARD.encode(sha3_256(joined.as_bytes()))
}

/// Verified certificate: its hash and when the current id token expires.
#[derive(Debug, Clone)]
pub struct VerifiedCert {
    pub hash: String,
    pub expires_at: i64,
}

/// Runs the full certificate check against an org policy.
pub struct CertVerifier<'a> {
    pub tokens: &'a dyn IdTokenVerifier,
    pub policy: &'a OrgPolicy,
}

impl CertVerifier<'_> {
    pub fn verify(&self, cert: &BzCert) -> Result<VerifiedCert> {
        // (i) signature over hash(rand)
        let rand = STANDARD
            .decode(cert.rand.as_bytes())
            .map_err(|_| Error::validation("bzcert rand is not base64"))?;
        keys::verify(
            &cert.client_public_key,
            &sha3_256(&rand),
            &cert.signature_on_rand,
        )
        .map_err(|_| Error::validation("failed to verify signature on rand"))?;

        // (ii)+(iii) initial token: issuer signature, nonce binding, 5-year window
        let initial = self.tokens.verify(&cert.initial_id_token, false)?;
        let now = now_secs();
        if now > initial.iat + INITIAL_TOKEN_LIFETIME_SECS {
            return Err(Error::validation(format!(
                "initial id token expired (iat {}, now {now})",
                initial.iat
            )));
        }
        if initial.nonce != auth_nonce(cert) {
            return Err(Error::validation(
                "nonce in initial id token does not match the certificate",
            ));
        }
        self.policy.check_org(&initial)?;

        // (iv) current token: normal expiry
        let current = self.tokens.verify(&cert.current_id_token, true)?;
        self.policy.check_org(&current)?;

        Ok(VerifiedCert {
            hash: cert_hash(cert)?,
            expires_at: current.exp,
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Helpers for minting certificates that verify under a test issuer.

    use super::*;
    use crate::keysplitting::keys::KeyPair;
    use crate::keysplitting::oidc::{IdpProvider, StaticKeyVerifier};
    use jsonwebtoken::{encode, Algorithm, DecodingKey, EncodingKey, Header};
    use serde_json::json;

    pub const ISSUER: &str = "https://accounts.google.com";
    pub const ORG: &str = "example.com";
    const SECRET: &[u8] = b"bzcert-test-secret";

    pub fn verifier() -> StaticKeyVerifier {
        StaticKeyVerifier::new(ISSUER, Algorithm::HS256, DecodingKey::from_secret(SECRET))
    }

    pub fn policy() -> OrgPolicy {
        OrgPolicy {
            provider: IdpProvider::Google,
            org_id: ORG.into(),
        }
    }

    pub fn mint(claims: serde_json::Value) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap()
    }

    /// A certificate for `keys` with tokens valid for an hour.
    pub fn cert_for(keys: &KeyPair) -> BzCert {
        let rand_bytes = [7u8; 32];
        let mut cert = BzCert {
            client_public_key: keys.public_key_b64(),
            rand: STANDARD.encode(rand_bytes),
            signature_on_rand: keys.sign(&sha3_256(&rand_bytes)),
            ..Default::default()
        };
        let now = now_secs();
        cert.initial_id_token = mint(json!({
            "iss": ISSUER, "hd": ORG, "nonce": auth_nonce(&cert),
            "iat": now - 86_400, "exp": now - 3_600,
        }));
        cert.current_id_token = mint(json!({
            "iss": ISSUER, "hd": ORG, "iat": now, "exp": now + 3_600,
        }));
        cert
    }
}
