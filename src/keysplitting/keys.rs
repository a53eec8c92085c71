//! Ed25519 key handling with base64 wire encoding.
//!
//! Private keys travel in the 64-byte `seed || public` layout. A bare
//! 32-byte seed is accepted and extended with its public half.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;

use crate::error::{Error, Result};

#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key_b64())
            .finish_non_exhaustive()
    }
}

impl KeyPair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Load from base64 strings. `private_b64` may be a 32-byte seed or the
    /// 64-byte expanded form; `public_b64` must match it either way.
    pub fn from_base64(private_b64: &str, public_b64: &str) -> Result<Self> {
        let private = STANDARD.decode(private_b64.trim())?;
        let public = STANDARD.decode(public_b64.trim())?;

        let expanded: [u8; 64] = match private.len() {
            32 => {
                let mut buf = [0u8; 64];
                buf[..32].copy_from_slice(&private);
                buf[32..].copy_from_slice(&public);
                buf
            }
            64 => private
                .as_slice()
                .try_into()
                .map_err(|_| Error::startup("invalid private key"))?,
            n => return Err(Error::startup(format!("invalid private key length: {n}"))),
        };

        let signing_key = SigningKey::from_keypair_bytes(&expanded)
            .map_err(|e| Error::startup(format!("private key does not match public key: {e}")))?;
        Ok(Self { signing_key })
    }

    pub fn public_key_b64(&self) -> String {
        STANDARD.encode(self.signing_key.verifying_key().to_bytes())
    }

    /// 64-byte `seed || public` form, base64.
    pub fn private_key_b64(&self) -> String {
        STANDARD.encode(self.signing_key.to_keypair_bytes())
    }

    /// Detached signature over `message`, base64.
    pub fn sign(&self, message: &[u8]) -> String {
        STANDARD.encode(self.signing_key.sign(message).to_bytes())
    }
}

/// Check a base64 signature against a base64 public key.
pub fn verify(public_key_b64: &str, message: &[u8], signature_b64: &str) -> Result<()> {
    let key_bytes = STANDARD.decode(public_key_b64.trim())?;
    let key_bytes: [u8; 32] = key_bytes
        .as_slice()
        .try_into()
        .map_err(|_| Error::validation(format!("public key has invalid length {}", key_bytes.len())))?;
    let key = VerifyingKey::from_bytes(&key_bytes)?;

    let sig_bytes = STANDARD.decode(signature_b64.trim())?;
    let signature = Signature::from_slice(&sig_bytes)?;

    key.verify(message, &signature)
        .map_err(|_| Error::validation("signature verification failed"))
}
