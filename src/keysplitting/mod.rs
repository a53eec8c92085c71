//! Keysplitting: the signed, hash-chained handshake that authenticates every
//! action crossing the tunnel.
//!
//! ```text
//! daemon                         agent
//!   Syn      (nonce, bzcert)  ─▶   verify bzcert + signature
//!            ◀─  SynAck (hPointer = H(Syn))
//!   Data     (hPointer = H(SynAck), bzcert hash) ─▶
//!            ◀─  DataAck (hPointer = H(Data))
//!   ...
//! ```
//!
//! Each side owns one engine per data channel ([`daemon::DaemonKeysplitting`],
//! [`agent::AgentKeysplitting`]); engines are never shared across channels.

pub mod agent;
pub mod bzcert;
pub mod daemon;
pub mod hash;
pub mod keys;
pub mod oidc;

pub use agent::AgentKeysplitting;
pub use daemon::{ClientIdentity, DaemonKeysplitting, IdentitySource};
pub use keys::KeyPair;

use crate::error::{Error, Result};
use crate::message::{KeysplittingMessage, KeysplittingPayload};

/// Base64 canonical hash of a payload; what `hPointer` fields carry.
pub fn payload_hash(payload: &KeysplittingPayload) -> Result<String> {
    hash::hash_payload_b64(payload)
}

/// Sign the canonical hash of `msg.payload` in place.
pub fn sign_message(msg: &mut KeysplittingMessage, keys: &KeyPair) -> Result<()> {
    let digest = hash::hash_payload(&msg.payload)?;
    msg.signature = keys.sign(&digest);
    Ok(())
}

pub fn verify_message(msg: &KeysplittingMessage, public_key_b64: &str) -> Result<()> {
    if msg.signature.is_empty() {
        return Err(Error::validation(format!("{} message is not signed", msg.kind())));
    }
    let digest = hash::hash_payload(&msg.payload)?;
    keys::verify(public_key_b64, &digest, &msg.signature).map_err(|_| {
        Error::validation(format!("failed to verify {} signature", msg.kind()))
    })
}
