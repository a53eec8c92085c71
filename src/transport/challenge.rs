//! Proof of key possession the agent presents on every control-channel connect.

use crate::error::{Error, Result};
use crate::keysplitting::hash::sha3_256;
use crate::keysplitting::KeyPair;
use crate::message::control::{GetChallengeMessage, GetChallengeResponse};

pub const CHALLENGE_ENDPOINT: &str = "/api/v1/kube/get-challenge";

/// base64 Ed25519 signature over SHA3-256(challenge).
pub fn solve(challenge: &str, keys: &KeyPair) -> String {
    keys.sign(&sha3_256(challenge.as_bytes()))
}

pub async fn get_and_solve(
    http: &reqwest::Client,
    service_host: &str,
    org_id: &str,
    cluster_name: &str,
    keys: &KeyPair,
) -> Result<String> {
    let url = format!("https://{service_host}{CHALLENGE_ENDPOINT}");
    let response = http
        .post(&url)
        .json(&GetChallengeMessage {
            org_id: org_id.to_string(),
            cluster_name: cluster_name.to_string(),
        })
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(Error::startup(format!(
            "challenge request failed with status {}",
            response.status()
        )));
    }
    let body: GetChallengeResponse = response.json().await?;
    Ok(solve(&body.challenge, keys))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keysplitting::keys::verify;

    #[test]
    fn test_solution_verifies_over_hashed_challenge() {
        let keys = KeyPair::generate();
        let sig = solve("abc123", &keys);
        verify(&keys.public_key_b64(), &sha3_256(b"abc123"), &sig).unwrap();
        assert!(verify(&keys.public_key_b64(), b"abc123", &sig).is_err());
    }
}
