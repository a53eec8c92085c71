//! OIDC id-token verification.
//!
//! Verification itself is synchronous: [`JwksVerifier`] fetches the issuer's
//! signing keys up front (and on [`JwksVerifier::refresh`]) so validating a
//! Syn never waits on the network.

use std::collections::HashSet;
use std::sync::RwLock;
use std::time::Duration;

use jsonwebtoken::jwk::JwkSet;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{Error, Result};

const GOOGLE_ISSUER: &str = "https://accounts.google.com";
const MICROSOFT_ISSUER: &str = "https://login.microsoftonline.com";
/// Tenant Microsoft reports for personal (non work/school) accounts.
pub const MICROSOFT_PERSONAL_TENANT: &str = "9188040d-6c67-4c5b-b112-36a304b66dad";

/// Claims the tunnel cares about.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdTokenClaims {
    #[serde(default)]
    pub iss: String,
    /// Google hosted domain.
    #[serde(default)]
    pub hd: String,
    /// Microsoft tenant id.
    #[serde(default)]
    pub tid: String,
    #[serde(default)]
    pub nonce: String,
    #[serde(default)]
    pub iat: i64,
    #[serde(default)]
    pub exp: i64,
}

/// Checks an id token's signature and standard claims.
///
/// `check_expiry = false` skips only the `exp` check; everything else
/// (issuer, signature) still applies.
pub trait IdTokenVerifier: Send + Sync {
    fn verify(&self, token: &str, check_expiry: bool) -> Result<IdTokenClaims>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdpProvider {
    Google,
    Microsoft,
    /// Any issuer that serves a discovery document.
    Custom(String),
}

impl IdpProvider {
    pub fn parse(name: &str, custom_issuer: Option<&str>) -> Result<Self> {
        match name.to_ascii_lowercase().as_str() {
            "google" => Ok(Self::Google),
            "microsoft" => Ok(Self::Microsoft),
            "custom" => custom_issuer
                .filter(|s| !s.is_empty())
                .map(|s| Self::Custom(s.to_string()))
                .ok_or_else(|| Error::startup("custom identity provider requires an issuer url")),
            other => Err(Error::startup(format!("unknown identity provider: {other}"))),
        }
    }
}

/// The organization an agent belongs to and where its users sign in.
#[derive(Debug, Clone)]
pub struct OrgPolicy {
    pub provider: IdpProvider,
    pub org_id: String,
}

impl OrgPolicy {
    pub fn issuer(&self) -> String {
        match &self.provider {
            IdpProvider::Google => GOOGLE_ISSUER.to_string(),
            IdpProvider::Microsoft => {
                let tenant = if self.org_id == "None" {
                    MICROSOFT_PERSONAL_TENANT
                } else {
                    self.org_id.as_str()
                };
                format!("{MICROSOFT_ISSUER}/{tenant}/v2.0")
            }
            IdpProvider::Custom(iss) => iss.clone(),
        }
    }

    /// Provider-specific organization claim must equal the configured org.
    pub fn check_org(&self, claims: &IdTokenClaims) -> Result<()> {
        match self.provider {
            IdpProvider::Google if claims.hd != self.org_id => Err(Error::validation(
                "user's org does not match the expected Google hosted domain",
            )),
            IdpProvider::Microsoft if claims.tid != self.org_id => Err(Error::validation(
                "user's org does not match the expected Microsoft tenant",
            )),
            _ => Ok(()),
        }
    }
}

fn validation_for(alg: Algorithm, issuer: &str, check_expiry: bool) -> Validation {
    let mut validation = Validation::new(alg);
    validation.set_issuer(&[issuer]);
    validation.validate_aud = false;
    validation.validate_exp = check_expiry;
    validation.required_spec_claims = HashSet::from(["iss".to_string()]);
    validation
}

/// Verifies tokens against the issuer's published JWKS.
pub struct JwksVerifier {
    issuer: String,
    http: reqwest::Client,
    keys: RwLock<JwkSet>,
}

#[derive(Deserialize)]
struct DiscoveryDocument {
    jwks_uri: String,
}

impl JwksVerifier {
    /// Run discovery for `issuer` and load its current key set.
    pub async fn discover(issuer: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        let verifier = Self {
            issuer: issuer.trim_end_matches('/').to_string(),
            http,
            keys: RwLock::new(JwkSet { keys: Vec::new() }),
        };
        verifier.refresh().await?;
        Ok(verifier)
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub async fn refresh(&self) -> Result<()> {
        let discovery_url = format!("{}/.well-known/openid-configuration", self.issuer);
        let doc: DiscoveryDocument = self
            .http
            .get(&discovery_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let set: JwkSet = self
            .http
            .get(&doc.jwks_uri)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        info!(issuer = %self.issuer, keys = set.keys.len(), "OIDC: loaded signing keys");
        match self.keys.write() {
            Ok(mut guard) => *guard = set,
            Err(poisoned) => *poisoned.into_inner() = set,
        }
        Ok(())
    }

    /// Spawn a task that reloads the key set every `every`.
    pub fn spawn_refresh(self: std::sync::Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = self.refresh().await {
                    warn!(issuer = %self.issuer, "OIDC: key refresh failed: {e}");
                }
            }
        })
    }
}

impl IdTokenVerifier for JwksVerifier {
    fn verify(&self, token: &str, check_expiry: bool) -> Result<IdTokenClaims> {
        let header = decode_header(token)?;
        if matches!(
            header.alg,
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512
        ) {
            return Err(Error::validation("symmetric id token algorithms are not accepted"));
        }
        let kid = header
            .kid
            .as_deref()
            .ok_or_else(|| Error::validation("id token has no key id"))?;

        let key = {
            let guard = self
                .keys
                .read()
                .map_err(|_| Error::processing("OIDC key set lock poisoned"))?;
            let jwk = guard
                .find(kid)
                .ok_or_else(|| Error::validation(format!("no issuer key with id {kid}")))?;
            DecodingKey::from_jwk(jwk)?
        };

        let data = decode::<IdTokenClaims>(
            token,
            &key,
            &validation_for(header.alg, &self.issuer, check_expiry),
        )?;
        Ok(data.claims)
    }
}

/// Verifies tokens with one fixed key, for pre-provisioned issuers.
pub struct StaticKeyVerifier {
    issuer: String,
    algorithm: Algorithm,
    key: DecodingKey,
}

impl StaticKeyVerifier {
    pub fn new(issuer: impl Into<String>, algorithm: Algorithm, key: DecodingKey) -> Self {
        Self {
            issuer: issuer.into(),
            algorithm,
            key,
        }
    }
}

impl IdTokenVerifier for StaticKeyVerifier {
    fn verify(&self, token: &str, check_expiry: bool) -> Result<IdTokenClaims> {
        let data = decode::<IdTokenClaims>(
            token,
            &self.key,
            &validation_for(self.algorithm, &self.issuer, check_expiry),
        )?;
        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    const SECRET: &[u8] = b"test-signing-secret";

    fn token(claims: serde_json::Value) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap()
    }

    fn verifier() -> StaticKeyVerifier {
        StaticKeyVerifier::new(
            GOOGLE_ISSUER,
            Algorithm::HS256,
            DecodingKey::from_secret(SECRET),
        )
    }

    #[test]
    fn test_microsoft_personal_tenant_issuer() {
        let policy = OrgPolicy {
            provider: IdpProvider::Microsoft,
            org_id: "None".into(),
        };
        assert_eq!(
            policy.issuer(),
            "https://login.microsoftonline.com/9188040d-6c67-4c5b-b112-36a304b66dad/v2.0"
        );
        let policy = OrgPolicy {
            provider: IdpProvider::Microsoft,
            org_id: "tenant-1".into(),
        };
        assert_eq!(
            policy.issuer(),
            "https://login.microsoftonline.com/tenant-1/v2.0"
        );
    }

    #[test]
    fn test_org_claim_checked_per_provider() {
        let claims = IdTokenClaims {
            hd: "example.com".into(),
            tid: "t1".into(),
            ..Default::default()
        };
        let google = OrgPolicy {
            provider: IdpProvider::Google,
            org_id: "example.com".into(),
        };
        assert!(google.check_org(&claims).is_ok());
        let ms = OrgPolicy {
            provider: IdpProvider::Microsoft,
            org_id: "t2".into(),
        };
        assert!(ms.check_org(&claims).is_err());
        let custom = OrgPolicy {
            provider: IdpProvider::Custom("https://idp".into()),
            org_id: "whatever".into(),
        };
        assert!(custom.check_org(&claims).is_ok());
    }

    #[test]
    fn test_expired_token_passes_only_without_expiry_check() {
        let t = token(json!({"iss": GOOGLE_ISSUER, "iat": 1_000, "exp": 2_000, "nonce": "n"}));
        assert!(verifier().verify(&t, true).is_err());
        let claims = verifier().verify(&t, false).unwrap();
        assert_eq!(claims.nonce, "n");
        assert_eq!(claims.iat, 1_000);
    }

    #[test]
    fn test_wrong_issuer_rejected() {
        let t = token(json!({"iss": "https://evil", "iat": 1, "exp": 4_000_000_000_i64}));
        assert!(verifier().verify(&t, true).is_err());
    }

    #[test]
    fn test_parse_provider() {
        assert_eq!(IdpProvider::parse("Google", None).unwrap(), IdpProvider::Google);
        assert!(IdpProvider::parse("custom", None).is_err());
        assert_eq!(
            IdpProvider::parse("custom", Some("https://idp")).unwrap(),
            IdpProvider::Custom("https://idp".into())
        );
        assert!(IdpProvider::parse("okta", None).is_err());
    }
}
