//! Cluster API client built from the pod's service account.
//!
//! TLS verification stays on: the client trusts the cluster CA mounted into
//! the pod, and the same CA backs the rustls config used for exec upgrades.
//! Nothing here touches process-wide TLS defaults.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap as HttpHeaders, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::Method;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::CertificateDer;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request as WsRequest;
use tokio_tungstenite::Connector;

use crate::action::payloads::HeaderMap;
use crate::error::{Error, Result};

pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
pub const IMPERSONATE_GROUP: &str = "system:authenticated";
/// Remote-command subprotocols offered on exec upgrades, newest first.
pub const EXEC_PROTOCOLS: &str = "v5.channel.k8s.io, v4.channel.k8s.io";

const IMPERSONATE_USER_HEADER: &str = "impersonate-user";
const IMPERSONATE_GROUP_HEADER: &str = "impersonate-group";

/// Operator headers that must not reach the cluster: credentials are ours,
/// and framing headers belong to the hop.
const STRIPPED_HEADERS: &[&str] = &[
    "authorization",
    "impersonate-user",
    "impersonate-group",
    "connection",
    "content-length",
    "host",
    "transfer-encoding",
    "upgrade",
];

pub struct KubeClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    namespace: String,
    tls: Option<Arc<rustls::ClientConfig>>,
}

impl KubeClient {
    /// Client for the cluster this pod runs in.
    pub fn in_cluster() -> Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| Error::startup("KUBERNETES_SERVICE_HOST is not set"))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".into());
        let host = if host.contains(':') {
            format!("[{host}]")
        } else {
            host
        };

        let dir = Path::new(SERVICE_ACCOUNT_DIR);
        let token = read_trimmed(&dir.join("token"))?;
        let namespace = read_trimmed(&dir.join("namespace"))?;
        let ca = std::fs::read(dir.join("ca.crt"))
            .map_err(|e| Error::startup(format!("could not read cluster CA: {e}")))?;

        Self::new(format!("https://{host}:{port}"), token, namespace, Some(&ca))
    }

    /// `ca_pem` of `None` trusts the public web roots only.
    pub fn new(
        base_url: impl Into<String>,
        token: impl Into<String>,
        namespace: impl Into<String>,
        ca_pem: Option<&[u8]>,
    ) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .use_rustls_tls()
            .connect_timeout(Duration::from_secs(10));
        let mut tls = None;
        if let Some(ca) = ca_pem {
            for cert in reqwest::Certificate::from_pem_bundle(ca)? {
                builder = builder.add_root_certificate(cert);
            }
            tls = Some(Arc::new(exec_tls_config(ca)?));
        }

        Ok(Self {
            http: builder.build()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            namespace: namespace.into(),
            tls,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn url(&self, endpoint: &str) -> String {
        if endpoint.starts_with('/') {
            format!("{}{endpoint}", self.base_url)
        } else {
            format!("{}/{endpoint}", self.base_url)
        }
    }

    /// A request made on behalf of `role`, carrying the operator's headers.
    pub fn impersonated(
        &self,
        method: Method,
        endpoint: &str,
        role: &str,
        operator_headers: &HeaderMap,
    ) -> Result<reqwest::RequestBuilder> {
        let mut headers = HttpHeaders::new();
        for (name, values) in operator_headers {
            if STRIPPED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                continue;
            }
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| Error::processing(format!("invalid header name: {name}")))?;
            for value in values {
                let value = HeaderValue::from_str(value)
                    .map_err(|_| Error::processing(format!("invalid value for header {name}")))?;
                headers.append(name.clone(), value);
            }
        }
        headers.insert(AUTHORIZATION, self.bearer()?);
        headers.insert(IMPERSONATE_USER_HEADER, header_value(role)?);
        headers.insert(IMPERSONATE_GROUP_HEADER, HeaderValue::from_static(IMPERSONATE_GROUP));

        Ok(self.http.request(method, self.url(endpoint)).headers(headers))
    }

    /// A request made as the agent's own service account.
    pub fn as_agent(&self, method: Method, endpoint: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, self.url(endpoint))
            .bearer_auth(&self.token)
    }

    /// Upgrade request for a remote-command websocket on behalf of `role`.
    pub fn exec_request(&self, endpoint: &str, role: &str) -> Result<WsRequest> {
        let url = self.url(endpoint);
        let url = if let Some(rest) = url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            url
        };

        let mut request = url.into_client_request()?;
        let headers = request.headers_mut();
        headers.insert(AUTHORIZATION, self.bearer()?);
        headers.insert(IMPERSONATE_USER_HEADER, header_value(role)?);
        headers.insert(IMPERSONATE_GROUP_HEADER, HeaderValue::from_static(IMPERSONATE_GROUP));
        headers.insert(
            "sec-websocket-protocol",
            HeaderValue::from_static(EXEC_PROTOCOLS),
        );
        Ok(request)
    }

    /// TLS connector for exec upgrades; `None` uses the websocket defaults.
    pub fn exec_connector(&self) -> Option<Connector> {
        self.tls.clone().map(Connector::Rustls)
    }

    fn bearer(&self) -> Result<HeaderValue> {
        let mut value = header_value(&format!("Bearer {}", self.token))?;
        value.set_sensitive(true);
        Ok(value)
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|_| Error::processing("header value is not valid ASCII"))
}

fn read_trimmed(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|e| Error::startup(format!("could not read {}: {e}", path.display())))
}

/// rustls client config trusting exactly the certificates in `ca_pem`.
fn exec_tls_config(ca_pem: &[u8]) -> Result<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in CertificateDer::pem_slice_iter(ca_pem) {
        let cert = cert.map_err(|e| Error::startup(format!("invalid cluster CA: {e}")))?;
        roots
            .add(cert)
            .map_err(|e| Error::startup(format!("invalid cluster CA: {e}")))?;
    }
    if roots.is_empty() {
        return Err(Error::startup("cluster CA bundle holds no certificates"));
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::startup(format!("TLS setup failed: {e}")))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> KubeClient {
        KubeClient::new("https://10.0.0.1:443/", "sa-token", "bctl", None).unwrap()
    }

    #[test]
    fn test_impersonation_replaces_operator_credentials() {
        let operator = HeaderMap::from([
            ("Authorization".into(), vec!["Bearer localhost-token".into()]),
            ("Accept".into(), vec!["application/json".into()]),
            ("Impersonate-User".into(), vec!["admin".into()]),
        ]);
        let request = client()
            .impersonated(Method::GET, "/api/v1/pods", "dev-role", &operator)
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(request.url().as_str(), "https://10.0.0.1/api/v1/pods");
        let headers = request.headers();
        assert_eq!(headers[AUTHORIZATION], "Bearer sa-token");
        assert_eq!(headers["impersonate-user"], "dev-role");
        assert_eq!(headers["impersonate-group"], IMPERSONATE_GROUP);
        assert_eq!(headers["accept"], "application/json");
        assert_eq!(headers.get_all("impersonate-user").iter().count(), 1);
    }

    #[test]
    fn test_exec_request_uses_websocket_scheme_and_subprotocols() {
        let request = client()
            .exec_request("/api/v1/namespaces/default/pods/p/exec?command=sh", "dev-role")
            .unwrap();
        assert_eq!(request.uri().scheme_str(), Some("wss"));
        assert_eq!(request.headers()["Sec-WebSocket-Protocol"], EXEC_PROTOCOLS);
        assert_eq!(request.headers()["Impersonate-User"], "dev-role");
    }

    #[test]
    fn test_url_joins_endpoint() {
        let c = client();
        assert_eq!(c.url("api"), "https://10.0.0.1:443/api");
        assert_eq!(c.url("/api"), "https://10.0.0.1:443/api");
    }

    #[test]
    fn test_ca_bundle_without_certs_rejected() {
        assert!(exec_tls_config(b"not a pem").is_err());
    }
}
