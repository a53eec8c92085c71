//! `kube/restapi`: one impersonated request, answered in the DataAck.

use reqwest::Method;
use tracing::{info, warn};

use super::header_map;
use crate::action::payloads::{KubeRequest, RestApiResponse};
use crate::agent::kube::KubeClient;
use crate::error::{Error, Result};

pub async fn execute(kube: &KubeClient, role: &str, payload: &[u8]) -> Result<Vec<u8>> {
    let req: KubeRequest = serde_json::from_slice(payload)?;
    let method = Method::from_bytes(req.method.as_bytes())
        .map_err(|_| Error::processing(format!("invalid HTTP method: {}", req.method)))?;
    info!(request_id = %req.request_id, "RestApi: {method} {}", req.endpoint);

    let response = kube
        .impersonated(method, &req.endpoint, role, &req.headers)?
        .body(req.body_bytes()?)
        .send()
        .await
        .map_err(|e| Error::execution(format!("bad response to API request: {e}")))?;

    let status_code = response.status().as_u16();
    if status_code != 200 {
        warn!(request_id = %req.request_id, "RestApi: cluster answered {status_code}");
    }
    let headers = header_map(response.headers());
    let content = response.bytes().await?.to_vec();

    Ok(serde_json::to_vec(&RestApiResponse {
        status_code,
        request_id: req.request_id,
        headers,
        content,
    })?)
}
