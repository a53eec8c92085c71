//! Every local request lands here after the token check.

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{HeaderMap as HttpHeaders, StatusCode},
    response::{IntoResponse, Response},
    Extension,
};
use tracing::{info, warn};
use uuid::Uuid;

use super::actions::{exec, rest, stream};
use super::auth::Audit;
use super::DaemonState;
use crate::action::payloads::{HeaderMap, KubeRequest};
use crate::action::ActionKind;

/// Largest request body forwarded to the cluster.
const MAX_BODY: usize = 64 * 1024 * 1024;

/// Headers that belong to the local hop and never reach the cluster.
const LOCAL_HEADERS: &[&str] = &[
    "authorization",
    "connection",
    "content-length",
    "host",
    "transfer-encoding",
    "upgrade",
];

/// Which action serves a request, from its path and query.
pub fn classify(path: &str, query: Option<&str>) -> ActionKind {
    if path.contains("exec") {
        ActionKind::Exec
    } else if path.contains("log") {
        ActionKind::Log
    } else if path.contains("watch")
        || query.is_some_and(|q| q.split('&').any(|pair| pair == "watch=true"))
    {
        ActionKind::Watch
    } else {
        ActionKind::RestApi
    }
}

pub async fn handle(
    State(state): State<DaemonState>,
    Extension(audit): Extension<Audit>,
    request: Request,
) -> Response {
    let request_id = Uuid::new_v4().to_string();
    let kind = classify(request.uri().path(), request.uri().query());
    info!(
        request_id = %request_id,
        action = %kind,
        command = %audit.command,
        "Ingress: {} {}",
        request.method(),
        request.uri()
    );

    match kind {
        ActionKind::Exec => exec::handle(state, request_id, audit, request).await,
        kind => {
            let kube_request = match kube_request(&request_id, &audit, request).await {
                Ok(req) => req,
                Err(response) => return response,
            };
            if kind == ActionKind::RestApi {
                rest::handle(&state, kube_request).await
            } else {
                stream::handle(&state, kind, kube_request).await
            }
        }
    }
}

/// Body of `kube/restapi` and of every stream start.
pub async fn kube_request(
    request_id: &str,
    audit: &Audit,
    request: Request,
) -> Result<KubeRequest, Response> {
    let (parts, body) = request.into_parts();
    let body = read_body(body).await?;
    let mut request = KubeRequest {
        endpoint: parts
            .uri
            .path_and_query()
            .map_or_else(|| parts.uri.path().to_string(), ToString::to_string),
        headers: forwarded_headers(&parts.headers),
        method: parts.method.to_string(),
        request_id: request_id.to_string(),
        command_being_run: audit.command.clone(),
        log_id: audit.log_id.clone(),
        ..KubeRequest::default()
    };
    request.set_body(body);
    Ok(request)
}

async fn read_body(body: Body) -> Result<Vec<u8>, Response> {
    let bytes = to_bytes(body, MAX_BODY).await.map_err(|e| {
        warn!("Ingress: could not read request body: {e}");
        (StatusCode::BAD_REQUEST, format!("could not read request body: {e}")).into_response()
    })?;
    Ok(bytes.to_vec())
}

/// The operator's headers minus the local hop's, including impersonation
/// the agent sets itself.
pub fn forwarded_headers(headers: &HttpHeaders) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = name.as_str();
        if LOCAL_HEADERS.contains(&name) || name.starts_with("impersonate-") {
            continue;
        }
        map.entry(name.to_string())
            .or_insert_with(Vec::new)
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_classify() {
        let cases = [
            ("/api/v1/namespaces/default/pods/p/exec", Some("command=sh"), ActionKind::Exec),
            ("/api/v1/namespaces/default/pods/p/log", Some("follow=true"), ActionKind::Log),
            ("/api/v1/watch/namespaces/default/pods", None, ActionKind::Watch),
            ("/api/v1/namespaces/default/pods", Some("watch=true&rv=1"), ActionKind::Watch),
            ("/api/v1/namespaces/default/pods", Some("watch=false"), ActionKind::RestApi),
            ("/api/v1/namespaces/default/pods", None, ActionKind::RestApi),
        ];
        for (path, query, expected) in cases {
            assert_eq!(classify(path, query), expected, "{path}?{query:?}");
        }
    }

    #[test]
    fn test_local_headers_are_not_forwarded() {
        let mut headers = HttpHeaders::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer local"));
        headers.insert("impersonate-user", HeaderValue::from_static("admin"));
        headers.insert("host", HeaderValue::from_static("localhost:1234"));
        headers.insert("accept", HeaderValue::from_static("application/json"));
        headers.append("x-multi", HeaderValue::from_static("a"));
        headers.append("x-multi", HeaderValue::from_static("b"));

        let map = forwarded_headers(&headers);
        assert_eq!(map.len(), 2);
        assert_eq!(map["accept"], vec!["application/json".to_string()]);
        assert_eq!(map["x-multi"], vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_kube_request_carries_audit_and_query() {
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/namespaces/default/pods?dryRun=All")
            .header("content-type", "application/json")
            .body(Body::from("{\"kind\":\"Pod\"}"))
            .unwrap();
        let audit = Audit {
            command: "kubectl apply".into(),
            log_id: "log-1".into(),
        };
        let req = kube_request("req-1", &audit, request).await.unwrap();
        assert_eq!(req.endpoint, "/api/v1/namespaces/default/pods?dryRun=All");
        assert_eq!(req.method, "POST");
        assert_eq!(req.body, "{\"kind\":\"Pod\"}");
        assert_eq!(req.command_being_run, "kubectl apply");
        assert_eq!(req.log_id, "log-1");
        assert_eq!(req.request_id, "req-1");
    }

    #[tokio::test]
    async fn test_kube_request_keeps_binary_body() {
        let protobuf = vec![0x6b, 0x38, 0x73, 0x00, 0x0a, 0xff];
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/namespaces/default/configmaps")
            .header("content-type", "application/vnd.kubernetes.protobuf")
            .body(Body::from(protobuf.clone()))
            .unwrap();
        let audit = Audit {
            command: "kubectl create".into(),
            log_id: "log-1".into(),
        };
        let req = kube_request("req-1", &audit, request).await.unwrap();
        assert_eq!(req.body_encoding.as_deref(), Some("base64"));
        assert_eq!(req.body_bytes().unwrap(), protobuf);
    }
}
