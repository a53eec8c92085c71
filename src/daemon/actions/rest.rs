//! `kube/restapi`: one Data, one DataAck, one local response.

use axum::{
    body::Body,
    http::{HeaderMap as HttpHeaders, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::{info, warn};

use super::bastion_closed;
use crate::action::payloads::{header_pairs, HeaderMap, KubeRequest, RestApiResponse};
use crate::action::{ActionKind, REST_API};
use crate::daemon::DaemonState;

pub async fn handle(state: &DaemonState, request: KubeRequest) -> Response {
    let mut session = match state
        .open_session(&request.request_id, ActionKind::RestApi)
        .await
    {
        Ok(session) => session,
        Err(e) => {
            warn!(request_id = %request.request_id, "Rest: could not open session: {e}");
            return bastion_closed(Some(&e.to_string()));
        }
    };

    let payload = match serde_json::to_vec(&request) {
        Ok(payload) => payload,
        Err(e) => return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    };
    if let Err(e) = session.channel.request(REST_API, payload).await {
        return bastion_closed(Some(&e.to_string()));
    }

    let ack = match session.channel.wait_ack(REST_API).await {
        Ok(ack) => ack,
        Err(reason) => return bastion_closed(reason.as_deref()),
    };
    match serde_json::from_slice::<RestApiResponse>(&ack) {
        Ok(response) => {
            info!(
                request_id = %session.request_id,
                "Rest: {} {} -> {}",
                request.method,
                request.endpoint,
                response.status_code
            );
            mirror(response)
        }
        Err(e) => {
            warn!(request_id = %session.request_id, "Rest: malformed response: {e}");
            bastion_closed(Some(&format!("malformed response from agent: {e}")))
        }
    }
}

/// The cluster's response as the local response.
pub fn mirror(response: RestApiResponse) -> Response {
    let status = StatusCode::from_u16(response.status_code).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut out = Response::new(Body::from(response.content));
    *out.status_mut() = status;
    apply_headers(out.headers_mut(), &response.headers);
    out
}

/// Append wire headers, skipping any the local server cannot carry.
pub fn apply_headers(target: &mut HttpHeaders, headers: &HeaderMap) {
    for (name, value) in header_pairs(headers) {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                target.append(name, value);
            }
            _ => warn!("Rest: dropping unrepresentable header {name}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::testing::{app, bearer, state, unreachable_state};
    use crate::error::Error;
    use crate::keysplitting::payload_hash;
    use crate::message::{AgentMessage, ErrorMessage, MessageType};
    use axum::body::to_bytes;
    use axum::http::Request;
    use tower::ServiceExt;

    fn get(path: &str, authorization: &str) -> Request<Body> {
        Request::builder()
            .uri(path)
            .header("authorization", authorization)
            .body(Body::empty())
            .unwrap()
    }

    #[test]
    fn test_mirror_drops_content_length() {
        let response = mirror(RestApiResponse {
            status_code: 404,
            request_id: "r".into(),
            headers: HeaderMap::from([
                ("Content-Type".into(), vec!["application/json".into()]),
                ("Content-Length".into(), vec!["999".into()]),
            ]),
            content: b"{}".to_vec(),
        });
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()["content-type"], "application/json");
        assert!(response.headers().get("content-length").is_none());
    }

    #[tokio::test]
    async fn test_get_round_trip() {
        let (state, mut agents) = state();
        let app = app(state.clone());
        let pods = br#"{"kind":"PodList","items":[]}"#;

        let agent_side = tokio::spawn(async move {
            let mut agent = agents.recv().await.unwrap();
            assert_eq!(agent.accept_syn().await, REST_API);
            let data = agent.recv().await;
            let request: KubeRequest = serde_json::from_slice(data.payload.action_bytes()).unwrap();
            assert_eq!(request.endpoint, "/api/v1/namespaces/default/pods");
            assert_eq!(request.method, "GET");
            assert_eq!(request.command_being_run, "kubectl test");
            assert!(request.headers.get("authorization").is_none());
            let response = RestApiResponse {
                status_code: 200,
                request_id: request.request_id,
                headers: HeaderMap::from([("Content-Type".into(), vec!["application/json".into()])]),
                content: pods.to_vec(),
            };
            agent.reply(&data, serde_json::to_vec(&response).unwrap()).await;
            agent
        });

        let response = app
            .oneshot(get("/api/v1/namespaces/default/pods", &bearer()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), 1 << 20).await.unwrap();
        assert_eq!(&body[..], pods);
        agent_side.await.unwrap();
        assert_eq!(state.registry.count(), 0);
    }

    #[tokio::test]
    async fn test_wrong_token_never_opens_a_session() {
        let (state, mut agents) = state();
        let response = app(state)
            .oneshot(get("/api/v1/namespaces/default/pods", "Bearer wrong-token"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("Localhost token did not validate"));
        assert!(agents.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_agent_error_becomes_500_with_reason() {
        let (state, mut agents) = state();
        let agent_side = tokio::spawn(async move {
            let mut agent = agents.recv().await.unwrap();
            agent.accept_syn().await;
            let data = agent.recv().await;
            let report = ErrorMessage::from_error(
                &Error::execution("bad response to API request"),
                payload_hash(&data.payload).unwrap(),
            );
            agent
                .transport
                .send(AgentMessage::new(MessageType::Error, &report).unwrap())
                .await
                .unwrap();
            agent
        });

        let response = app(state)
            .oneshot(get("/api/v1/namespaces/default/pods", &bearer()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        let body = String::from_utf8_lossy(&body);
        assert!(body.starts_with("Daemon connection has been closed by Bastion. Message: "));
        assert!(body.contains("bad response to API request"));
        agent_side.await.unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_relay_is_500() {
        let response = app(unreachable_state())
            .oneshot(get("/api/v1/nodes", &bearer()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
