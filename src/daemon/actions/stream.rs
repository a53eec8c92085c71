//! `kube/{log,watch}`: a cluster response body streamed to kubectl.
//!
//! The local response is committed when the headers envelope (sequence 0)
//! arrives; body envelopes follow strictly by sequence number. The stream
//! ends on `kube/stream/end`, when the session terminates, or when kubectl
//! hangs up, in which case the agent is told to stop.

use std::collections::VecDeque;
use std::io;

use axum::{
    body::{Body, Bytes},
    http::StatusCode,
    response::Response,
};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, info_span, warn, Instrument};

use super::rest::apply_headers;
use super::{bastion_closed, stop};
use crate::action::ordering::SequenceBuffer;
use crate::action::payloads::{KubeRequest, StreamHeaders};
use crate::action::ActionKind;
use crate::daemon::datachannel::SessionEvent;
use crate::daemon::{DaemonState, Session};
use crate::message::{StreamMessage, StreamType};

type Chunk = Result<Bytes, io::Error>;

pub async fn handle(state: &DaemonState, kind: ActionKind, request: KubeRequest) -> Response {
    let session = match state.open_session(&request.request_id, kind).await {
        Ok(session) => session,
        Err(e) => {
            warn!(request_id = %request.request_id, "Stream: could not open session: {e}");
            return bastion_closed(Some(&e.to_string()));
        }
    };

    let started = match serde_json::to_vec(&request) {
        Ok(payload) => session.channel.request(kind.start_path(), payload).await,
        Err(e) => Err(e.into()),
    };
    if let Err(e) = started {
        return bastion_closed(Some(&e.to_string()));
    }

    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, body_rx) = mpsc::channel(state.channel_capacity);
    let pump = Pump {
        session,
        kind,
        log_id: request.log_id,
        buffer: SequenceBuffer::new(0),
        pending: VecDeque::new(),
    };
    let span = info_span!("stream", request_id = %request.request_id, action = %kind);
    tokio::spawn(pump.run(head_tx, body_tx, body_rx).instrument(span));

    head_rx.await.unwrap_or_else(|_| bastion_closed(None))
}

enum Headers {
    Arrived(StreamMessage),
    /// The session ended first; nothing is committed yet.
    Terminated(Option<String>),
    /// kubectl stopped waiting.
    Abandoned,
}

struct Pump {
    session: Session,
    kind: ActionKind,
    log_id: String,
    buffer: SequenceBuffer<StreamMessage>,
    /// In order, not yet written.
    pending: VecDeque<StreamMessage>,
}

impl Pump {
    async fn run(
        mut self,
        mut head_tx: oneshot::Sender<Response>,
        body_tx: mpsc::Sender<Chunk>,
        body_rx: mpsc::Receiver<Chunk>,
    ) {
        let first = match self.wait_for_headers(&mut head_tx).await {
            Headers::Arrived(first) => first,
            Headers::Terminated(reason) => {
                let _ = head_tx.send(bastion_closed(reason.as_deref()));
                return;
            }
            Headers::Abandoned => return,
        };
        let response = match head(&first, body_rx) {
            Ok(response) => response,
            Err(reason) => {
                warn!("Stream: {reason}");
                let _ = head_tx.send(bastion_closed(Some(&reason)));
                return;
            }
        };
        if head_tx.send(response).is_err() {
            return self.stop().await;
        }
        self.pump_body(&body_tx).await;
    }

    async fn wait_for_headers(&mut self, head_tx: &mut oneshot::Sender<Response>) -> Headers {
        loop {
            if let Some(first) = self.pending.pop_front() {
                return Headers::Arrived(first);
            }
            tokio::select! {
                () = head_tx.closed() => {
                    info!("Stream: local client went away before the response started");
                    self.stop().await;
                    return Headers::Abandoned;
                }
                next = self.next_ordered() => {
                    if let Err(reason) = next {
                        return Headers::Terminated(reason);
                    }
                }
            }
        }
    }

    async fn pump_body(&mut self, body_tx: &mpsc::Sender<Chunk>) {
        loop {
            while let Some(msg) = self.pending.pop_front() {
                if msg.stream_type() == Some(StreamType::StreamEnd) {
                    info!("Stream: cluster closed the stream");
                    return;
                }
                let bytes = match msg.decode_content() {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!("Stream: dropping undecodable chunk {}: {e}", msg.sequence_number);
                        continue;
                    }
                };
                if body_tx.send(Ok(Bytes::from(bytes))).await.is_err() {
                    info!("Stream: local client went away");
                    return self.stop().await;
                }
            }
            tokio::select! {
                () = body_tx.closed() => {
                    info!("Stream: local client went away");
                    return self.stop().await;
                }
                next = self.next_ordered() => {
                    if let Err(reason) = next {
                        info!("Stream: session ended: {}", reason.as_deref().unwrap_or("closed"));
                        return;
                    }
                }
            }
        }
    }

    /// Wait for more deliverable envelopes. `Err` carries the termination
    /// reason.
    async fn next_ordered(&mut self) -> Result<(), Option<String>> {
        loop {
            match self.session.channel.next_event().await {
                SessionEvent::Stream(msg) => {
                    let ready = match self.buffer.push(msg.sequence_number, msg) {
                        Ok(ready) => ready,
                        Err(e) => {
                            warn!("Stream: {e}");
                            self.stop().await;
                            return Err(Some(e.to_string()));
                        }
                    };
                    if ready.is_empty() {
                        debug!("Stream: holding out-of-order chunk ({} pending)", self.buffer.pending());
                        continue;
                    }
                    self.pending.extend(ready);
                    return Ok(());
                }
                SessionEvent::Ack { action, .. } => debug!("Stream: {action} acknowledged"),
                SessionEvent::Terminated(reason) => return Err(reason),
            }
        }
    }

    async fn stop(&mut self) {
        if let Some(stop_action) = self.kind.stop_path() {
            let request_id = self.session.request_id.clone();
            stop(&mut self.session.channel, stop_action, &request_id, &self.log_id).await;
        }
    }
}

/// The local response for a headers envelope, streaming `body`.
fn head(first: &StreamMessage, body: mpsc::Receiver<Chunk>) -> Result<Response, String> {
    let content = first
        .decode_content()
        .map_err(|e| format!("undecodable stream headers: {e}"))?;
    let headers: StreamHeaders = serde_json::from_slice(&content)
        .map_err(|e| format!("malformed stream headers: {e}"))?;

    let chunks = futures_util::stream::unfold(body, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    });
    let mut response = Response::new(Body::from_stream(chunks));
    *response.status_mut() = StatusCode::from_u16(headers.status_code).unwrap_or(StatusCode::OK);
    apply_headers(response.headers_mut(), &headers.headers);
    Ok(response)
}
