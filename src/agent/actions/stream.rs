//! `kube/{log,watch,stream}`: pump a cluster response body back as stream
//! envelopes.
//!
//! Sequence 0 carries the status and headers, then the body follows in reads
//! of at most [`ActionKind::read_size`] bytes. At EOF a `kube/stream/end`
//! envelope closes the sequence. A stop or the data channel's cancellation
//! drops the body, which closes the connection to the cluster.

use std::io;

use futures_util::TryStreamExt;
use reqwest::Method;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::{header_map, StreamWriter};
use crate::action::payloads::{KubeRequest, StreamHeaders};
use crate::action::{advance_state, ActionKind, ActionState};
use crate::agent::kube::KubeClient;
use crate::error::{Error, Result};
use crate::message::StreamType;
use crate::transport::TransportSender;

pub fn stream_type(kind: ActionKind) -> StreamType {
    match kind {
        ActionKind::Log => StreamType::LogStdout,
        ActionKind::Watch => StreamType::WatchStdout,
        _ => StreamType::StreamStdout,
    }
}

pub struct StreamAction {
    cancel: CancellationToken,
    state: watch::Receiver<ActionState>,
}

impl StreamAction {
    pub async fn start(
        kube: &KubeClient,
        role: &str,
        kind: ActionKind,
        req: KubeRequest,
        sender: TransportSender,
        parent: &CancellationToken,
    ) -> Result<Self> {
        let method = Method::from_bytes(req.method.as_bytes())
            .map_err(|_| Error::processing(format!("invalid HTTP method: {}", req.method)))?;
        info!(request_id = %req.request_id, "Stream: making request for {}", req.endpoint);

        let response = kube
            .impersonated(method, &req.endpoint, role, &req.headers)?
            .body(req.body_bytes()?)
            .send()
            .await
            .map_err(|e| Error::execution(format!("bad response to API request: {e}")))?;

        let headers = StreamHeaders {
            headers: header_map(response.headers()),
            status_code: response.status().as_u16(),
        };
        let body = StreamReader::new(Box::pin(response.bytes_stream().map_err(io::Error::other)));

        let cancel = parent.child_token();
        let (state_tx, state_rx) = watch::channel(ActionState::Created);
        let writer = StreamWriter::new(sender, stream_type(kind), &req.request_id, &req.log_id);
        let span = info_span!("stream", request_id = %req.request_id, action = %kind);
        tokio::spawn(
            run(headers, body, kind.read_size(), writer, cancel.clone(), state_tx).instrument(span),
        );

        Ok(Self {
            cancel,
            state: state_rx,
        })
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> ActionState {
        *self.state.borrow()
    }
}

async fn run<R>(
    headers: StreamHeaders,
    body: R,
    read_size: usize,
    mut writer: StreamWriter,
    cancel: CancellationToken,
    state: watch::Sender<ActionState>,
) where
    R: AsyncRead + Unpin,
{
    advance_state(&state, ActionState::Active);
    if let Err(e) = pump(headers, body, read_size, &mut writer, &cancel).await {
        warn!("Stream: {e}");
    }
    advance_state(&state, ActionState::Closing);
    // the body is dropped by now, which releases the cluster connection
    advance_state(&state, ActionState::Closed);
}

async fn pump<R>(
    headers: StreamHeaders,
    mut body: R,
    read_size: usize,
    writer: &mut StreamWriter,
    cancel: &CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    writer.send(&serde_json::to_vec(&headers)?).await?;

    let mut buf = vec![0u8; read_size];
    loop {
        let n = tokio::select! {
            () = cancel.cancelled() => {
                info!("Stream: stopped");
                return Ok(());
            }
            n = body.read(&mut buf) => n?,
        };
        if n == 0 {
            debug!("Stream: received EOF");
            writer.send_as(StreamType::StreamEnd, b"").await?;
            return Ok(());
        }
        writer.send(&buf[..n]).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::payloads::HeaderMap;
    use crate::message::StreamMessage;
    use crate::transport::Transport;
    use std::time::Duration;

    fn headers() -> StreamHeaders {
        StreamHeaders {
            headers: HeaderMap::from([("Content-Type".into(), vec!["text/plain".into()])]),
            status_code: 200,
        }
    }

    #[tokio::test]
    async fn test_headers_then_chunks_then_end() {
        let (near, mut far) = Transport::pair(16);
        let writer = StreamWriter::new(near.sender(), StreamType::LogStdout, "r", "l");
        let body: &[u8] = &[b'x'; 5000];
        let (state_tx, state_rx) = watch::channel(ActionState::Active);
        run(headers(), body, 2048, writer, CancellationToken::new(), state_tx).await;
        assert!(state_rx.borrow().is_closed());

        let mut seen = Vec::new();
        for _ in 0..5 {
            let msg: StreamMessage = far.recv().await.unwrap().payload().unwrap();
            seen.push(msg);
        }
        let first: StreamHeaders = serde_json::from_slice(&seen[0].decode_content().unwrap()).unwrap();
        assert_eq!(first.headers["Content-Type"], vec!["text/plain"]);

        let sizes: Vec<usize> = seen[1..4]
            .iter()
            .map(|m| m.decode_content().unwrap().len())
            .collect();
        assert!(sizes.iter().all(|n| *n <= 2048));
        assert_eq!(sizes.iter().sum::<usize>(), 5000);

        assert_eq!(seen[4].stream_type(), Some(StreamType::StreamEnd));
        let seqs: Vec<u64> = seen.iter().map(|m| m.sequence_number).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_stop_closes_read_side_promptly() {
        let (near, mut far) = Transport::pair(16);
        let writer = StreamWriter::new(near.sender(), StreamType::WatchStdout, "r", "l");
        // never produces data, like an idle watch
        let (_cluster, body) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        let (state_tx, mut state_rx) = watch::channel(ActionState::Active);
        let task = tokio::spawn(run(headers(), body, 10240, writer, cancel.clone(), state_tx));

        let _headers = far.recv().await.unwrap();
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), state_rx.wait_for(|s| s.is_closed()))
            .await
            .unwrap()
            .unwrap();
        task.await.unwrap();
    }
}
