//! `kube/exec/*`: an interactive command in a pod.
//!
//! The cluster side is a remote-command websocket. Stdin and resize requests
//! arriving as Data are queued on bounded channels and written to it; stdout
//! and stderr frames go back as stream envelopes. When the command ends the
//! agent sends `kube/exec/exit` carrying the cluster's final Status.
//! Cancelling the action closes the websocket, which ends the remote stdin.

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::StreamWriter;
use crate::action::payloads::{ExecStartRequest, TerminalSize};
use crate::action::remotecommand::{self, ERROR, RESIZE, STDERR, STDIN, STDOUT};
use crate::action::{advance_state, ActionState};
use crate::agent::kube::KubeClient;
use crate::error::{Error, Result};
use crate::message::StreamType;
use crate::transport::TransportSender;

const STDIN_CAPACITY: usize = 10;
const RESIZE_CAPACITY: usize = 10;

pub struct ExecAction {
    stdin: mpsc::Sender<Vec<u8>>,
    resize: mpsc::Sender<TerminalSize>,
    cancel: CancellationToken,
    state: watch::Receiver<ActionState>,
}

impl ExecAction {
    pub async fn start(
        kube: &KubeClient,
        role: &str,
        req: ExecStartRequest,
        sender: TransportSender,
        parent: &CancellationToken,
    ) -> Result<Self> {
        info!(request_id = %req.request_id, "Exec: starting {:?} (tty: {})", req.command, req.is_tty);
        let mut stdout = StreamWriter::new(
            sender.clone(),
            StreamType::ExecStdout,
            &req.request_id,
            &req.log_id,
        );
        let stderr = StreamWriter::new(sender, StreamType::ExecStderr, &req.request_id, &req.log_id);

        let request = kube.exec_request(&req.endpoint, role)?;
        let connected = tokio_tungstenite::connect_async_tls_with_config(
            request,
            None,
            false,
            kube.exec_connector(),
        )
        .await;

        let (ws, _response) = match connected {
            Ok(ws) => ws,
            Err(e) => {
                // reported to the operator as the command's final status
                let message = format!("exec upgrade failed: {e}");
                warn!("Exec: {message}");
                stdout.send_as(StreamType::ExecExit, message.as_bytes()).await?;
                return Ok(Self::finished());
            }
        };

        Ok(Self::spawn(ws, stdout, stderr, parent, &req.request_id))
    }

    fn spawn<S>(
        ws: WebSocketStream<S>,
        stdout: StreamWriter,
        stderr: StreamWriter,
        parent: &CancellationToken,
        request_id: &str,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (stdin_tx, stdin_rx) = mpsc::channel(STDIN_CAPACITY);
        let (resize_tx, resize_rx) = mpsc::channel(RESIZE_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ActionState::Created);
        let cancel = parent.child_token();

        let span = info_span!("exec", request_id = %request_id);
        tokio::spawn(
            run(ws, stdin_rx, resize_rx, stdout, stderr, cancel.clone(), state_tx).instrument(span),
        );

        Self {
            stdin: stdin_tx,
            resize: resize_tx,
            cancel,
            state: state_rx,
        }
    }

    /// An action whose command never started.
    pub(super) fn finished() -> Self {
        let (stdin, _) = mpsc::channel(1);
        let (resize, _) = mpsc::channel(1);
        let (_, state) = watch::channel(ActionState::Closed);
        Self {
            stdin,
            resize,
            cancel: CancellationToken::new(),
            state,
        }
    }

    /// Queue stdin bytes; waits while the queue is full.
    pub async fn write_stdin(&self, bytes: Vec<u8>) -> Result<()> {
        self.stdin
            .send(bytes)
            .await
            .map_err(|_| Error::processing("exec session has ended"))
    }

    pub async fn resize(&self, size: TerminalSize) -> Result<()> {
        self.resize
            .send(size)
            .await
            .map_err(|_| Error::processing("exec session has ended"))
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> ActionState {
        *self.state.borrow()
    }
}

async fn run<S>(
    ws: WebSocketStream<S>,
    mut stdin: mpsc::Receiver<Vec<u8>>,
    mut resize: mpsc::Receiver<TerminalSize>,
    mut stdout: StreamWriter,
    mut stderr: StreamWriter,
    cancel: CancellationToken,
    state: watch::Sender<ActionState>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    advance_state(&state, ActionState::Active);
    let (mut sink, mut frames) = ws.split();
    let mut status: Vec<u8> = Vec::new();

    let outcome: Result<()> = loop {
        tokio::select! {
            () = cancel.cancelled() => {
                info!("Exec: cancelled, closing remote stdin");
                let _ = sink.send(Message::Close(None)).await;
                break Ok(());
            }
            Some(bytes) = stdin.recv() => {
                let frame = remotecommand::frame(STDIN, &bytes);
                if let Err(e) = sink.send(Message::Binary(frame.into())).await {
                    break Err(e.into());
                }
            }
            Some(size) = resize.recv() => {
                let body = serde_json::json!({"Width": size.width, "Height": size.height});
                let frame = remotecommand::frame(RESIZE, body.to_string().as_bytes());
                if let Err(e) = sink.send(Message::Binary(frame.into())).await {
                    break Err(e.into());
                }
            }
            frame = frames.next() => {
                let data = match frame {
                    Some(Ok(Message::Binary(data))) => data,
                    Some(Ok(Message::Close(_))) | None => break Ok(()),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break Err(e.into()),
                };
                let sent = match data.split_first() {
                    Some((&STDOUT, rest)) => stdout.send(rest).await,
                    Some((&STDERR, rest)) => stderr.send(rest).await,
                    Some((&ERROR, rest)) => {
                        status.extend_from_slice(rest);
                        Ok(())
                    }
                    Some((channel, _)) => {
                        debug!("Exec: ignoring frame on channel {channel}");
                        Ok(())
                    }
                    None => Ok(()),
                };
                if let Err(e) = sent {
                    break Err(e);
                }
            }
        }
    };

    advance_state(&state, ActionState::Closing);
    drop(stdin);
    drop(resize);
    if let Err(e) = &outcome {
        warn!("Exec: {e}");
        if status.is_empty() {
            status = e.to_string().into_bytes();
        }
    }
    if let Err(e) = stdout.send_as(StreamType::ExecExit, &status).await {
        debug!("Exec: could not report exit: {e}");
    }
    info!("Exec: session ended");
    advance_state(&state, ActionState::Closed);
}
