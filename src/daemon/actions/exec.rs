//! `kube/exec`: kubectl's remote-command websocket bridged onto a session.
//!
//! The query names the sub-streams the operator wants. They are multiplexed
//! by the remote-command subprotocol, so a sub-stream exists once the socket
//! has negotiated `v5` or `v4`. Its owning task registers it then: the
//! inbound pump owns stdin and resize, the delivery loop owns stdout, stderr
//! and error. `kube/exec/start` goes out only once every declared sub-stream
//! is registered. A socket that negotiated nothing registers none and fails
//! after the registration window.
//!
//! Closing stdin (a v5 `CLOSE` frame for channel 0) or the whole socket ends
//! the session with `kube/exec/stop`.
//!
//! ```text
//!   kubectl ──ch0 stdin──▶ inbound pump ──kube/exec/input──▶ agent
//!           ──ch4 resize─▶             ──kube/exec/resize─▶
//!           ◀─ch1/ch2──── delivery loop ◀─exec/stdout,stderr─
//!           ◀─ch3 status─               ◀─exec/exit──────────
//! ```

use std::collections::BTreeSet;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        FromRequestParts, Request,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::{bastion_closed, stop};
use crate::action::ordering::SequenceBuffer;
use crate::action::payloads::{ExecInputRequest, ExecResizeRequest, ExecStartRequest, TerminalSize};
use crate::action::remotecommand::{
    self, CLOSE, ERROR, RESIZE, STDERR, STDIN, STDOUT, V4_PROTOCOL, V5_PROTOCOL,
};
use crate::action::{ActionKind, EXEC_INPUT, EXEC_RESIZE, EXEC_START, EXEC_STOP};
use crate::daemon::auth::Audit;
use crate::daemon::datachannel::{Requests, SessionEvent};
use crate::daemon::{DaemonState, Session};
use crate::error::{Error, Result};
use crate::message::{StreamMessage, StreamType};

/// Every declared sub-stream must register within this window.
pub const STREAM_TIMEOUT: Duration = Duration::from_secs(30);
/// No traffic either way for this long ends the session.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SubStream {
    Stdin,
    Stdout,
    Stderr,
    Error,
    Resize,
}

/// What kubectl asked for in the exec query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOptions {
    pub command: Vec<String>,
    pub stdin: bool,
    pub stdout: bool,
    pub stderr: bool,
    pub tty: bool,
}

impl ExecOptions {
    pub fn parse(path_and_query: &str) -> Result<Self> {
        let url = reqwest::Url::parse(&format!("http://localhost{path_and_query}"))
            .map_err(|e| Error::processing(format!("malformed exec url: {e}")))?;
        let mut options = Self::default();
        for (key, value) in url.query_pairs() {
            let on = value == "true" || value == "1";
            match key.as_ref() {
                "command" => options.command.push(value.into_owned()),
                "stdin" => options.stdin = on,
                "stdout" => options.stdout = on,
                "stderr" => options.stderr = on,
                "tty" => options.tty = on,
                _ => {}
            }
        }
        if options.command.is_empty() {
            return Err(Error::processing("exec request names no command"));
        }
        Ok(options)
    }

    /// The error stream always, plus one per enabled kind.
    pub fn declared(&self) -> BTreeSet<SubStream> {
        let mut streams = BTreeSet::from([SubStream::Error]);
        for (on, stream) in [
            (self.stdin, SubStream::Stdin),
            (self.stdout, SubStream::Stdout),
            (self.stderr, SubStream::Stderr),
            (self.tty, SubStream::Resize),
        ] {
            if on {
                streams.insert(stream);
            }
        }
        streams
    }
}

/// Wait until every `declared` sub-stream has been announced.
pub async fn wait_for_streams(
    announced: &mut mpsc::Receiver<SubStream>,
    declared: &BTreeSet<SubStream>,
    timeout: Duration,
) -> Result<()> {
    let mut missing = declared.clone();
    let registered = tokio::time::timeout(timeout, async {
        while !missing.is_empty() {
            let Some(stream) = announced.recv().await else {
                return false;
            };
            missing.remove(&stream);
        }
        true
    })
    .await;
    match registered {
        Ok(true) => Ok(()),
        _ => Err(Error::processing(format!(
            "sub-streams {missing:?} not ready within {}s",
            timeout.as_secs()
        ))),
    }
}

pub async fn handle(
    state: DaemonState,
    request_id: String,
    audit: Audit,
    request: Request,
) -> Response {
    let (mut parts, _body) = request.into_parts();
    let upgrade = match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };
    let endpoint = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path().to_string(), ToString::to_string);
    let options = match ExecOptions::parse(&endpoint) {
        Ok(options) => options,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    let session = match state.open_session(&request_id, ActionKind::Exec).await {
        Ok(session) => session,
        Err(e) => {
            warn!(request_id = %request_id, "Exec: could not open session: {e}");
            return bastion_closed(Some(&e.to_string()));
        }
    };

    let start = ExecStartRequest {
        request_id: request_id.clone(),
        log_id: audit.log_id,
        command: options.command.clone(),
        endpoint,
        command_being_run: audit.command,
        is_tty: options.tty,
    };
    let stream_timeout = state.exec_stream_timeout;
    let span = info_span!("exec", request_id = %request_id);
    upgrade
        .protocols([V5_PROTOCOL, V4_PROTOCOL])
        .on_upgrade(move |socket| {
            ExecSession {
                session,
                options,
                start,
                stream_timeout,
            }
            .run(socket)
            .instrument(span)
        })
}

struct ExecSession {
    session: Session,
    options: ExecOptions,
    start: ExecStartRequest,
    stream_timeout: Duration,
}

/// Whether the socket speaks a channel-multiplexing remote-command protocol.
fn negotiated(socket: &WebSocket) -> bool {
    socket
        .protocol()
        .and_then(|p| p.to_str().ok())
        .is_some_and(|p| p == V5_PROTOCOL || p == V4_PROTOCOL)
}

enum Ending {
    /// The command finished on the agent.
    Exited,
    /// The session died; the operator gets a failure status.
    Lost(Option<String>),
    /// We end it: local close, idle, or a dead local socket.
    Stop,
    /// We end it and tell the operator why.
    Failed(String),
}

impl ExecSession {
    async fn run(self, socket: WebSocket) {
        let Self {
            mut session,
            options,
            start,
            stream_timeout,
        } = self;
        info!("Exec: starting {:?} (tty: {})", start.command, start.is_tty);
        let multiplexed = negotiated(&socket);
        if !multiplexed {
            warn!("Exec: client negotiated no remote-command protocol");
        }
        let (mut sink, stream) = socket.split();
        let declared = options.declared();
        let (announce_tx, mut announce_rx) = mpsc::channel(8);
        let (ready_tx, ready_rx) = oneshot::channel();
        let activity = Arc::new(Notify::new());
        let local_closed = CancellationToken::new();

        let inbound = Inbound {
            requests: session.channel.requests(),
            request_id: start.request_id.clone(),
            log_id: start.log_id.clone(),
            options: options.clone(),
            multiplexed,
            activity: activity.clone(),
        };
        let inbound = tokio::spawn(
            inbound
                .run(stream, announce_tx.clone(), ready_rx, local_closed.clone())
                .in_current_span(),
        );

        for (on, owned) in [
            (options.stdout, SubStream::Stdout),
            (options.stderr, SubStream::Stderr),
            (true, SubStream::Error),
        ] {
            if on && multiplexed {
                let _ = announce_tx.send(owned).await;
            }
        }
        drop(announce_tx);

        if let Err(e) = wait_for_streams(&mut announce_rx, &declared, stream_timeout).await {
            warn!("Exec: {e}");
            finish(&mut sink, Some(&e.to_string())).await;
            inbound.abort();
            return;
        }

        let queued = match serde_json::to_vec(&start) {
            Ok(payload) => session.channel.request(EXEC_START, payload).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = queued {
            finish(&mut sink, Some(&e.to_string())).await;
            inbound.abort();
            return;
        }
        let _ = ready_tx.send(());

        let delivery = Delivery {
            options: &options,
            stdout: SequenceBuffer::new(0),
            stderr: SequenceBuffer::new(0),
        };
        match delivery
            .run(&mut session, &mut sink, &activity, &local_closed)
            .await
        {
            Ending::Exited => {
                info!("Exec: command finished");
                let _ = sink.send(Message::Close(None)).await;
            }
            Ending::Lost(reason) => {
                info!("Exec: session lost: {}", reason.as_deref().unwrap_or("closed"));
                let message = format!(
                    "Daemon connection has been closed by Bastion. Message: {}",
                    reason.as_deref().unwrap_or("connection closed")
                );
                finish(&mut sink, Some(&message)).await;
            }
            Ending::Stop => {
                stop(&mut session.channel, EXEC_STOP, &start.request_id, &start.log_id).await;
                let _ = sink.send(Message::Close(None)).await;
            }
            Ending::Failed(reason) => {
                warn!("Exec: {reason}");
                stop(&mut session.channel, EXEC_STOP, &start.request_id, &start.log_id).await;
                finish(&mut sink, Some(&reason)).await;
            }
        }
        inbound.abort();
    }
}

/// Write a failure status on the error channel and close.
async fn finish(sink: &mut SplitSink<WebSocket, Message>, reason: Option<&str>) {
    if let Some(reason) = reason {
        let status = remotecommand::frame(ERROR, &remotecommand::failure_status(reason));
        let _ = sink.send(Message::Binary(status.into())).await;
    }
    let _ = sink.send(Message::Close(None)).await;
}

/// Agent output to the local socket. Stdout and exit share one sequence;
/// stderr has its own.
struct Delivery<'a> {
    options: &'a ExecOptions,
    stdout: SequenceBuffer<StreamMessage>,
    stderr: SequenceBuffer<StreamMessage>,
}

impl Delivery<'_> {
    async fn run(
        mut self,
        session: &mut Session,
        sink: &mut SplitSink<WebSocket, Message>,
        activity: &Notify,
        local_closed: &CancellationToken,
    ) -> Ending {
        let idle = tokio::time::sleep(IDLE_TIMEOUT);
        tokio::pin!(idle);
        loop {
            tokio::select! {
                () = local_closed.cancelled() => {
                    info!("Exec: local stream closed");
                    return Ending::Stop;
                }
                () = &mut idle => {
                    info!("Exec: idle for {}s", IDLE_TIMEOUT.as_secs());
                    return Ending::Stop;
                }
                () = activity.notified() => {
                    idle.as_mut().reset(Instant::now() + IDLE_TIMEOUT);
                }
                event = session.channel.next_event() => {
                    idle.as_mut().reset(Instant::now() + IDLE_TIMEOUT);
                    match event {
                        SessionEvent::Ack { action, .. } => debug!("Exec: {action} acknowledged"),
                        SessionEvent::Stream(msg) => {
                            if let ControlFlow::Break(ending) = self.deliver(msg, sink).await {
                                return ending;
                            }
                        }
                        SessionEvent::Terminated(reason) => return Ending::Lost(reason),
                    }
                }
            }
        }
    }

    async fn deliver(
        &mut self,
        msg: StreamMessage,
        sink: &mut SplitSink<WebSocket, Message>,
    ) -> ControlFlow<Ending> {
        let pushed = match msg.stream_type() {
            Some(StreamType::ExecStdout | StreamType::ExecExit) => {
                self.stdout.push(msg.sequence_number, msg)
            }
            Some(StreamType::ExecStderr) => self.stderr.push(msg.sequence_number, msg),
            _ => {
                warn!("Exec: dropping unexpected {} envelope", msg.kind);
                return ControlFlow::Continue(());
            }
        };
        let ready = match pushed {
            Ok(ready) => ready,
            Err(e) => return ControlFlow::Break(Ending::Failed(e.to_string())),
        };

        for msg in ready {
            let content = match msg.decode_content() {
                Ok(content) => content,
                Err(e) => {
                    warn!("Exec: dropping undecodable {} envelope: {e}", msg.kind);
                    continue;
                }
            };
            let frame = match msg.stream_type() {
                Some(StreamType::ExecStdout) if self.options.stdout => {
                    remotecommand::frame(STDOUT, &content)
                }
                Some(StreamType::ExecStderr) if self.options.stderr => {
                    remotecommand::frame(STDERR, &content)
                }
                Some(StreamType::ExecExit) => {
                    let status = remotecommand::exit_status(&content);
                    if sink
                        .send(Message::Binary(remotecommand::frame(ERROR, &status).into()))
                        .await
                        .is_err()
                    {
                        debug!("Exec: local stream gone before the exit status");
                    }
                    return ControlFlow::Break(Ending::Exited);
                }
                _ => continue,
            };
            if let Err(e) = sink.send(Message::Binary(frame.into())).await {
                debug!("Exec: local write failed: {e}");
                return ControlFlow::Break(Ending::Stop);
            }
        }
        ControlFlow::Continue(())
    }
}

/// kubectl's frames to Data requests.
struct Inbound {
    requests: Requests,
    request_id: String,
    log_id: String,
    options: ExecOptions,
    multiplexed: bool,
    activity: Arc<Notify>,
}

impl Inbound {
    async fn run(
        self,
        mut stream: SplitStream<WebSocket>,
        announce: mpsc::Sender<SubStream>,
        ready: oneshot::Receiver<()>,
        local_closed: CancellationToken,
    ) {
        for (on, owned) in [
            (self.options.stdin, SubStream::Stdin),
            (self.options.tty, SubStream::Resize),
        ] {
            if on && self.multiplexed {
                let _ = announce.send(owned).await;
            }
        }
        drop(announce);
        if ready.await.is_err() {
            return;
        }

        while let Some(frame) = stream.next().await {
            let data = match frame {
                Ok(Message::Binary(data)) => data,
                Ok(Message::Close(_)) => break,
                Ok(_) => continue,
                Err(e) => {
                    debug!("Exec: local read failed: {e}");
                    break;
                }
            };
            self.activity.notify_one();
            let Some((&channel, payload)) = data.split_first() else {
                continue;
            };
            let sent = match channel {
                STDIN => self.stdin(payload).await,
                RESIZE => self.resize(payload).await,
                CLOSE if payload.first() == Some(&STDIN) => {
                    info!("Exec: stdin closed");
                    break;
                }
                CLOSE => {
                    debug!("Exec: ignoring half-close of channel {:?}", payload.first());
                    continue;
                }
                other => {
                    warn!("Exec: dropping frame on channel {other}");
                    continue;
                }
            };
            if let Err(e) = sent {
                match e {
                    Error::Closed(_) => break,
                    e => warn!("Exec: {e}"),
                }
            }
        }
        local_closed.cancel();
    }

    async fn stdin(&self, bytes: &[u8]) -> Result<()> {
        let body = ExecInputRequest {
            request_id: self.request_id.clone(),
            log_id: self.log_id.clone(),
            stdin: bytes.to_vec(),
        };
        self.requests
            .send(EXEC_INPUT, serde_json::to_vec(&body)?)
            .await
    }

    async fn resize(&self, json: &[u8]) -> Result<()> {
        let size: TerminalSize = serde_json::from_slice(json)?;
        debug!("Exec: resize to {}x{}", size.width, size.height);
        let body = ExecResizeRequest {
            request_id: self.request_id.clone(),
            log_id: self.log_id.clone(),
            width: size.width,
            height: size.height,
        };
        self.requests
            .send(EXEC_RESIZE, serde_json::to_vec(&body)?)
            .await
    }
}
