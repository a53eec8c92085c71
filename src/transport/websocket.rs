//! Relay websocket client.
//!
//! Connecting is two steps: `POST https://<service><hub>/negotiate` returns a
//! `connectionId`, then the client upgrades `wss://<service><hub>` with that id
//! and announces the JSON hub protocol. A background task owns the socket,
//! forwards inbound envelopes to the [`Transport`] and writes outbound ones
//! wrapped for their hub target. With `auto_reconnect` the task reconnects
//! after a drop, starting at `reconnect_delay_secs` and doubling up to
//! `reconnect_max_delay_secs`.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::signalr::{self, Inbound};
use super::target::TargetSelector;
use super::{challenge, service_host, DoneReason, Transport};
use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::keysplitting::KeyPair;
use crate::message::AgentMessage;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Type alias for the WS sink to reduce verbosity.
type WsSink = Arc<Mutex<futures_util::stream::SplitSink<WsStream, Message>>>;

const SIGNALR_CLIENT_PROTOCOL: &str = "1.5";
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Agent identity used to solve a fresh challenge before each connect.
#[derive(Clone)]
pub struct ChallengeParams {
    pub org_id: String,
    pub cluster_name: String,
    pub keys: Arc<KeyPair>,
}

/// Where and how to connect.
#[derive(Clone)]
pub struct HubOptions {
    /// Relay host, with or without a scheme.
    pub service_url: String,
    /// Hub path, e.g. `/api/v1/hub/kube`.
    pub hub_endpoint: String,
    /// Query parameters for both negotiate and upgrade.
    pub params: Vec<(String, String)>,
    /// Headers for both negotiate and upgrade.
    pub headers: Vec<(String, String)>,
    pub auto_reconnect: bool,
    pub challenge: Option<ChallengeParams>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NegotiateResponse {
    connection_id: String,
}

/// How one connection attempt ended.
enum Disconnect {
    /// Stop for good.
    Done(DoneReason),
    /// Transient; reconnect if allowed.
    Dropped(String),
}

pub struct Websocket {
    options: HubOptions,
    selector: TargetSelector,
    config: TransportConfig,
    http: reqwest::Client,
}

impl Websocket {
    pub fn new(options: HubOptions, selector: TargetSelector, config: TransportConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.negotiate_timeout_secs))
            .build()?;
        Ok(Self {
            options,
            selector,
            config,
            http,
        })
    }

    /// Connect (retrying while `auto_reconnect` is set) and hand back the
    /// owner's end of the pipe. Cancelling `cancel` closes the socket.
    pub async fn connect(self, cancel: CancellationToken) -> Result<Transport> {
        let span = info_span!("websocket", hub = %self.options.hub_endpoint);
        let ws = self
            .establish_with_retry(&cancel)
            .instrument(span.clone())
            .await?;

        let (out_tx, out_rx) = mpsc::channel(self.config.channel_capacity);
        let (in_tx, in_rx) = mpsc::channel(self.config.channel_capacity);
        let (done_tx, done_rx) = watch::channel(None);

        tokio::spawn(
            self.run(ws, out_rx, in_tx, done_tx, cancel.clone())
                .instrument(span),
        );
        Ok(Transport::new(out_tx, in_rx, done_rx, cancel))
    }

    async fn run(
        self,
        ws: WsStream,
        mut out_rx: mpsc::Receiver<AgentMessage>,
        in_tx: mpsc::Sender<AgentMessage>,
        done_tx: watch::Sender<Option<DoneReason>>,
        cancel: CancellationToken,
    ) {
        let mut ws = ws;
        let reason = loop {
            match self.pump(ws, &mut out_rx, &in_tx, &cancel).await {
                Disconnect::Done(reason) => break reason,
                Disconnect::Dropped(e) if self.options.auto_reconnect => {
                    warn!("Websocket: connection dropped: {e}, reconnecting");
                    match self.establish_with_retry(&cancel).await {
                        Ok(next) => ws = next,
                        Err(Error::Closed(_)) => break DoneReason::Cancelled,
                        Err(e) => break DoneReason::Failed(e.to_string()),
                    }
                }
                Disconnect::Dropped(e) => {
                    info!("Websocket: connection dropped: {e}");
                    break DoneReason::Failed(e);
                }
            }
        };
        info!("Websocket: closed ({reason:?})");
        cancel.cancel();
        let _ = done_tx.send(Some(reason));
        // in_tx drops here, which ends the owner's recv loop
    }

    /// Serve one live connection until it ends.
    async fn pump(
        &self,
        ws: WsStream,
        out_rx: &mut mpsc::Receiver<AgentMessage>,
        in_tx: &mpsc::Sender<AgentMessage>,
        cancel: &CancellationToken,
    ) -> Disconnect {
        let (ws_sink, mut ws_stream) = ws.split();
        let ws_sink: WsSink = Arc::new(Mutex::new(ws_sink));

        // SignalR servers drop clients that stay silent past their timeout
        let keepalive_sink = ws_sink.clone();
        let keepalive = tokio::spawn(async move {
            let mut interval = tokio::time::interval(KEEPALIVE_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Ok(ping) = String::from_utf8(signalr::ping_frame()) else {
                    break;
                };
                if keepalive_sink
                    .lock()
                    .await
                    .send(Message::Text(ping.into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        let outcome = loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    // owners queue their last envelope right before cancelling
                    self.flush(&ws_sink, out_rx).await;
                    let _ = ws_sink.lock().await.send(Message::Close(None)).await;
                    break Disconnect::Done(DoneReason::Cancelled);
                }
                frame = ws_stream.next() => {
                    let raw = match frame {
                        Some(Ok(Message::Text(text))) => text.as_bytes().to_vec(),
                        Some(Ok(Message::Binary(bytes))) => bytes.to_vec(),
                        Some(Ok(Message::Close(frame))) => {
                            let reason = frame
                                .map(|f| f.reason.as_str().to_string())
                                .filter(|r| !r.is_empty());
                            break Disconnect::Done(DoneReason::Closed(reason));
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => break Disconnect::Dropped(e.to_string()),
                        None => break Disconnect::Dropped("stream ended".to_string()),
                    };
                    if let Some(done) = deliver(&raw, in_tx).await {
                        break done;
                    }
                }
                outgoing = out_rx.recv() => {
                    let Some(msg) = outgoing else {
                        break Disconnect::Done(DoneReason::Cancelled);
                    };
                    if let Err(e) = self.write(&ws_sink, &msg).await {
                        match e {
                            Error::WebSocket(e) => break Disconnect::Dropped(e.to_string()),
                            other => warn!("Websocket: dropping outbound {}: {other}", msg.message_type.as_str()),
                        }
                    }
                }
            }
        };

        keepalive.abort();
        outcome
    }

    /// Write whatever is still queued, without waiting for more.
    async fn flush(&self, ws_sink: &WsSink, out_rx: &mut mpsc::Receiver<AgentMessage>) {
        while let Ok(msg) = out_rx.try_recv() {
            match self.write(ws_sink, &msg).await {
                Ok(()) => {}
                Err(Error::WebSocket(e)) => {
                    debug!("Websocket: flush stopped: {e}");
                    return;
                }
                Err(e) => warn!("Websocket: dropping outbound {}: {e}", msg.message_type.as_str()),
            }
        }
    }

    async fn write(&self, ws_sink: &WsSink, msg: &AgentMessage) -> Result<()> {
        let target = (self.selector)(msg)?;
        let frame = String::from_utf8(signalr::encode(target, msg)?)
            .map_err(|e| Error::processing(format!("outbound frame is not utf-8: {e}")))?;
        debug!(target, "Websocket: sending {}", msg.message_type.as_str());
        ws_sink.lock().await.send(Message::Text(frame.into())).await?;
        Ok(())
    }

    async fn establish_with_retry(&self, cancel: &CancellationToken) -> Result<WsStream> {
        let mut delay = Duration::from_secs(self.config.reconnect_delay_secs);
        let max_delay = Duration::from_secs(self.config.reconnect_max_delay_secs);
        loop {
            if cancel.is_cancelled() {
                return Err(Error::Closed(None));
            }
            match self.establish().await {
                Ok(ws) => return Ok(ws),
                Err(e) if !self.options.auto_reconnect => return Err(e),
                Err(e) => {
                    warn!(
                        "Websocket: connection failed: {e}, retrying in {}s",
                        delay.as_secs()
                    );
                }
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(Error::Closed(None)),
                () = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(max_delay);
        }
    }

    /// Negotiate, upgrade, announce the protocol.
    async fn establish(&self) -> Result<WsStream> {
        let host = service_host(&self.options.service_url);
        let hub = &self.options.hub_endpoint;
        let mut params = self.options.params.clone();

        if let Some(ch) = &self.options.challenge {
            let solved =
                challenge::get_and_solve(&self.http, host, &ch.org_id, &ch.cluster_name, &ch.keys)
                    .await?;
            params.push(("solved_challenge".to_string(), solved));
        }

        let negotiate_url = format!("https://{host}{hub}/negotiate");
        info!("Websocket: negotiating with {negotiate_url}");
        let mut request = self
            .http
            .post(&negotiate_url)
            .query(&params)
            .query(&[("clientProtocol", SIGNALR_CLIENT_PROTOCOL)]);
        for (name, value) in &self.options.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(Error::startup(format!(
                "negotiate returned {}",
                response.status()
            )));
        }
        let negotiated: NegotiateResponse = response.json().await?;

        params.push(("id".to_string(), negotiated.connection_id));
        params.push(("clientProtocol".to_string(), SIGNALR_CLIENT_PROTOCOL.to_string()));
        params.push(("transport".to_string(), "WebSockets".to_string()));
        let url = reqwest::Url::parse_with_params(&format!("wss://{host}{hub}"), &params)
            .map_err(|e| Error::startup(format!("bad websocket url: {e}")))?;

        let mut upgrade = url.as_str().into_client_request()?;
        for (name, value) in &self.options.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::startup(format!("bad header name {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::startup(format!("bad header value: {e}")))?;
            upgrade.headers_mut().insert(name, value);
        }

        let (mut ws, _response) = tokio_tungstenite::connect_async(upgrade).await?;
        let handshake = String::from_utf8(signalr::handshake_frame())
            .map_err(|e| Error::processing(e.to_string()))?;
        ws.send(Message::Text(handshake.into())).await?;
        info!("Websocket: connected to {host}{hub}");
        Ok(ws)
    }
}

/// Hand every envelope in one websocket frame to the owner. `Some` when the
/// frame ends the connection.
async fn deliver(raw: &[u8], in_tx: &mpsc::Sender<AgentMessage>) -> Option<Disconnect> {
    for record in signalr::split_records(raw) {
        match signalr::decode(record) {
            Ok(Inbound::Message(msg)) => {
                if in_tx.send(msg).await.is_err() {
                    return Some(Disconnect::Done(DoneReason::Cancelled));
                }
            }
            Ok(Inbound::Close(reason)) => {
                info!("Websocket: relay closed the connection");
                return Some(Disconnect::Done(DoneReason::Closed(reason)));
            }
            Ok(Inbound::Ignored) => {}
            Err(e) => warn!("Websocket: unreadable record from relay: {e}"),
        }
    }
    None
}
