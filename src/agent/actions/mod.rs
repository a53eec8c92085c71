//! Cluster-side handlers for the `kube` plugin.
//!
//! One [`KubePlugin`] serves one data channel. REST calls complete inside the
//! Data/DataAck round trip; stream and exec actions keep running in their own
//! tasks, keyed by request id, and report through stream envelopes.
//!
//! Input, resize and stop for a request that has already finished, or was
//! never started, are acknowledged and dropped. Input racing the remote
//! command's exit is routine and must not end the data channel.

pub mod exec;
pub mod rest;
pub mod stream;

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::kube::KubeClient;
use crate::action::payloads::{
    ExecInputRequest, ExecResizeRequest, ExecStartRequest, HeaderMap, KubeRequest,
    StopRequest, TerminalSize,
};
use crate::action::{ActionKind, ActionPath, ActionState, KUBE_PLUGIN};
use crate::error::{Error, Result};
use crate::message::{AgentMessage, MessageType, StreamMessage, StreamType};
use crate::transport::TransportSender;

use exec::ExecAction;
use stream::StreamAction;

/// Emits sequence-numbered stream envelopes for one request.
pub struct StreamWriter {
    sender: TransportSender,
    kind: StreamType,
    request_id: String,
    log_id: String,
    sequence: u64,
}

impl StreamWriter {
    pub fn new(sender: TransportSender, kind: StreamType, request_id: &str, log_id: &str) -> Self {
        Self {
            sender,
            kind,
            request_id: request_id.to_string(),
            log_id: log_id.to_string(),
            sequence: 0,
        }
    }

    pub async fn send(&mut self, content: &[u8]) -> Result<()> {
        self.send_as(self.kind, content).await
    }

    /// Send under another type, sharing this writer's sequence.
    pub async fn send_as(&mut self, kind: StreamType, content: &[u8]) -> Result<()> {
        let msg = StreamMessage::new(kind, &self.request_id, &self.log_id, self.sequence, content);
        self.sequence += 1;
        self.sender
            .send(AgentMessage::new(MessageType::Stream, &msg)?)
            .await
    }
}

/// Wire form of response headers.
pub fn header_map(headers: &reqwest::header::HeaderMap) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.entry(name.as_str().to_string())
            .or_insert_with(Vec::new)
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    map
}

enum Running {
    Stream(StreamAction),
    Exec(ExecAction),
}

impl Running {
    fn stop(&self) {
        match self {
            Self::Stream(s) => s.stop(),
            Self::Exec(e) => e.stop(),
        }
    }

    fn state(&self) -> ActionState {
        match self {
            Self::Stream(s) => s.state(),
            Self::Exec(e) => e.state(),
        }
    }
}

pub struct KubePlugin {
    kube: Arc<KubeClient>,
    role: String,
    sender: TransportSender,
    cancel: CancellationToken,
    running: HashMap<String, Running>,
}

impl KubePlugin {
    /// `cancel` is the data channel's token; every action started here is
    /// cancelled with it.
    pub fn start(
        plugin: &str,
        kube: Arc<KubeClient>,
        role: &str,
        sender: TransportSender,
        cancel: CancellationToken,
    ) -> Result<Self> {
        if plugin != KUBE_PLUGIN {
            return Err(Error::startup(format!("tried to start an unhandled plugin: {plugin}")));
        }
        info!("Starting {plugin} plugin");
        Ok(Self {
            kube,
            role: role.to_string(),
            sender,
            cancel,
            running: HashMap::new(),
        })
    }

    /// Run one Data action; the returned bytes go back in the DataAck.
    pub async fn handle(&mut self, action: &str, payload: &[u8]) -> Result<Vec<u8>> {
        let path = ActionPath::parse(action)?;
        self.running.retain(|_, running| !running.state().is_closed());

        match (path.kind, path.verb) {
            (ActionKind::RestApi, _) => rest::execute(&self.kube, &self.role, payload).await,
            (ActionKind::Exec, "start") => {
                let req: ExecStartRequest = serde_json::from_slice(payload)?;
                let id = req.request_id.clone();
                let exec = ExecAction::start(
                    &self.kube,
                    &self.role,
                    req,
                    self.sender.clone(),
                    &self.cancel,
                )
                .await?;
                self.running.insert(id, Running::Exec(exec));
                Ok(Vec::new())
            }
            (ActionKind::Exec, "input") => {
                let req: ExecInputRequest = serde_json::from_slice(payload)?;
                if let Some(exec) = self.live_exec(&req.request_id, action) {
                    if let Err(e) = exec.write_stdin(req.stdin).await {
                        debug!(request_id = %req.request_id, "Dropping {action}: {e}");
                    }
                }
                Ok(Vec::new())
            }
            (ActionKind::Exec, "resize") => {
                let req: ExecResizeRequest = serde_json::from_slice(payload)?;
                let size = TerminalSize {
                    width: req.width,
                    height: req.height,
                };
                if let Some(exec) = self.live_exec(&req.request_id, action) {
                    if let Err(e) = exec.resize(size).await {
                        debug!(request_id = %req.request_id, "Dropping {action}: {e}");
                    }
                }
                Ok(Vec::new())
            }
            (_, "stop") => {
                let req: StopRequest = serde_json::from_slice(payload)?;
                match self.running.remove(&req.request_id) {
                    Some(running) => {
                        info!(request_id = %req.request_id, "Stopping {} action", path.kind);
                        running.stop();
                    }
                    None => debug!(request_id = %req.request_id, "Dropping {action}: request has ended"),
                }
                Ok(Vec::new())
            }
            (kind, _) => {
                let req: KubeRequest = serde_json::from_slice(payload)?;
                let id = req.request_id.clone();
                let stream = StreamAction::start(
                    &self.kube,
                    &self.role,
                    kind,
                    req,
                    self.sender.clone(),
                    &self.cancel,
                )
                .await?;
                self.running.insert(id, Running::Stream(stream));
                Ok(Vec::new())
            }
        }
    }

    /// The exec behind `request_id` while it still takes input.
    fn live_exec(&self, request_id: &str, action: &str) -> Option<&ExecAction> {
        match self.running.get(request_id) {
            Some(Running::Exec(exec)) if exec.state().accepts_input() => Some(exec),
            _ => {
                debug!(request_id, "Dropping {action}: request has ended");
                None
            }
        }
    }

    /// Stop everything this plugin started.
    pub fn shutdown(&mut self) {
        for (_, running) in self.running.drain() {
            running.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Transport;

    fn plugin() -> (KubePlugin, Transport) {
        let (near, far) = Transport::pair(8);
        let kube = Arc::new(KubeClient::new("http://127.0.0.1:9", "t", "ns", None).unwrap());
        let plugin =
            KubePlugin::start("kube", kube, "dev", near.sender(), CancellationToken::new()).unwrap();
        (plugin, far)
    }

    #[test]
    fn test_only_kube_plugin_starts() {
        let (near, _far) = Transport::pair(1);
        let kube = Arc::new(KubeClient::new("http://127.0.0.1:9", "t", "ns", None).unwrap());
        let err = KubePlugin::start("ssh", kube, "dev", near.sender(), CancellationToken::new());
        assert!(matches!(err, Err(Error::Startup(_))));
    }

    #[tokio::test]
    async fn test_stop_and_input_for_unknown_request_are_dropped() {
        let (mut plugin, _far) = plugin();
        let stop = serde_json::to_vec(&StopRequest {
            request_id: "nope".into(),
            log_id: String::new(),
        })
        .unwrap();
        assert!(plugin.handle("kube/log/stop", &stop).await.unwrap().is_empty());

        let input = serde_json::to_vec(&ExecInputRequest {
            request_id: "nope".into(),
            log_id: String::new(),
            stdin: b"ls\n".to_vec(),
        })
        .unwrap();
        assert!(plugin.handle("kube/exec/input", &input).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_finished_exec_is_reaped_and_input_dropped() {
        let (mut plugin, _far) = plugin();
        plugin
            .running
            .insert("done".into(), Running::Exec(ExecAction::finished()));

        let resize = serde_json::to_vec(&ExecResizeRequest {
            request_id: "done".into(),
            log_id: String::new(),
            width: 80,
            height: 24,
        })
        .unwrap();
        assert!(plugin.handle("kube/exec/resize", &resize).await.is_ok());
        assert!(plugin.running.is_empty());

        let stop = serde_json::to_vec(&StopRequest {
            request_id: "done".into(),
            log_id: String::new(),
        })
        .unwrap();
        assert!(plugin.handle("kube/exec/stop", &stop).await.is_ok());
    }

    #[tokio::test]
    async fn test_malformed_action_rejected() {
        let (mut plugin, _far) = plugin();
        assert!(plugin.handle("kube/nothing", b"{}").await.is_err());
    }

    #[tokio::test]
    async fn test_stream_writer_numbers_in_order() {
        let (near, mut far) = Transport::pair(8);
        let mut writer = StreamWriter::new(near.sender(), StreamType::ExecStdout, "r", "l");
        writer.send(b"a").await.unwrap();
        writer.send_as(StreamType::ExecExit, b"").await.unwrap();

        let first: StreamMessage = far.recv().await.unwrap().payload().unwrap();
        let second: StreamMessage = far.recv().await.unwrap().payload().unwrap();
        assert_eq!((first.sequence_number, first.stream_type()), (0, Some(StreamType::ExecStdout)));
        assert_eq!((second.sequence_number, second.stream_type()), (1, Some(StreamType::ExecExit)));
    }

    #[test]
    fn test_header_map_groups_values() {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.append("set-cookie", "a".parse().unwrap());
        headers.append("set-cookie", "b".parse().unwrap());
        headers.insert("content-type", "application/json".parse().unwrap());
        let map = header_map(&headers);
        assert_eq!(map["set-cookie"], vec!["a", "b"]);
        assert_eq!(map["content-type"], vec!["application/json"]);
    }
}
