//! Daemon side of one data channel.
//!
//! A driver task owns the transport and the keysplitting engine. The action
//! hands it Data requests through [`Requests`]; the driver sends them one at
//! a time, each chained onto the previous acknowledgement, and reports back
//! through [`SessionEvent`]s. The channel ends on the first error envelope,
//! validation failure, relay close or cancellation, and always reports
//! [`SessionEvent::Terminated`] last.

use std::collections::VecDeque;
use std::ops::ControlFlow;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::{Error, Result};
use crate::keysplitting::{payload_hash, DaemonKeysplitting};
use crate::message::{
    AgentMessage, ErrorMessage, KeysplittingMessage, KeysplittingPayload, MessageType,
    StreamMessage,
};
use crate::transport::Transport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The agent acknowledged a Data; `payload` is its action response.
    Ack { action: String, payload: Vec<u8> },
    Stream(StreamMessage),
    /// Nothing follows. Carries the operator-facing reason, if any.
    Terminated(Option<String>),
}

/// Queues Data requests on a session. Cloneable for pump tasks.
#[derive(Clone)]
pub struct Requests {
    tx: mpsc::Sender<(String, Vec<u8>)>,
}

impl Requests {
    pub async fn send(&self, action: &str, payload: Vec<u8>) -> Result<()> {
        self.tx
            .send((action.to_string(), payload))
            .await
            .map_err(|_| Error::Closed(None))
    }
}

pub struct DataChannel {
    requests: Requests,
    events: mpsc::Receiver<SessionEvent>,
    cancel: CancellationToken,
}

impl DataChannel {
    /// Send the Syn for `start_action` and start driving the channel.
    pub fn start(
        transport: Transport,
        keysplitting: DaemonKeysplitting,
        request_id: &str,
        start_action: &str,
        capacity: usize,
        cancel: CancellationToken,
    ) -> Self {
        let (req_tx, req_rx) = mpsc::channel(capacity);
        let (event_tx, event_rx) = mpsc::channel(capacity);

        let driver = Driver {
            transport,
            keysplitting,
            request_id: request_id.to_string(),
            last_ack: None,
            queue: VecDeque::new(),
            in_flight: false,
            events: event_tx,
        };
        let span = info_span!("session", request_id = %request_id, action = %start_action);
        tokio::spawn(
            driver
                .run(start_action.to_string(), req_rx, cancel.clone())
                .instrument(span),
        );

        Self {
            requests: Requests { tx: req_tx },
            events: event_rx,
            cancel,
        }
    }

    pub fn requests(&self) -> Requests {
        self.requests.clone()
    }

    pub async fn request(&self, action: &str, payload: Vec<u8>) -> Result<()> {
        self.requests.send(action, payload).await
    }

    /// Next event; `Terminated(None)` forever once the driver is gone.
    pub async fn next_event(&mut self) -> SessionEvent {
        self.events
            .recv()
            .await
            .unwrap_or(SessionEvent::Terminated(None))
    }

    /// Wait for the acknowledgement of `action`, skipping stream traffic.
    /// `Err` carries the termination reason if the session ended first.
    pub async fn wait_ack(&mut self, action: &str) -> std::result::Result<Vec<u8>, Option<String>> {
        loop {
            match self.next_event().await {
                SessionEvent::Ack { action: acked, payload } if acked == action => {
                    return Ok(payload)
                }
                SessionEvent::Terminated(reason) => return Err(reason),
                other => debug!("Session: skipping {other:?} while waiting for {action}"),
            }
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for DataChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Driver {
    transport: Transport,
    keysplitting: DaemonKeysplitting,
    request_id: String,
    /// Last SynAck or DataAck; the next Data chains onto it.
    last_ack: Option<KeysplittingMessage>,
    queue: VecDeque<(String, Vec<u8>)>,
    in_flight: bool,
    events: mpsc::Sender<SessionEvent>,
}

impl Driver {
    async fn run(
        mut self,
        start_action: String,
        mut requests: mpsc::Receiver<(String, Vec<u8>)>,
        cancel: CancellationToken,
    ) {
        let reason = self.drive(&start_action, &mut requests, &cancel).await;
        match &reason {
            Some(reason) => info!("Session: terminated: {reason}"),
            None => info!("Session: closed"),
        }
        let _ = self.events.send(SessionEvent::Terminated(reason)).await;
        self.transport.close();
    }

    async fn drive(
        &mut self,
        start_action: &str,
        requests: &mut mpsc::Receiver<(String, Vec<u8>)>,
        cancel: &CancellationToken,
    ) -> Option<String> {
        let sent = match self.keysplitting.build_syn(start_action, Vec::new()) {
            Ok(syn) => self.send_keysplitting(&syn).await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            warn!("Session: could not send Syn: {e}");
            return Some(e.to_string());
        }

        loop {
            tokio::select! {
                () = cancel.cancelled() => return None,
                Some(request) = requests.recv() => {
                    self.queue.push_back(request);
                    if let Err(e) = self.flush().await {
                        return Some(e.to_string());
                    }
                }
                msg = self.transport.recv() => match msg {
                    Ok(msg) => {
                        if let ControlFlow::Break(reason) = self.receive(msg).await {
                            return reason;
                        }
                    }
                    Err(Error::Closed(reason)) => return reason,
                    Err(e) => return Some(e.to_string()),
                },
            }
        }
    }

    async fn receive(&mut self, msg: AgentMessage) -> ControlFlow<Option<String>> {
        match msg.message_type {
            MessageType::Keysplitting => {
                let ks: KeysplittingMessage = match msg.payload() {
                    Ok(ks) => ks,
                    Err(e) => {
                        let err = Error::validation(format!("malformed keysplitting message: {e}"));
                        return self.fail(&err, String::new()).await;
                    }
                };
                if let Err(e) = self.keysplitting.validate(&ks) {
                    let h_pointer = payload_hash(&ks.payload).unwrap_or_default();
                    return self.fail(&e, h_pointer).await;
                }
                if let KeysplittingPayload::DataAck(ack) = &ks.payload {
                    let event = SessionEvent::Ack {
                        action: ack.action.clone(),
                        payload: ack.action_response_payload.clone(),
                    };
                    if self.events.send(event).await.is_err() {
                        return ControlFlow::Break(None);
                    }
                }
                debug!("Session: received {}", ks.kind());
                self.last_ack = Some(ks);
                self.in_flight = false;
                match self.flush().await {
                    Ok(()) => ControlFlow::Continue(()),
                    Err(e) => ControlFlow::Break(Some(e.to_string())),
                }
            }
            MessageType::Stream => {
                let stream: StreamMessage = match msg.payload() {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("Session: dropping malformed stream message: {e}");
                        return ControlFlow::Continue(());
                    }
                };
                if stream.request_id != self.request_id {
                    warn!(
                        "Session: dropping stream message for unknown request {}",
                        stream.request_id
                    );
                    return ControlFlow::Continue(());
                }
                if self.events.send(SessionEvent::Stream(stream)).await.is_err() {
                    return ControlFlow::Break(None);
                }
                ControlFlow::Continue(())
            }
            MessageType::Error => {
                let reason = match msg.payload::<ErrorMessage>() {
                    Ok(report) => {
                        warn!("Session: agent reported {}: {}", report.kind, report.message);
                        report.message
                    }
                    Err(e) => format!("unreadable error message: {e}"),
                };
                ControlFlow::Break(Some(reason))
            }
            other => {
                warn!("Session: dropping unexpected {} message", other.as_str());
                ControlFlow::Continue(())
            }
        }
    }

    /// Send the next queued Data if nothing is awaiting an ack.
    async fn flush(&mut self) -> Result<()> {
        if self.in_flight {
            return Ok(());
        }
        let Some(previous) = &self.last_ack else {
            return Ok(());
        };
        let Some((action, payload)) = self.queue.pop_front() else {
            return Ok(());
        };
        let data = self.keysplitting.build_response(previous, &action, payload)?;
        self.send_keysplitting(&data).await?;
        self.in_flight = true;
        debug!(action = %action, "Session: sent Data");
        Ok(())
    }

    async fn send_keysplitting(&self, msg: &KeysplittingMessage) -> Result<()> {
        self.transport
            .send(AgentMessage::new(MessageType::Keysplitting, msg)?)
            .await
    }

    async fn fail(&self, err: &Error, h_pointer: String) -> ControlFlow<Option<String>> {
        warn!("Session: {err}");
        let report = ErrorMessage::from_error(err, h_pointer);
        match AgentMessage::new(MessageType::Error, &report) {
            Ok(msg) => {
                if let Err(e) = self.transport.send(msg).await {
                    debug!("Session: could not report error: {e}");
                }
            }
            Err(e) => debug!("Session: could not encode error: {e}"),
        }
        ControlFlow::Break(Some(err.to_string()))
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::keysplitting::bzcert::testing::{policy, verifier};
    use crate::keysplitting::{AgentKeysplitting, KeyPair};
    use crate::message::StreamType;
    use std::sync::Arc;
    use std::time::Duration;

    fn start(action: &str) -> (DataChannel, FakeAgent) {
        let (near, far) = Transport::pair(16);
        let channel = DataChannel::start(
            near,
            DaemonKeysplitting::new("cluster-1", identity()),
            "req-1",
            action,
            16,
            CancellationToken::new(),
        );
        (channel, FakeAgent::new(far))
    }

    async fn event(channel: &mut DataChannel) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(2), channel.next_event())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_data_waits_for_syn_ack_and_chains() {
        let (mut channel, mut agent) = start("kube/log/start");
        // queued before the SynAck exists
        channel.request("kube/log/start", b"one".to_vec()).await.unwrap();
        channel.request("kube/log/stop", b"two".to_vec()).await.unwrap();

        assert_eq!(agent.accept_syn().await, "kube/log/start");

        let first = agent.recv().await;
        assert_eq!(first.payload.action_bytes(), b"one");
        agent.reply(&first, b"ack-one".to_vec()).await;
        assert_eq!(
            event(&mut channel).await,
            SessionEvent::Ack {
                action: "kube/log/start".into(),
                payload: b"ack-one".to_vec()
            }
        );

        // the second Data only goes out after the first ack
        let second = agent.recv().await;
        assert_eq!(second.payload.action(), "kube/log/stop");
        agent.reply(&second, Vec::new()).await;
        assert_eq!(channel.wait_ack("kube/log/stop").await, Ok(Vec::new()));
    }

    #[tokio::test]
    async fn test_streams_for_other_requests_are_dropped() {
        let (mut channel, mut agent) = start("kube/watch/start");
        agent.accept_syn().await;

        let stray = StreamMessage::new(StreamType::WatchStdout, "someone-else", "", 0, b"x");
        agent.stream(&stray).await;
        let ours = StreamMessage::new(StreamType::WatchStdout, "req-1", "", 0, b"y");
        agent.stream(&ours).await;

        assert_eq!(event(&mut channel).await, SessionEvent::Stream(ours));
    }

    #[tokio::test]
    async fn test_error_envelope_terminates_with_reason() {
        let (mut channel, mut agent) = start("kube/restapi");
        agent.accept_syn().await;

        let report = ErrorMessage::from_error(&Error::execution("cluster unreachable"), "");
        agent
            .transport
            .send(AgentMessage::new(MessageType::Error, &report).unwrap())
            .await
            .unwrap();
        match event(&mut channel).await {
            SessionEvent::Terminated(Some(reason)) => assert!(reason.contains("cluster unreachable")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_forged_ack_is_reported_and_terminates() {
        let (mut channel, mut agent) = start("kube/restapi");
        agent.accept_syn().await;
        channel.request("kube/restapi", Vec::new()).await.unwrap();
        let data = agent.recv().await;

        // a DataAck answering the real Data, signed by a key the SynAck did not carry
        let mut impostor = AgentKeysplitting::new(
            Arc::new(KeyPair::generate()),
            Arc::new(verifier()),
            Arc::new(policy()),
        );
        let forged = impostor.build_response(&data, "kube/restapi", Vec::new()).unwrap();
        agent
            .transport
            .send(AgentMessage::new(MessageType::Keysplitting, &forged).unwrap())
            .await
            .unwrap();

        let report = agent.transport.recv().await.unwrap();
        assert_eq!(report.message_type, MessageType::Error);
        assert!(matches!(event(&mut channel).await, SessionEvent::Terminated(Some(_))));
    }

    #[tokio::test]
    async fn test_relay_close_terminates() {
        let (mut channel, mut agent) = start("kube/restapi");
        agent.accept_syn().await;
        drop(agent);
        assert_eq!(event(&mut channel).await, SessionEvent::Terminated(None));
    }
}
