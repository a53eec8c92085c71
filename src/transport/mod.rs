//! Frame transport: an ordered, bidirectional pipe of [`AgentMessage`]s.
//!
//! ```text
//! transport/
//!   mod.rs        Transport handle (send / recv / close / done)
//!   signalr.rs    SignalR JSON hub framing (0x1E separated records)
//!   websocket.rs  negotiate + upgrade against the relay, reconnect loop
//!   challenge.rs  agent challenge solved before every connect
//!   target.rs     hub target chosen per outgoing envelope
//! ```
//!
//! A [`Transport`] is the owner's view of a pipe. The websocket task (or, in
//! tests, an in-memory peer) sits on the other side of two bounded channels.
//! When the pipe ends for good the inbound channel closes and [`Transport::recv`]
//! reports the reason recorded in the done signal.

pub mod challenge;
pub mod signalr;
pub mod target;
pub mod websocket;

use std::sync::Arc;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::message::AgentMessage;

pub use websocket::{HubOptions, Websocket};

/// Opens a fresh transport for a request `P`. Channels take one of these so
/// tests can hand out in-memory pairs instead of relay connections.
pub type ChannelOpener<P> =
    Arc<dyn Fn(P, CancellationToken) -> BoxFuture<'static, Result<Transport>> + Send + Sync>;

/// Why a transport stopped for good.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DoneReason {
    /// The relay closed the connection, optionally saying why.
    Closed(Option<String>),
    /// The owner closed it.
    Cancelled,
    /// The connection dropped and reconnecting is disabled.
    Failed(String),
}

impl DoneReason {
    /// Operator-facing reason, if any.
    pub fn message(&self) -> Option<String> {
        match self {
            Self::Closed(reason) => reason.clone(),
            Self::Cancelled => None,
            Self::Failed(e) => Some(e.clone()),
        }
    }
}

/// Cloneable send half, shared by the tasks of one session.
#[derive(Clone)]
pub struct TransportSender {
    outbound: mpsc::Sender<AgentMessage>,
    cancel: CancellationToken,
}

impl TransportSender {
    /// Queue a frame; waits while the outbound queue is full.
    pub async fn send(&self, msg: AgentMessage) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Closed(None));
        }
        self.outbound
            .send(msg)
            .await
            .map_err(|_| Error::Closed(None))
    }
}

pub struct Transport {
    sender: TransportSender,
    inbound: mpsc::Receiver<AgentMessage>,
    done: watch::Receiver<Option<DoneReason>>,
}

impl Transport {
    pub(crate) fn new(
        outbound: mpsc::Sender<AgentMessage>,
        inbound: mpsc::Receiver<AgentMessage>,
        done: watch::Receiver<Option<DoneReason>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            sender: TransportSender { outbound, cancel },
            inbound,
            done,
        }
    }

    pub fn sender(&self) -> TransportSender {
        self.sender.clone()
    }

    pub async fn send(&self, msg: AgentMessage) -> Result<()> {
        self.sender.send(msg).await
    }

    /// Next inbound frame, or `Error::Closed` once the pipe has ended.
    pub async fn recv(&mut self) -> Result<AgentMessage> {
        match self.inbound.recv().await {
            Some(msg) => Ok(msg),
            None => Err(Error::Closed(self.done_reason().and_then(|r| r.message()))),
        }
    }

    pub fn close(&self) {
        self.sender.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.sender.cancel.is_cancelled()
    }

    pub fn done_reason(&self) -> Option<DoneReason> {
        self.done.borrow().clone()
    }

    /// Resolves when the pipe has ended, with the reason.
    pub fn done(&self) -> watch::Receiver<Option<DoneReason>> {
        self.done.clone()
    }

    /// Two transports wired back to back, for exercising channels without a
    /// relay. Dropping one side closes the other's inbound stream.
    pub fn pair(capacity: usize) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(capacity);
        let (b_tx, a_rx) = mpsc::channel(capacity);
        let (_, done_a) = watch::channel(None);
        let (_, done_b) = watch::channel(None);
        (
            Self::new(a_tx, a_rx, done_a, CancellationToken::new()),
            Self::new(b_tx, b_rx, done_b, CancellationToken::new()),
        )
    }
}

/// `relay.example.com` or `https://relay.example.com/` -> `relay.example.com`.
pub(crate) fn service_host(service_url: &str) -> &str {
    let trimmed = service_url
        .split_once("://")
        .map_or(service_url, |(_, rest)| rest);
    trimmed.trim_end_matches('/')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;

    #[tokio::test]
    async fn test_pair_delivers_in_order_and_reports_close() {
        let (a, mut b) = Transport::pair(8);
        for i in 0..3u8 {
            a.send(AgentMessage::new(MessageType::HealthCheck, &i).unwrap())
                .await
                .unwrap();
        }
        for i in 0..3u8 {
            let msg = b.recv().await.unwrap();
            assert_eq!(msg.payload::<u8>().unwrap(), i);
        }
        drop(a);
        assert!(matches!(b.recv().await, Err(Error::Closed(None))));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (a, _b) = Transport::pair(1);
        a.close();
        assert!(a.is_closed());
        assert!(a
            .send(AgentMessage::new(MessageType::HealthCheck, &0).unwrap())
            .await
            .is_err());
    }

    #[test]
    fn test_service_host() {
        assert_eq!(service_host("relay.example.com"), "relay.example.com");
        assert_eq!(service_host("https://relay.example.com/"), "relay.example.com");
    }
}
