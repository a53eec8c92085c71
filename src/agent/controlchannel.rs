//! The agent's long-lived control channel.
//!
//! Answers the relay's liveness checks and opens a data channel for every
//! `newDatachannel` it is handed. Data channels run in their own tasks under
//! child tokens of the control channel's, so cancelling the agent closes
//! all of them.

use std::sync::Arc;

use futures_util::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::datachannel::DataChannel;
use super::health::alive_check;
use super::AgentContext;
use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::message::control::NewDatachannelMessage;
use crate::message::{AgentMessage, MessageType};
use crate::transport::target::agent_target;
use crate::transport::{ChannelOpener, HubOptions, Transport, Websocket};

pub const CONTROL_HUB: &str = "/api/v1/hub/kube-control";
pub const DATA_HUB: &str = "/api/v1/hub/kube-server";

pub struct ControlChannel {
    transport: Transport,
    context: Arc<AgentContext>,
    opener: ChannelOpener<NewDatachannelMessage>,
}

impl ControlChannel {
    pub fn new(
        transport: Transport,
        context: Arc<AgentContext>,
        opener: ChannelOpener<NewDatachannelMessage>,
    ) -> Self {
        Self {
            transport,
            context,
            opener,
        }
    }

    /// Serve until `cancel` fires (`Ok`) or the relay ends the channel for
    /// good (`Err`).
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        info!("ControlChannel: serving");
        let outcome = loop {
            let msg = tokio::select! {
                () = cancel.cancelled() => break Ok(()),
                msg = self.transport.recv() => msg,
            };
            match msg {
                Ok(msg) => self.receive(msg, &cancel),
                Err(e) => break Err(Error::startup(format!("control channel ended: {e}"))),
            }
        };
        cancel.cancel();
        self.transport.close();
        info!("ControlChannel: closed");
        outcome
    }

    fn receive(&self, msg: AgentMessage, cancel: &CancellationToken) {
        match msg.message_type {
            MessageType::NewDatachannel => match msg.payload::<NewDatachannelMessage>() {
                Ok(request) => self.open_datachannel(request, cancel.child_token()),
                Err(e) => warn!("ControlChannel: malformed newDatachannel message: {e}"),
            },
            MessageType::HealthCheck => {
                let sender = self.transport.sender();
                let context = self.context.clone();
                tokio::spawn(async move {
                    let alive = alive_check(&context.kube).await;
                    let sent = match AgentMessage::new(MessageType::HealthCheck, &alive) {
                        Ok(reply) => sender.send(reply).await,
                        Err(e) => Err(e),
                    };
                    if let Err(e) = sent {
                        warn!("ControlChannel: could not answer healthcheck: {e}");
                    }
                });
            }
            other => debug!("ControlChannel: ignoring {} message", other.as_str()),
        }
    }

    fn open_datachannel(&self, request: NewDatachannelMessage, cancel: CancellationToken) {
        info!(
            connection_id = %request.connection_id,
            role = %request.role,
            "ControlChannel: opening data channel"
        );
        let span = info_span!("datachannel", connection_id = %request.connection_id);
        let opener = self.opener.clone();
        let context = self.context.clone();
        tokio::spawn(
            async move {
                let role = request.role.clone();
                match opener(request, cancel.clone()).await {
                    Ok(transport) => {
                        DataChannel::new(
                            transport,
                            context.keysplitting(),
                            context.kube.clone(),
                            &role,
                            cancel,
                        )
                        .run()
                        .await;
                    }
                    Err(e) => error!("ControlChannel: could not connect data channel: {e}"),
                }
            }
            .instrument(span),
        );
    }
}

/// Data channels over the relay. They never reconnect; a dropped data
/// channel ends its session.
pub fn relay_opener(
    service_url: String,
    transport_config: TransportConfig,
) -> ChannelOpener<NewDatachannelMessage> {
    Arc::new(move |request: NewDatachannelMessage, cancel: CancellationToken| {
        let options = HubOptions {
            service_url: service_url.clone(),
            hub_endpoint: DATA_HUB.to_string(),
            params: vec![
                ("daemon_connection_id".to_string(), request.connection_id),
                ("token".to_string(), request.token),
            ],
            headers: Vec::new(),
            auto_reconnect: false,
            challenge: None,
        };
        let config = transport_config.clone();
        async move {
            Websocket::new(options, agent_target, config)?
                .connect(cancel)
                .await
        }
        .boxed()
    })
}
