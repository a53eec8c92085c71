//! One agent data channel: the keysplitting server for a single daemon
//! session.
//!
//! Messages are handled strictly in arrival order since each Data must chain
//! onto the DataAck sent before it. Any validation or action failure is
//! reported to the daemon as an error envelope and ends the channel.

use std::ops::ControlFlow;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::actions::KubePlugin;
use super::kube::KubeClient;
use crate::action::plugin_name;
use crate::error::{Error, Result};
use crate::keysplitting::{payload_hash, AgentKeysplitting};
use crate::message::{
    AgentMessage, ErrorMessage, KeysplittingMessage, KeysplittingPayload, MessageType,
};
use crate::transport::Transport;

pub struct DataChannel {
    transport: Transport,
    keysplitting: AgentKeysplitting,
    kube: Arc<KubeClient>,
    role: String,
    plugin: Option<KubePlugin>,
    cancel: CancellationToken,
}

impl DataChannel {
    pub fn new(
        transport: Transport,
        keysplitting: AgentKeysplitting,
        kube: Arc<KubeClient>,
        role: &str,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            keysplitting,
            kube,
            role: role.to_string(),
            plugin: None,
            cancel,
        }
    }

    /// Serve until the daemon goes away, an error ends the channel, or
    /// `cancel` fires.
    pub async fn run(mut self) {
        loop {
            let msg = tokio::select! {
                () = self.cancel.cancelled() => {
                    debug!("DataChannel: cancelled");
                    break;
                }
                msg = self.transport.recv() => msg,
            };
            match msg {
                Ok(msg) => {
                    if self.receive(msg).await.is_break() {
                        break;
                    }
                }
                Err(e) => {
                    info!("DataChannel: transport ended: {e}");
                    break;
                }
            }
        }

        if let Some(plugin) = &mut self.plugin {
            plugin.shutdown();
        }
        self.cancel.cancel();
        self.transport.close();
        info!("DataChannel: closed");
    }

    async fn receive(&mut self, msg: AgentMessage) -> ControlFlow<()> {
        match msg.message_type {
            MessageType::Keysplitting => {}
            other => {
                warn!("DataChannel: dropping unexpected {} message", other.as_str());
                return ControlFlow::Continue(());
            }
        }

        let ks: KeysplittingMessage = match msg.payload() {
            Ok(ks) => ks,
            Err(e) => {
                let err = Error::validation(format!("malformed keysplitting message: {e}"));
                return self.fail(&err, String::new()).await;
            }
        };

        match self.handle_keysplitting(&ks).await {
            Ok(response) => match self.send_keysplitting(&response).await {
                Ok(()) => ControlFlow::Continue(()),
                Err(e) => {
                    warn!("DataChannel: could not send {}: {e}", response.kind());
                    ControlFlow::Break(())
                }
            },
            Err(e) => {
                let h_pointer = payload_hash(&ks.payload).unwrap_or_default();
                self.fail(&e, h_pointer).await
            }
        }
    }

    async fn handle_keysplitting(&mut self, ks: &KeysplittingMessage) -> Result<KeysplittingMessage> {
        self.keysplitting.validate(ks)?;

        match &ks.payload {
            KeysplittingPayload::Syn(syn) => {
                let plugin = plugin_name(&syn.action)?;
                self.plugin = Some(KubePlugin::start(
                    plugin,
                    self.kube.clone(),
                    &self.role,
                    self.transport.sender(),
                    self.cancel.child_token(),
                )?);
                self.keysplitting.build_response(ks, "", Vec::new())
            }
            KeysplittingPayload::Data(data) => {
                let plugin = self
                    .plugin
                    .as_mut()
                    .ok_or_else(|| Error::validation("Data received before any plugin started"))?;
                let response = plugin.handle(&data.action, &data.action_payload).await?;
                self.keysplitting.build_response(ks, &data.action, response)
            }
            other => Err(Error::validation(format!(
                "agent does not accept {} messages",
                other.kind()
            ))),
        }
    }

    async fn send_keysplitting(&self, msg: &KeysplittingMessage) -> Result<()> {
        self.transport
            .send(AgentMessage::new(MessageType::Keysplitting, msg)?)
            .await
    }

    /// Report `err` to the daemon and end the channel.
    async fn fail(&self, err: &Error, h_pointer: String) -> ControlFlow<()> {
        error!("DataChannel: {err}");
        let report = ErrorMessage::from_error(err, h_pointer);
        match AgentMessage::new(MessageType::Error, &report) {
            Ok(msg) => {
                if let Err(e) = self.transport.send(msg).await {
                    debug!("DataChannel: could not report error: {e}");
                }
            }
            Err(e) => debug!("DataChannel: could not encode error: {e}"),
        }
        ControlFlow::Break(())
    }
}
