//! Hub method ("target") for each outgoing envelope. The relay routes on it.

use crate::error::{Error, Result};
use crate::message::{AgentMessage, KeysplittingMessage, MessageType, StreamMessage, StreamType};

/// Picks the hub target for an outgoing envelope.
pub type TargetSelector = fn(&AgentMessage) -> Result<&'static str>;

pub fn daemon_target(msg: &AgentMessage) -> Result<&'static str> {
    match msg.message_type {
        MessageType::Keysplitting => {
            let ks: KeysplittingMessage = msg.payload()?;
            let action = ks.payload.action();
            match action {
                "kube/restapi" => Ok("RequestDaemonToBastion"),
                "kube/exec/start" => Ok("StartExecDaemonToBastion"),
                "kube/exec/input" => Ok("StdinDaemonToBastion"),
                "kube/exec/resize" => Ok("ResizeTerminalDaemonToBastion"),
                "kube/exec/stop" => Ok("StopHttpStreamDaemonToBastion"),
                "kube/log/start" | "kube/watch/start" | "kube/stream/start" => {
                    Ok("RequestHttpStreamDaemonToBastion")
                }
                "kube/log/stop" | "kube/watch/stop" | "kube/stream/stop" => {
                    Ok("StopHttpStreamDaemonToBastion")
                }
                other => Err(Error::processing(format!(
                    "no hub target for action {other}"
                ))),
            }
        }
        MessageType::Error => Ok("RequestDaemonToBastion"),
        other => Err(Error::processing(format!(
            "daemon does not send {} messages",
            other.as_str()
        ))),
    }
}

pub fn agent_target(msg: &AgentMessage) -> Result<&'static str> {
    match msg.message_type {
        MessageType::Keysplitting | MessageType::Error => Ok("ResponseClusterToBastion"),
        MessageType::HealthCheck => Ok("AliveCheckClusterToBastion"),
        MessageType::Stream => {
            let stream: StreamMessage = msg.payload()?;
            match stream.stream_type() {
                Some(StreamType::ExecStdout | StreamType::ExecExit) => Ok("StdoutClusterToBastion"),
                Some(StreamType::ExecStderr) => Ok("StderrClusterToBastion"),
                Some(
                    StreamType::LogStdout
                    | StreamType::WatchStdout
                    | StreamType::StreamStdout
                    | StreamType::StreamEnd,
                ) => {
                    Ok("ResponseLogClusterToBastion")
                }
                None => Err(Error::processing(format!(
                    "no hub target for stream type {}",
                    stream.kind
                ))),
            }
        }
        other => Err(Error::processing(format!(
            "agent does not send {} messages",
            other.as_str()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::control::AliveCheckMessage;
    use crate::message::keysplitting::DataPayload;
    use crate::message::{ErrorMessage, KeysplittingPayload};

    fn data(action: &str) -> AgentMessage {
        let ks = KeysplittingMessage::unsigned(KeysplittingPayload::Data(DataPayload {
            timestamp: "1".into(),
            schema_version: "1.0".into(),
            kind: "Data".into(),
            action: action.into(),
            action_payload: Vec::new(),
            target_id: "t".into(),
            h_pointer: "h".into(),
            bz_cert_hash: "c".into(),
        }));
        AgentMessage::new(MessageType::Keysplitting, &ks).unwrap()
    }

    fn stream(kind: StreamType) -> AgentMessage {
        AgentMessage::new(
            MessageType::Stream,
            &StreamMessage::new(kind, "r", "l", 0, b""),
        )
        .unwrap()
    }

    #[test]
    fn test_daemon_targets_by_action() {
        let cases = [
            ("kube/restapi", "RequestDaemonToBastion"),
            ("kube/exec/start", "StartExecDaemonToBastion"),
            ("kube/exec/input", "StdinDaemonToBastion"),
            ("kube/exec/resize", "ResizeTerminalDaemonToBastion"),
            ("kube/exec/stop", "StopHttpStreamDaemonToBastion"),
            ("kube/log/start", "RequestHttpStreamDaemonToBastion"),
            ("kube/watch/stop", "StopHttpStreamDaemonToBastion"),
        ];
        for (action, target) in cases {
            assert_eq!(daemon_target(&data(action)).unwrap(), target, "{action}");
        }
        assert!(daemon_target(&data("kube/unknown")).is_err());
    }

    #[test]
    fn test_daemon_errors_go_to_request_target() {
        let err = ErrorMessage::from_error(&Error::validation("x"), "h");
        let msg = AgentMessage::new(MessageType::Error, &err).unwrap();
        assert_eq!(daemon_target(&msg).unwrap(), "RequestDaemonToBastion");
    }

    #[test]
    fn test_agent_targets() {
        assert_eq!(
            agent_target(&data("kube/restapi")).unwrap(),
            "ResponseClusterToBastion"
        );
        assert_eq!(
            agent_target(&stream(StreamType::ExecExit)).unwrap(),
            "StdoutClusterToBastion"
        );
        assert_eq!(
            agent_target(&stream(StreamType::ExecStderr)).unwrap(),
            "StderrClusterToBastion"
        );
        assert_eq!(
            agent_target(&stream(StreamType::WatchStdout)).unwrap(),
            "ResponseLogClusterToBastion"
        );
        let alive = AgentMessage::new(
            MessageType::HealthCheck,
            &AliveCheckMessage {
                alive: true,
                cluster_users: vec![],
            },
        )
        .unwrap();
        assert_eq!(agent_target(&alive).unwrap(), "AliveCheckClusterToBastion");
    }
}
