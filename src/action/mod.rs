//! Actions carried inside keysplitting Data messages.
//!
//! ```text
//! action/
//!   mod.rs            action paths, ActionKind, ActionState
//!   payloads.rs       request / response bodies for every action path
//!   ordering.rs       sequence-number reordering for stream delivery
//!   remotecommand.rs  k8s exec websocket channel framing
//! ```
//!
//! An action path is `<plugin>/<action>[/<verb>]`, e.g. `kube/exec/start`.
//! Only the `kube` plugin exists.

pub mod ordering;
pub mod payloads;
pub mod remotecommand;

use tokio::sync::watch;

use crate::error::{Error, Result};

pub const KUBE_PLUGIN: &str = "kube";

pub const REST_API: &str = "kube/restapi";
pub const EXEC_START: &str = "kube/exec/start";
pub const EXEC_INPUT: &str = "kube/exec/input";
pub const EXEC_RESIZE: &str = "kube/exec/resize";
pub const EXEC_STOP: &str = "kube/exec/stop";
pub const LOG_START: &str = "kube/log/start";
pub const LOG_STOP: &str = "kube/log/stop";
pub const WATCH_START: &str = "kube/watch/start";
pub const WATCH_STOP: &str = "kube/watch/stop";
pub const STREAM_START: &str = "kube/stream/start";
pub const STREAM_STOP: &str = "kube/stream/stop";

/// Class of request a session carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    RestApi,
    Exec,
    Log,
    Watch,
    Stream,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RestApi => "restapi",
            Self::Exec => "exec",
            Self::Log => "log",
            Self::Watch => "watch",
            Self::Stream => "stream",
        }
    }

    /// The action a session of this kind opens with.
    pub fn start_path(self) -> &'static str {
        match self {
            Self::RestApi => REST_API,
            Self::Exec => EXEC_START,
            Self::Log => LOG_START,
            Self::Watch => WATCH_START,
            Self::Stream => STREAM_START,
        }
    }

    /// `None` for REST, which has no stop.
    pub fn stop_path(self) -> Option<&'static str> {
        match self {
            Self::RestApi => None,
            Self::Exec => Some(EXEC_STOP),
            Self::Log => Some(LOG_STOP),
            Self::Watch => Some(WATCH_STOP),
            Self::Stream => Some(STREAM_STOP),
        }
    }

    /// Bytes read from the cluster per stream envelope.
    pub fn read_size(self) -> usize {
        match self {
            Self::Log => 2 * 1024,
            _ => 10 * 1024,
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed action path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionPath<'a> {
    pub plugin: &'a str,
    pub kind: ActionKind,
    /// `start`, `stop`, `input`, `resize`; empty for `kube/restapi`.
    pub verb: &'a str,
}

impl<'a> ActionPath<'a> {
    pub fn parse(path: &'a str) -> Result<Self> {
        let mut parts = path.splitn(3, '/');
        let plugin = parts.next().unwrap_or_default();
        let action = parts.next().unwrap_or_default();
        let verb = parts.next().unwrap_or_default();
        if plugin.is_empty() || action.is_empty() {
            return Err(Error::processing(format!("malformed action: {path}")));
        }

        let kind = match action {
            "restapi" => ActionKind::RestApi,
            "exec" => ActionKind::Exec,
            "log" => ActionKind::Log,
            "watch" => ActionKind::Watch,
            "stream" => ActionKind::Stream,
            other => return Err(Error::processing(format!("unknown action: {other}"))),
        };
        let known_verb = match kind {
            ActionKind::RestApi => verb.is_empty(),
            ActionKind::Exec => matches!(verb, "start" | "input" | "resize" | "stop"),
            _ => matches!(verb, "start" | "stop"),
        };
        if !known_verb {
            return Err(Error::processing(format!("unknown action: {path}")));
        }
        Ok(Self { plugin, kind, verb })
    }
}

/// Plugin named by the first segment of a Syn's action.
pub fn plugin_name(action: &str) -> Result<&str> {
    match action.split_once('/') {
        Some((plugin, rest)) if !plugin.is_empty() && !rest.is_empty() => Ok(plugin),
        _ => Err(Error::validation(format!("malformed action: {action}"))),
    }
}

/// Lifecycle of one action instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ActionState {
    Created,
    Active,
    Closing,
    Closed,
}

impl ActionState {
    /// Move forward to `next`. States never go backwards; `Closed` is
    /// terminal.
    pub fn advance(&mut self, next: ActionState) -> Result<()> {
        if next < *self || *self == Self::Closed {
            return Err(Error::processing(format!(
                "action cannot move from {self:?} to {next:?}"
            )));
        }
        *self = next;
        Ok(())
    }

    pub fn is_closed(self) -> bool {
        self == Self::Closed
    }

    /// Input, resize and stop only reach actions that are not winding down.
    pub fn accepts_input(self) -> bool {
        self < Self::Closing
    }
}

/// Publish a forward move on a shared state. `false` when it was refused.
pub fn advance_state(state: &watch::Sender<ActionState>, next: ActionState) -> bool {
    state.send_if_modified(|current| current.advance(next).is_ok())
}
