//! Live sessions by request id.
//!
//! Every local request registers here for as long as its session runs so
//! shutdown can cancel all of them. The lock is never held across an await.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::action::ActionKind;

pub struct SessionHandle {
    pub kind: ActionKind,
    pub cancel: CancellationToken,
}

/// Cloneable; all clones share one map.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, SessionHandle>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a session until the returned guard drops.
    pub fn register(
        &self,
        request_id: &str,
        kind: ActionKind,
        cancel: CancellationToken,
    ) -> Registration {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(request_id.to_string(), SessionHandle { kind, cancel });
        debug!(request_id, action = %kind, "Registry: session added");
        Registration {
            registry: self.clone(),
            request_id: request_id.to_string(),
        }
    }

    pub fn count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Cancel every live session. Entries go away as their guards drop.
    pub fn cancel_all(&self) {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        for (request_id, handle) in sessions.iter() {
            debug!(request_id, action = %handle.kind, "Registry: cancelling session");
            handle.cancel.cancel();
        }
    }

    fn remove(&self, request_id: &str) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(request_id);
        debug!(request_id, "Registry: session removed");
    }
}

/// Removes its session from the registry on drop.
pub struct Registration {
    registry: SessionRegistry,
    request_id: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(&self.request_id);
    }
}
