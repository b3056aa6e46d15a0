//! Process-local index of currently connected sessions, keyed by user.
//!
//! Conceptually `user_id -> set<SessionHandle>` with a reverse index for
//! O(1) removal. Tolerates multiple concurrent sessions for the same
//! user. All mutations are guarded by a single `RwLock` — this is an
//! index, not domain state, so lock contention is not a concern.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tracing::warn;

use crate::protocol::OutboundMessage;

/// Recommended bounded-queue depth per §5 — bounded latency/memory over
/// strict delivery under backpressure.
pub const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// An outbound message channel for one live connection. `send` is
/// non-blocking (`try_send`); a full queue is the caller's cue to close
/// and detach the session (see `Broadcaster`).
#[derive(Clone)]
pub struct SessionHandle {
    pub session_id: String,
    pub user_id: String,
    sender: mpsc::Sender<OutboundMessage>,
}

impl SessionHandle {
    pub fn try_send(&self, msg: OutboundMessage) -> Result<(), TrySendError> {
        self.sender.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => TrySendError::Full,
            mpsc::error::TrySendError::Closed(_) => TrySendError::Closed,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrySendError {
    Full,
    Closed,
}

/// Construct a fresh handle plus the receiver end a connection's writer
/// task should drain.
pub fn new_handle(user_id: &str) -> (SessionHandle, mpsc::Receiver<OutboundMessage>) {
    let session_id = uuid::Uuid::new_v4().to_string();
    let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
    (
        SessionHandle {
            session_id,
            user_id: user_id.to_string(),
            sender: tx,
        },
        rx,
    )
}

#[derive(Default)]
struct Inner {
    by_user: HashMap<String, HashSet<String>>,
    handles: HashMap<String, SessionHandle>,
}

#[derive(Default)]
pub struct SessionRegistry {
    inner: RwLock<Inner>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn attach(&self, handle: SessionHandle) {
        let mut inner = self.inner.write().await;
        inner
            .by_user
            .entry(handle.user_id.clone())
            .or_default()
            .insert(handle.session_id.clone());
        inner.handles.insert(handle.session_id.clone(), handle);
    }

    pub async fn detach(&self, session_id: &str) {
        let mut inner = self.inner.write().await;
        if let Some(handle) = inner.handles.remove(session_id) {
            if let Some(sessions) = inner.by_user.get_mut(&handle.user_id) {
                sessions.remove(session_id);
                if sessions.is_empty() {
                    inner.by_user.remove(&handle.user_id);
                }
            }
        }
    }

    /// The query the Broadcaster uses: every live session belonging to
    /// any of `user_ids`.
    pub async fn sessions_for(&self, user_ids: &HashSet<String>) -> Vec<SessionHandle> {
        let inner = self.inner.read().await;
        let mut result = Vec::new();
        for user_id in user_ids {
            if let Some(session_ids) = inner.by_user.get(user_id) {
                for session_id in session_ids {
                    if let Some(handle) = inner.handles.get(session_id) {
                        result.push(handle.clone());
                    }
                }
            }
        }
        result
    }

    pub async fn active_count(&self) -> usize {
        self.inner.read().await.handles.len()
    }
}

/// Send `msg` on `handle`, warning and detaching from `registry` on a
/// closed/full channel rather than propagating the error — matches
/// the Broadcaster's "never block on a slow peer" contract.
pub async fn deliver_or_detach(registry: &SessionRegistry, handle: &SessionHandle, msg: OutboundMessage) {
    match handle.try_send(msg) {
        Ok(()) => {}
        Err(TrySendError::Closed) => {
            registry.detach(&handle.session_id).await;
        }
        Err(TrySendError::Full) => {
            warn!(session_id = %handle.session_id, "outbound queue full — disconnecting slow session");
            let _ = handle.try_send(OutboundMessage::Error {
                message: "backpressure, disconnecting".to_string(),
            });
            registry.detach(&handle.session_id).await;
        }
    }
}
