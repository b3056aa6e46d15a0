//! Targeted fan-out: resolves a page's audience and delivers a frame
//! only to the sessions of currently-connected, authorized users.
//!
//! Grounded on the teacher's `EventBroadcaster`
//! (`tokio::sync::broadcast` to every subscriber), generalized here
//! into a per-session `mpsc` send so that under-delivery of a
//! security-relevant targeted event is never silently tolerated the
//! way the teacher tolerates a lagged global broadcast receiver.

use std::sync::Arc;

use crate::error::AlarmError;
use crate::protocol::OutboundMessage;
use crate::session::{deliver_or_detach, SessionRegistry};
use crate::storage::Store;

pub struct Broadcaster {
    store: Arc<Store>,
    registry: Arc<SessionRegistry>,
}

impl Broadcaster {
    pub fn new(store: Arc<Store>, registry: Arc<SessionRegistry>) -> Self {
        Self { store, registry }
    }

    /// Resolve `page_id`'s audience and enqueue `msg` on every matching
    /// live session. Non-blocking — a full or closed session is
    /// detached rather than waited on.
    pub async fn broadcast_to_page(&self, page_id: &str, msg: OutboundMessage) -> Result<(), AlarmError> {
        let audience = self.store.users_with_view_access(page_id).await?;
        let sessions = self.registry.sessions_for(&audience).await;
        for handle in &sessions {
            deliver_or_detach(&self.registry, handle, msg.clone()).await;
        }
        Ok(())
    }

    /// Deliver `msg` to every live session for `user_ids` directly,
    /// without an access check — used for `page_access_granted`/
    /// `page_access_revoked`, where the audience diff has already been
    /// computed by the caller.
    pub async fn deliver_to_users(
        &self,
        user_ids: &std::collections::HashSet<String>,
        msg: OutboundMessage,
    ) {
        let sessions = self.registry.sessions_for(user_ids).await;
        for handle in &sessions {
            deliver_or_detach(&self.registry, handle, msg.clone()).await;
        }
    }

    /// Deliver `msg` only to the single originating session — used for
    /// `success`/`error` frames that have no broader audience.
    pub async fn deliver_to_session(&self, handle: &crate::session::SessionHandle, msg: OutboundMessage) {
        deliver_or_detach(&self.registry, handle, msg).await;
    }
}
