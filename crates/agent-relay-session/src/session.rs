//! One authenticated agent connection.

use std::{
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::Duration,
};

use agent_relay_core::{
    AgentMetadata, CloseReason, Envelope, SessionSnapshot, SessionState, now_unix,
    payload::AuthPayload,
};
use tokio::sync::{
    mpsc::{self, error::SendTimeoutError, error::TrySendError},
    watch,
};
use uuid::Uuid;

/// Enqueue error.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("Outbound queue full")]
    Full,
    #[error("Session closed")]
    Closed,
}

/// A live session.
///
/// Owned by the `Registry`; the pumps only hold clones of the `Arc`.
/// The outbound queue has a single consumer, the session's writer pump.
#[derive(Debug)]
pub struct Session {
    identity: String,
    session_id: Uuid,
    metadata: AgentMetadata,
    connected_at: i64,
    last_seen: AtomicI64,
    outbound: mpsc::Sender<Envelope>,
    state: watch::Sender<SessionState>,
}

impl Session {
    /// Create an active session from a handshake.
    ///
    /// Returns the session and the receiving end of its outbound queue.
    #[must_use]
    pub fn new(auth: &AuthPayload, capacity: usize) -> (Arc<Self>, mpsc::Receiver<Envelope>) {
        let (outbound, rx) = mpsc::channel(capacity.max(1));
        let (state, _) = watch::channel(SessionState::Active);
        let now = now_unix();
        let session = Arc::new(Self {
            identity: auth.client_id.clone(),
            session_id: Uuid::new_v4(),
            metadata: AgentMetadata::from(auth),
            connected_at: now,
            last_seen: AtomicI64::new(now),
            outbound,
            state,
        });
        (session, rx)
    }

    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Per-connection id; differs between a session and the one replacing it.
    #[must_use]
    pub const fn session_id(&self) -> Uuid {
        self.session_id
    }

    #[must_use]
    pub const fn metadata(&self) -> &AgentMetadata {
        &self.metadata
    }

    /// Unix epoch seconds of the last inbound frame.
    #[must_use]
    pub fn last_seen(&self) -> i64 {
        self.last_seen.load(Ordering::Relaxed)
    }

    pub(crate) fn touch(&self) {
        self.last_seen.store(now_unix(), Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            identity: self.identity.clone(),
            session_id: self.session_id,
            metadata: self.metadata.clone(),
            connected_at: self.connected_at,
            last_seen: self.last_seen(),
        }
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    /// Move to `Closed`. Only the first call has an effect.
    ///
    /// Returns true if this call closed the session.
    pub fn close(&self, reason: CloseReason) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_closed() {
                false
            } else {
                *state = SessionState::Closed(reason);
                true
            }
        })
    }

    /// Wait until the session is closed and return why.
    pub async fn closed(&self) -> CloseReason {
        let mut rx = self.state.subscribe();
        let state = rx.wait_for(|s| s.is_closed()).await.map(|s| *s);
        match state {
            Ok(SessionState::Closed(reason)) => reason,
            _ => CloseReason::Shutdown,
        }
    }

    /// Enqueue an envelope, waiting up to `wait` for room.
    ///
    /// # Errors
    /// Returns `Full` if no room appeared in time, `Closed` if the session
    /// is or becomes closed.
    pub async fn enqueue(&self, envelope: Envelope, wait: Duration) -> Result<(), EnqueueError> {
        if self.is_closed() {
            return Err(EnqueueError::Closed);
        }
        self.outbound
            .send_timeout(envelope, wait)
            .await
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => EnqueueError::Full,
                SendTimeoutError::Closed(_) => EnqueueError::Closed,
            })
    }

    /// Enqueue without waiting.
    ///
    /// # Errors
    /// Returns `Full` if the queue has no room, `Closed` if the session is closed.
    pub fn try_enqueue(&self, envelope: Envelope) -> Result<(), EnqueueError> {
        if self.is_closed() {
            return Err(EnqueueError::Closed);
        }
        self.outbound.try_send(envelope).map_err(|e| match e {
            TrySendError::Full(_) => EnqueueError::Full,
            TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }
}

#[cfg(test)]
pub(crate) fn auth(client_id: &str, hostname: &str) -> AuthPayload {
    AuthPayload {
        client_id: client_id.to_string(),
        hostname: hostname.to_string(),
        username: "u".to_string(),
        os: "linux".to_string(),
    }
}
