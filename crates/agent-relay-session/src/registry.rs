//! Identity-keyed table of live sessions.

use std::{collections::HashMap, sync::Arc};

use agent_relay_core::{CloseReason, Envelope, SessionSnapshot};
use futures::{Stream, StreamExt};
use tokio::sync::{RwLock, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::{pending::PendingReplies, session::Session};

/// Default event channel capacity.
const EVENT_CAPACITY: usize = 1024;

/// Registry change or inbound traffic, for front-ends.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A session was admitted.
    Connected(SessionSnapshot),
    /// A session left the registry.
    Disconnected {
        identity: String,
        session_id: Uuid,
        reason: CloseReason,
    },
    /// An agent sent something other than auth or heartbeat.
    Message { identity: String, envelope: Envelope },
}

/// The single authority over which sessions exist.
///
/// Every mutation takes the write side of one lock; lookups and listings
/// share the read side.
pub struct Registry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    events: broadcast::Sender<RegistryEvent>,
    pending: PendingReplies,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            sessions: RwLock::new(HashMap::new()),
            events,
            pending: PendingReplies::new(),
        }
    }

    fn emit(&self, event: RegistryEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn emit_disconnected(&self, session: &Session, reason: CloseReason) {
        self.pending.abandon(session.session_id());
        self.emit(RegistryEvent::Disconnected {
            identity: session.identity().to_string(),
            session_id: session.session_id(),
            reason,
        });
    }

    /// Insert a session, replacing any entry with the same identity.
    ///
    /// The replaced session is closed so its transport does not linger.
    /// Closing it and emitting both events happen under the write lock, so
    /// racing admits for one identity publish events in table order.
    pub async fn admit(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write().await;
        let previous = sessions.insert(session.identity().to_string(), Arc::clone(&session));

        let meta = session.metadata();
        tracing::info!(
            identity = %session.identity(),
            hostname = %meta.hostname,
            username = %meta.username,
            platform = %meta.platform,
            "Agent registered"
        );

        if let Some(prev) = &previous {
            if prev.session_id() != session.session_id() {
                tracing::info!(identity = %prev.identity(), "Replacing existing session");
                prev.close(CloseReason::Replaced);
                self.emit_disconnected(prev, CloseReason::Replaced);
            }
        }
        self.emit(RegistryEvent::Connected(session.snapshot()));
        drop(sessions);
        previous
    }

    /// Remove and close the session for `identity`. Absent identities are a no-op.
    pub async fn remove(&self, identity: &str) -> Option<Arc<Session>> {
        let mut sessions = self.sessions.write().await;
        let removed = sessions.remove(identity);
        if let Some(session) = &removed {
            session.close(CloseReason::Removed);
            tracing::info!(identity = %identity, "Agent removed");
            self.emit_disconnected(session, CloseReason::Removed);
        }
        drop(sessions);
        removed
    }

    /// Close `session` and remove it if it is still the entry for its identity.
    ///
    /// Used by the pumps; a session that was already replaced leaves the
    /// newer entry alone. Returns true if an entry was removed.
    pub async fn release(&self, session: &Session, reason: CloseReason) -> bool {
        session.close(reason);
        let mut sessions = self.sessions.write().await;
        let removed = match sessions.get(session.identity()) {
            Some(current) if current.session_id() == session.session_id() => {
                sessions.remove(session.identity())
            }
            _ => None,
        };
        if removed.is_some() {
            tracing::info!(identity = %session.identity(), %reason, "Agent unregistered");
            self.emit_disconnected(session, reason);
        } else {
            // Replaced or removed already; only its own waiters are left to drop.
            self.pending.abandon(session.session_id());
        }
        drop(sessions);
        removed.is_some()
    }

    #[must_use]
    pub async fn lookup(&self, identity: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(identity).cloned()
    }

    /// Point-in-time snapshot of every session, unordered.
    #[must_use]
    pub async fn list_all(&self) -> Vec<SessionSnapshot> {
        self.sessions
            .read()
            .await
            .values()
            .map(|s| s.snapshot())
            .collect()
    }

    #[must_use]
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    #[must_use]
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Close and remove every session. Returns how many were live.
    pub async fn drain(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let count = sessions.len();
        for (_, session) in sessions.drain() {
            session.close(CloseReason::Shutdown);
            self.emit_disconnected(&session, CloseReason::Shutdown);
        }
        count
    }

    /// Route an inbound envelope: complete a waiting request, then publish it.
    pub(crate) fn publish(&self, identity: &str, envelope: Envelope) {
        if envelope.kind().is_reply() && self.pending.complete(identity, &envelope) {
            tracing::debug!(identity = %identity, id = ?envelope.id, "Reply matched request");
        }
        self.emit(RegistryEvent::Message {
            identity: identity.to_string(),
            envelope,
        });
    }

    #[must_use]
    pub const fn pending(&self) -> &PendingReplies {
        &self.pending
    }

    /// Receiver for registry events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Stream of registry events. Events missed by a lagging consumer are skipped.
    #[must_use]
    pub fn events(&self) -> impl Stream<Item = RegistryEvent> + Send + 'static {
        BroadcastStream::new(self.subscribe())
            .filter_map(|res| futures::future::ready(res.ok()))
    }
}
