//! Correlation table for request/reply pairs.

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use agent_relay_core::{CorrelationId, Envelope};
use tokio::sync::oneshot;
use uuid::Uuid;

struct Waiter {
    identity: String,
    session_id: Uuid,
    tx: oneshot::Sender<Envelope>,
}

/// Requests awaiting a reply, keyed by correlation id.
///
/// A reply only completes a waiter registered for the same identity. Each
/// waiter belongs to the session its request was queued on, and is dropped
/// when that session ends.
#[derive(Default)]
pub struct PendingReplies {
    waiters: Mutex<HashMap<CorrelationId, Waiter>>,
}

impl PendingReplies {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CorrelationId, Waiter>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register interest in the reply to `id` from `identity` on session `session_id`.
    pub fn register(
        &self,
        identity: &str,
        session_id: Uuid,
        id: CorrelationId,
    ) -> oneshot::Receiver<Envelope> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(
            id,
            Waiter {
                identity: identity.to_string(),
                session_id,
                tx,
            },
        );
        rx
    }

    /// Hand a reply to its waiter.
    ///
    /// Returns true if a waiter took it.
    pub fn complete(&self, identity: &str, envelope: &Envelope) -> bool {
        let Some(id) = envelope.id else {
            return false;
        };
        let waiter = {
            let mut waiters = self.lock();
            match waiters.get(&id) {
                Some(w) if w.identity == identity => waiters.remove(&id),
                _ => None,
            }
        };
        waiter.is_some_and(|w| w.tx.send(envelope.clone()).is_ok())
    }

    /// Drop the waiter for `id`, if any.
    pub fn forget(&self, id: CorrelationId) {
        self.lock().remove(&id);
    }

    /// Drop every waiter for session `session_id`; their receivers observe a
    /// closed channel. Waiters on a newer session for the same identity stay.
    pub fn abandon(&self, session_id: Uuid) -> usize {
        let mut waiters = self.lock();
        let before = waiters.len();
        waiters.retain(|_, w| w.session_id != session_id);
        before - waiters.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
