//! Command delivery to a named agent.
//!
//! The bounded wait on a full outbound queue is the only backpressure
//! mechanism: a slow agent costs callers a `Timeout`, never controller memory.

use std::{sync::Arc, time::Duration};

use agent_relay_core::{CorrelationId, Envelope, SessionConfig};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    pending::PendingReplies,
    registry::Registry,
    session::{EnqueueError, Session},
};

/// Gateway error.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No live session has this identity.
    #[error("Client not found: {0}")]
    NotFound(String),
    /// The outbound queue stayed full for the whole wait; the command was dropped.
    #[error("Timeout sending command to client {0}")]
    Timeout(String),
    /// The session closed before the command could be queued or answered.
    #[error("Session closed: {0}")]
    Closed(String),
    /// The command was delivered but no reply arrived in time.
    #[error("No response from client {0}")]
    ResponseTimeout(String),
}

/// Entry point for front-ends addressing agents by identity.
#[derive(Clone)]
pub struct CommandGateway {
    registry: Arc<Registry>,
    send_timeout: Duration,
    response_timeout: Duration,
}

impl CommandGateway {
    #[must_use]
    pub fn new(registry: Arc<Registry>, config: &SessionConfig) -> Self {
        Self {
            registry,
            send_timeout: config.send_timeout,
            response_timeout: config.response_timeout,
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Queue `envelope` on the session for `identity`.
    ///
    /// # Errors
    /// `NotFound` if the agent is not connected, `Timeout` if its queue stayed
    /// full for the configured wait, `Closed` if the session went away.
    pub async fn send_command(&self, identity: &str, envelope: Envelope) -> Result<(), GatewayError> {
        let session = self.find(identity).await?;
        self.enqueue(&session, envelope).await
    }

    async fn find(&self, identity: &str) -> Result<Arc<Session>, GatewayError> {
        self.registry
            .lookup(identity)
            .await
            .ok_or_else(|| GatewayError::NotFound(identity.to_string()))
    }

    async fn enqueue(&self, session: &Session, envelope: Envelope) -> Result<(), GatewayError> {
        let identity = session.identity();
        let kind = envelope.kind();
        match session.enqueue(envelope, self.send_timeout).await {
            Ok(()) => {
                tracing::debug!(identity = %identity, %kind, "Command queued");
                Ok(())
            }
            Err(EnqueueError::Full) => {
                tracing::warn!(identity = %identity, %kind, "Outbound queue full, command dropped");
                Err(GatewayError::Timeout(identity.to_string()))
            }
            Err(EnqueueError::Closed) => Err(GatewayError::Closed(identity.to_string())),
        }
    }

    /// Send `envelope` with a fresh correlation id and wait for its reply.
    ///
    /// The reply is a `response` or `error` envelope carrying the same id.
    ///
    /// # Errors
    /// Everything `send_command` returns, plus `ResponseTimeout` if no reply
    /// arrives in time and `Closed` if the session ends while waiting.
    pub async fn request(&self, identity: &str, envelope: Envelope) -> Result<Envelope, GatewayError> {
        let session = self.find(identity).await?;
        let id = Uuid::new_v4();
        let pending = self.registry.pending();
        let reply = pending.register(identity, session.session_id(), id);
        // Also covers the caller dropping this future mid-wait.
        let _slot = PendingSlot { pending, id };

        self.enqueue(&session, envelope.with_id(id)).await?;

        match tokio::time::timeout(self.response_timeout, reply).await {
            Ok(Ok(envelope)) => Ok(envelope),
            Ok(Err(_)) => Err(GatewayError::Closed(identity.to_string())),
            Err(_) => Err(GatewayError::ResponseTimeout(identity.to_string())),
        }
    }
}

/// Removes a request's waiter when the request finishes, however it finishes.
struct PendingSlot<'a> {
    pending: &'a PendingReplies,
    id: CorrelationId,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.pending.forget(self.id);
    }
}
