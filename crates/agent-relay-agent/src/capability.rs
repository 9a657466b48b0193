//! Capability handlers and the table that selects them.

use std::{collections::HashMap, error::Error as StdError, future::Future, sync::Arc};

use agent_relay_core::{MessageType, Payload};
use async_trait::async_trait;
use thiserror::Error;

type BoxError = Box<dyn StdError + Send + Sync>;

/// Capability failure, reported to the controller as `success: false`.
#[derive(Debug, Error)]
pub enum CapabilityError {
    /// No handler for this type on this agent.
    #[error("{0} is not supported on this platform")]
    Unsupported(MessageType),
    #[error("{message}")]
    Failed {
        message: String,
        #[source]
        cause: Option<BoxError>,
    },
}

impl CapabilityError {
    /// Failure without an underlying cause.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            cause: None,
        }
    }

    /// Failure wrapping the error that caused it.
    #[must_use]
    pub fn with_cause(message: impl Into<String>, cause: impl Into<BoxError>) -> Self {
        Self::Failed {
            message: message.into(),
            cause: Some(cause.into()),
        }
    }

    /// Human-readable text for the `error` field: `"<message>: <cause>"`.
    #[must_use]
    pub fn report(&self) -> String {
        match self {
            Self::Failed {
                message,
                cause: Some(cause),
            } => format!("{message}: {cause}"),
            _ => self.to_string(),
        }
    }
}

/// Executes one kind of request.
///
/// Implement this trait per capability (file access, process execution,
/// screen capture, ...) and register it in a `CapabilityTable`.
#[async_trait]
pub trait CapabilityHandler: Send + Sync {
    /// Run the request and return its result data.
    ///
    /// Binary results should be base64 encoded.
    async fn execute(&self, request: Payload) -> Result<String, CapabilityError>;
}

/// Handler backed by an async closure.
pub struct FnHandler<F>(F);

/// Wrap an async closure as a `CapabilityHandler`.
pub const fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Payload) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, CapabilityError>> + Send,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> CapabilityHandler for FnHandler<F>
where
    F: Fn(Payload) -> Fut + Send + Sync,
    Fut: Future<Output = Result<String, CapabilityError>> + Send,
{
    async fn execute(&self, request: Payload) -> Result<String, CapabilityError> {
        (self.0)(request).await
    }
}

/// Handlers keyed by request type.
///
/// Missing entries answer with `Unsupported`, so platform differences are
/// expressed by which entries a build registers.
#[derive(Clone, Default)]
pub struct CapabilityTable {
    handlers: HashMap<MessageType, Arc<dyn CapabilityHandler>>,
}

impl CapabilityTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`, replacing any previous one.
    ///
    /// Non-request types (auth, heartbeat, response, error) are ignored.
    #[must_use]
    pub fn with(mut self, kind: MessageType, handler: impl CapabilityHandler + 'static) -> Self {
        if kind.is_capability() {
            self.handlers.insert(kind, Arc::new(handler));
        } else {
            tracing::warn!(%kind, "Not a capability type, handler ignored");
        }
        self
    }

    /// Drop the entries for `kinds`.
    #[must_use]
    pub fn without(mut self, kinds: impl IntoIterator<Item = MessageType>) -> Self {
        for kind in kinds {
            self.handlers.remove(&kind);
        }
        self
    }

    /// Drop entries that cannot work on the platform this agent was built for.
    #[must_use]
    pub fn for_current_platform(self) -> Self {
        if cfg!(windows) {
            self
        } else {
            self.without(MessageType::ALL.into_iter().filter(|k| k.is_registry_key_op()))
        }
    }

    #[must_use]
    pub fn get(&self, kind: MessageType) -> Option<Arc<dyn CapabilityHandler>> {
        self.handlers.get(&kind).cloned()
    }

    #[must_use]
    pub fn supports(&self, kind: MessageType) -> bool {
        self.handlers.contains_key(&kind)
    }

    /// Run `request` on the handler for its type.
    ///
    /// # Errors
    /// `Unsupported` if no handler is registered, else the handler's error.
    pub async fn execute(&self, request: Payload) -> Result<String, CapabilityError> {
        let kind = request.kind();
        let handler = self.get(kind).ok_or(CapabilityError::Unsupported(kind))?;
        handler.execute(request).await
    }
}
