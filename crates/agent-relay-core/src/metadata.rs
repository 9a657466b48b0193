//! Session identity data and lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::payload::AuthPayload;

/// Descriptive data an agent reports at handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentMetadata {
    pub hostname: String,
    pub username: String,
    pub platform: String,
}

impl From<&AuthPayload> for AgentMetadata {
    fn from(auth: &AuthPayload) -> Self {
        Self {
            hostname: auth.hostname.clone(),
            username: auth.username.clone(),
            platform: auth.os.clone(),
        }
    }
}

/// Point-in-time view of a live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    /// Identity chosen by the agent.
    pub identity: String,
    /// Unique per connection; distinguishes a replaced session from its successor.
    pub session_id: Uuid,
    pub metadata: AgentMetadata,
    /// Unix epoch seconds.
    pub connected_at: i64,
    /// Unix epoch seconds of the last inbound frame.
    pub last_seen: i64,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Peer closed the transport or the stream ended.
    PeerClosed,
    /// Reading from the transport failed.
    TransportError,
    /// No inbound frame within the idle deadline.
    IdleTimeout,
    /// Writing an envelope failed or timed out.
    WriteFailed,
    /// Writing a liveness probe failed or timed out.
    ProbeFailed,
    /// A newer connection authenticated with the same identity.
    Replaced,
    /// Removed administratively.
    Removed,
    /// Controller shutting down.
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PeerClosed => "peer closed",
            Self::TransportError => "transport error",
            Self::IdleTimeout => "idle timeout",
            Self::WriteFailed => "write failed",
            Self::ProbeFailed => "probe failed",
            Self::Replaced => "replaced",
            Self::Removed => "removed",
            Self::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// Connection lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum SessionState {
    /// Transport accepted, nothing exchanged.
    Connecting,
    /// Waiting for the auth frame.
    Authenticating,
    /// Admitted to the registry.
    Active,
    Closed(CloseReason),
}

impl SessionState {
    #[must_use]
    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Closed(_))
    }
}
