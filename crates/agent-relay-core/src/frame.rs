//! Transport-neutral message unit.
//!
//! Session pumps speak `Frame`s so they can run over an axum WebSocket,
//! a tungstenite client socket, or an in-memory channel in tests.

use crate::envelope::Envelope;

/// One message on a message-framed transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Encoded envelope.
    Text(String),
    /// Liveness probe.
    Ping(Vec<u8>),
    /// Probe answer.
    Pong(Vec<u8>),
    /// Orderly shutdown.
    Close,
}

impl Frame {
    /// Encode an envelope into a text frame.
    ///
    /// # Errors
    /// Returns error if the envelope cannot be encoded.
    pub fn envelope(envelope: &Envelope) -> Result<Self, serde_json::Error> {
        envelope.encode().map(Self::Text)
    }

    /// Empty liveness probe.
    #[must_use]
    pub const fn probe() -> Self {
        Self::Ping(Vec::new())
    }

    /// Whether this frame is transport housekeeping rather than data.
    #[must_use]
    pub const fn is_control(&self) -> bool {
        matches!(self, Self::Ping(_) | Self::Pong(_))
    }
}
