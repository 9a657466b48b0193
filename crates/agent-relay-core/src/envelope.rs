//! Wire envelope and codec.
//!
//! Every frame on the wire is a JSON object
//! `{"type": <tag>, "payload": <by type>, "timestamp": <unix seconds>}`
//! with an optional `"id"` correlation token echoed on replies.

use std::{
    fmt,
    str::FromStr,
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::payload::{ErrorPayload, Payload, ResponsePayload};

/// Correlation token carried by a request and echoed on its reply.
pub type CorrelationId = Uuid;

/// Current time as Unix epoch seconds.
#[must_use]
pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Closed set of recognized type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Auth,
    Heartbeat,
    Command,
    Screenshot,
    Webcam,
    ShowImage,
    Response,
    Error,
    FileRead,
    FileWrite,
    FileDelete,
    FileList,
    FileDownload,
    RegRead,
    RegWrite,
    RegDelete,
    RegList,
}

impl MessageType {
    /// Every recognized tag.
    pub const ALL: [Self; 17] = [
        Self::Auth,
        Self::Heartbeat,
        Self::Command,
        Self::Screenshot,
        Self::Webcam,
        Self::ShowImage,
        Self::Response,
        Self::Error,
        Self::FileRead,
        Self::FileWrite,
        Self::FileDelete,
        Self::FileList,
        Self::FileDownload,
        Self::RegRead,
        Self::RegWrite,
        Self::RegDelete,
        Self::RegList,
    ];

    /// Wire tag for this type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Heartbeat => "heartbeat",
            Self::Command => "command",
            Self::Screenshot => "screenshot",
            Self::Webcam => "webcam",
            Self::ShowImage => "show_image",
            Self::Response => "response",
            Self::Error => "error",
            Self::FileRead => "file_read",
            Self::FileWrite => "file_write",
            Self::FileDelete => "file_delete",
            Self::FileList => "file_list",
            Self::FileDownload => "file_download",
            Self::RegRead => "reg_read",
            Self::RegWrite => "reg_write",
            Self::RegDelete => "reg_delete",
            Self::RegList => "reg_list",
        }
    }

    /// Whether this type asks an agent to run a capability.
    #[must_use]
    pub const fn is_capability(self) -> bool {
        !matches!(
            self,
            Self::Auth | Self::Heartbeat | Self::Response | Self::Error
        )
    }

    /// Whether this type carries the outcome of an earlier request.
    #[must_use]
    pub const fn is_reply(self) -> bool {
        matches!(self, Self::Response | Self::Error)
    }

    /// Registry-key operations, only meaningful on Windows agents.
    #[must_use]
    pub const fn is_registry_key_op(self) -> bool {
        matches!(
            self,
            Self::RegRead | Self::RegWrite | Self::RegDelete | Self::RegList
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DecodeError::UnknownType(s.to_string()))
    }
}

/// Decode error.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("Unknown message type: {0}")]
    UnknownType(String),
    #[error("Invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: MessageType,
        /// Correlation token of the rejected envelope, so the error reply can echo it.
        id: Option<CorrelationId>,
        #[source]
        source: serde_json::Error,
    },
}

impl DecodeError {
    /// Unknown tags are tolerated after the handshake so the protocol can grow.
    #[must_use]
    pub const fn is_unknown_type(&self) -> bool {
        matches!(self, Self::UnknownType(_))
    }

    /// Correlation token of the envelope that failed, when it could be read.
    #[must_use]
    pub const fn correlation_id(&self) -> Option<CorrelationId> {
        match self {
            Self::InvalidPayload { id, .. } => *id,
            _ => None,
        }
    }
}

/// Typed, timestamped message unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Type-specific payload; also determines the wire tag.
    pub payload: Payload,
    /// Unix epoch seconds.
    pub timestamp: i64,
    /// Correlation token, if the sender asked for one.
    pub id: Option<CorrelationId>,
}

#[derive(Serialize)]
struct WireEnvelope<'a> {
    #[serde(rename = "type")]
    kind: MessageType,
    payload: &'a Payload,
    timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<CorrelationId>,
}

// Tag kept as a string so an unknown tag is not reported as malformed JSON.
#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Value,
    timestamp: i64,
    #[serde(default)]
    id: Option<CorrelationId>,
}

impl Envelope {
    /// Create an envelope stamped with the current time.
    #[must_use]
    pub fn new(payload: impl Into<Payload>) -> Self {
        Self::at(payload, now_unix())
    }

    /// Create an envelope with an explicit timestamp.
    #[must_use]
    pub fn at(payload: impl Into<Payload>, timestamp: i64) -> Self {
        Self {
            payload: payload.into(),
            timestamp,
            id: None,
        }
    }

    /// Attach a correlation token.
    #[must_use]
    pub const fn with_id(mut self, id: CorrelationId) -> Self {
        self.id = Some(id);
        self
    }

    /// Build the reply to a request, echoing its correlation token.
    #[must_use]
    pub fn response(result: ResponsePayload, reply_to: Option<CorrelationId>) -> Self {
        Self {
            id: reply_to,
            ..Self::new(result)
        }
    }

    /// Build an `error` envelope, echoing a correlation token when known.
    #[must_use]
    pub fn error(
        code: impl Into<String>,
        message: impl Into<String>,
        reply_to: Option<CorrelationId>,
    ) -> Self {
        Self {
            id: reply_to,
            ..Self::new(ErrorPayload::new(code, message))
        }
    }

    /// Type tag of this envelope.
    #[must_use]
    pub const fn kind(&self) -> MessageType {
        self.payload.kind()
    }

    /// Encode to the JSON wire form.
    ///
    /// # Errors
    /// Returns error if a heartbeat payload holds a value JSON cannot represent.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&WireEnvelope {
            kind: self.kind(),
            payload: &self.payload,
            timestamp: self.timestamp,
            id: self.id,
        })
    }

    /// Decode from the JSON wire form.
    ///
    /// # Errors
    /// Returns `UnknownType` for unrecognized tags, `InvalidPayload` when the
    /// payload does not match the schema of its tag, `Malformed` otherwise,
    /// including a missing or non-integer `timestamp`.
    pub fn decode(bytes: impl AsRef<[u8]>) -> Result<Self, DecodeError> {
        let raw: RawEnvelope =
            serde_json::from_slice(bytes.as_ref()).map_err(DecodeError::Malformed)?;
        let kind: MessageType = raw.kind.parse()?;
        let payload = Payload::parse(kind, raw.payload).map_err(|e| match e {
            DecodeError::InvalidPayload { kind, source, .. } => DecodeError::InvalidPayload {
                kind,
                id: raw.id,
                source,
            },
            other => other,
        })?;
        Ok(Self {
            payload,
            timestamp: raw.timestamp,
            id: raw.id,
        })
    }
}
