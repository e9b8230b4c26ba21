//! WebSocket protocol messages between the browser client and a gateway
//! session.
//!
//! Every frame is a JSON [`Envelope`]: `{type, session_id, payload,
//! timestamp}`. The payload is opaque until the handler selected by `type`
//! parses it. Control payloads carry a free-form `{action, params}` pair on
//! the wire; [`ControlRequest::from_payload`] turns it into a closed variant
//! with validated, defaulted params before anything is dispatched.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{RemoteConfig, SerialConfig, TransferProtocol};

// ── Envelope ────────────────────────────────────────────────────────

/// Envelope discriminator.
///
/// Any other string decodes as `Unknown`, keeping the raw name, and is
/// answered with UNKNOWN_TYPE. A `type` that is not a string at all (a
/// number, `null`, missing) fails envelope decoding and is answered with
/// INVALID_MESSAGE.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    Data,
    Control,
    Status,
    Error,
    FileTransfer,
    Unknown(String),
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        match self {
            MessageType::Data => "data",
            MessageType::Control => "control",
            MessageType::Status => "status",
            MessageType::Error => "error",
            MessageType::FileTransfer => "file_transfer",
            MessageType::Unknown(name) => name,
        }
    }
}

impl From<String> for MessageType {
    fn from(name: String) -> Self {
        match name.as_str() {
            "data" => MessageType::Data,
            "control" => MessageType::Control,
            "status" => MessageType::Status,
            "error" => MessageType::Error,
            "file_transfer" => MessageType::FileTransfer,
            _ => MessageType::Unknown(name),
        }
    }
}

impl From<MessageType> for String {
    fn from(t: MessageType) -> Self {
        match t {
            MessageType::Unknown(name) => name,
            known => known.as_str().to_owned(),
        }
    }
}

/// The outer envelope for all WebSocket messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_id: String,
    /// Type-specific payload.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: i64,
}

impl Envelope {
    /// Create an envelope stamped with the current time.
    pub fn new(msg_type: MessageType, session_id: impl Into<String>, payload: impl Serialize) -> Self {
        Self {
            msg_type,
            session_id: session_id.into(),
            payload: serde_json::to_value(payload).unwrap_or_default(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Raw transport bytes, base64-encoded.
    pub fn data(session_id: &str, bytes: &[u8]) -> Self {
        Self::new(MessageType::Data, session_id, DataPayload::from_bytes(bytes))
    }

    pub fn status(session_id: &str, state: LinkState, message: impl Into<String>) -> Self {
        Self::new(
            MessageType::Status,
            session_id,
            StatusPayload {
                state,
                message: message.into(),
            },
        )
    }

    pub fn error(session_id: &str, code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(
            MessageType::Error,
            session_id,
            ErrorPayload {
                code,
                message: message.into(),
            },
        )
    }

    pub fn file_transfer(session_id: &str, payload: FileTransferPayload) -> Self {
        Self::new(MessageType::FileTransfer, session_id, payload)
    }

    /// Parse the payload into a concrete type.
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

// ── Payloads ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPayload {
    /// Base64-encoded bytes.
    pub data: String,
    #[serde(default)]
    pub encoding: String,
}

impl DataPayload {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: BASE64.encode(bytes),
            encoding: "base64".into(),
        }
    }

    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(self.data.as_bytes())
    }
}

/// Connection state reported in `status` envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Ready,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusPayload {
    pub state: LinkState,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Stable error codes surfaced to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidMessage,
    UnknownType,
    InvalidControl,
    UnknownAction,
    InvalidParams,
    OpenFailed,
    SshConnectFailed,
    ResizeFailed,
    InvalidData,
    DecodeError,
    NotConnected,
    WriteError,
    TransferInProgress,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
            ErrorCode::UnknownType => "UNKNOWN_TYPE",
            ErrorCode::InvalidControl => "INVALID_CONTROL",
            ErrorCode::UnknownAction => "UNKNOWN_ACTION",
            ErrorCode::InvalidParams => "INVALID_PARAMS",
            ErrorCode::OpenFailed => "OPEN_FAILED",
            ErrorCode::SshConnectFailed => "SSH_CONNECT_FAILED",
            ErrorCode::ResizeFailed => "RESIZE_FAILED",
            ErrorCode::InvalidData => "INVALID_DATA",
            ErrorCode::DecodeError => "DECODE_ERROR",
            ErrorCode::NotConnected => "NOT_CONNECTED",
            ErrorCode::WriteError => "WRITE_ERROR",
            ErrorCode::TransferInProgress => "TRANSFER_IN_PROGRESS",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferAction {
    Start,
    Progress,
    Complete,
    Error,
}

/// File transfer lifecycle event. Zero/empty fields are omitted on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTransferPayload {
    pub action: TransferAction,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub file_name: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub file_size: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub sent: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub received: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

impl FileTransferPayload {
    pub fn new(action: TransferAction, file_name: impl Into<String>) -> Self {
        Self {
            action,
            file_name: file_name.into(),
            file_size: 0,
            sent: 0,
            received: 0,
            message: String::new(),
            error: String::new(),
        }
    }
}

// ── Control ─────────────────────────────────────────────────────────

/// Control payload as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPayload {
    pub action: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeParams {
    pub cols: u32,
    pub rows: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendFileParams {
    /// Base64-encoded file contents.
    pub data: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub protocol: Option<TransferProtocol>,
}

impl SendFileParams {
    pub fn decode_data(&self) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(self.data.as_bytes())
    }

    pub fn uses_1k_blocks(&self) -> bool {
        self.protocol.is_some_and(TransferProtocol::uses_1k_blocks)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReceiveFileParams {
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub protocol: Option<TransferProtocol>,
}

impl ReceiveFileParams {
    /// CRC unless plain checksum XMODEM was asked for.
    pub fn use_crc(&self) -> bool {
        self.protocol.map_or(true, TransferProtocol::receives_with_crc)
    }
}

pub const DEFAULT_SEND_FILE_NAME: &str = "file.bin";
pub const DEFAULT_RECEIVE_FILE_NAME: &str = "received_file.bin";

/// A validated control request. One variant per action.
#[derive(Debug, Clone)]
pub enum ControlRequest {
    /// Open (or take over) a serial device and bind it.
    Connect(SerialConfig),
    /// Open a remote shell with a pseudo-terminal and bind it.
    ConnectRemote(RemoteConfig),
    /// Unbind and close whatever is bound.
    Disconnect,
    /// Window-size change; only meaningful for remote shells.
    Resize(ResizeParams),
    SendFile(SendFileParams),
    ReceiveFile(ReceiveFileParams),
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("unknown control action: {0}")]
    UnknownAction(String),
    #[error("invalid params for {action}: {reason}")]
    InvalidParams { action: &'static str, reason: String },
}

impl ControlRequest {
    /// Validate a wire-level control payload.
    pub fn from_payload(payload: ControlPayload) -> Result<Self, ControlError> {
        let ControlPayload { action, params } = payload;
        match action.as_str() {
            "connect" => {
                let config: SerialConfig = parse_params("connect", params)?;
                config.validate().map_err(|reason| ControlError::InvalidParams {
                    action: "connect",
                    reason,
                })?;
                Ok(ControlRequest::Connect(config))
            }
            "connect_remote" | "connect_ssh" => {
                let config: RemoteConfig = parse_params("connect_remote", params)?;
                config.validate().map_err(|reason| ControlError::InvalidParams {
                    action: "connect_remote",
                    reason,
                })?;
                Ok(ControlRequest::ConnectRemote(config))
            }
            "disconnect" => Ok(ControlRequest::Disconnect),
            "resize" => parse_params("resize", params)
                .map(ControlRequest::Resize)
                .map_err(|_| ControlError::InvalidParams {
                    action: "resize",
                    reason: "Missing cols or rows".into(),
                }),
            "send_file" => {
                let mut p: SendFileParams = parse_params("send_file", params)?;
                if p.file_name.is_empty() {
                    p.file_name = DEFAULT_SEND_FILE_NAME.into();
                }
                Ok(ControlRequest::SendFile(p))
            }
            "receive_file" => {
                let mut p: ReceiveFileParams = parse_params("receive_file", params)?;
                if p.file_name.is_empty() {
                    p.file_name = DEFAULT_RECEIVE_FILE_NAME.into();
                }
                Ok(ControlRequest::ReceiveFile(p))
            }
            _ => Err(ControlError::UnknownAction(action)),
        }
    }

    pub fn action(&self) -> &'static str {
        match self {
            ControlRequest::Connect(_) => "connect",
            ControlRequest::ConnectRemote(_) => "connect_remote",
            ControlRequest::Disconnect => "disconnect",
            ControlRequest::Resize(_) => "resize",
            ControlRequest::SendFile(_) => "send_file",
            ControlRequest::ReceiveFile(_) => "receive_file",
        }
    }
}

/// Missing params decode as an empty object so all-default actions work.
fn parse_params<T: DeserializeOwned>(
    action: &'static str,
    params: serde_json::Value,
) -> Result<T, ControlError> {
    let params = match params {
        serde_json::Value::Null => serde_json::Value::Object(Default::default()),
        other => other,
    };
    serde_json::from_value(params).map_err(|e| ControlError::InvalidParams {
        action,
        reason: e.to_string(),
    })
}
