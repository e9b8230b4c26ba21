//! Data models for the FluxTerm gateway.
//!
//! These types describe the transports a session can bind (serial devices
//! and remote shells) and the entries of the serial device catalog. They are
//! deserialized from control-request params and REST bodies, so every
//! optional field carries a documented default.

use std::fmt;

use serde::{Deserialize, Serialize};

// ── Serial ──────────────────────────────────────────────────────────

/// A serial device as reported by the device catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub name: String,
    pub description: String,
    pub is_usb: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
}

/// Line settings for a serial device. The device path doubles as the
/// registry key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub stop_bits: StopBits,
    pub parity: Parity,
    pub flow_control: FlowControl,
    /// Poll interval for reads; an empty poll is "no data", not an error.
    pub read_timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: String::new(),
            baud_rate: 115_200,
            data_bits: 8,
            stop_bits: StopBits::One,
            parity: Parity::None,
            flow_control: FlowControl::None,
            read_timeout_ms: 100,
        }
    }
}

impl SerialConfig {
    /// Check the fields a caller can get wrong.
    pub fn validate(&self) -> Result<(), String> {
        if self.port.trim().is_empty() {
            return Err("missing 'port'".into());
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(format!("invalid data_bits {} (expected 5-8)", self.data_bits));
        }
        if self.baud_rate == 0 {
            return Err("baud_rate must be positive".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum StopBits {
    One,
    Two,
}

impl TryFrom<u8> for StopBits {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(StopBits::One),
            2 => Ok(StopBits::Two),
            other => Err(format!("unsupported stop_bits: {other}")),
        }
    }
}

impl From<StopBits> for u8 {
    fn from(value: StopBits) -> Self {
        match value {
            StopBits::One => 1,
            StopBits::Two => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Parity {
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowControl {
    None,
    Rtscts,
    Xonxoff,
}

// ── Remote shell ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMethod {
    #[serde(rename = "password")]
    Password,
    #[serde(rename = "publickey")]
    PublicKey,
    #[serde(rename = "keyboard-interactive")]
    KeyboardInteractive,
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMethod::Password => write!(f, "password"),
            AuthMethod::PublicKey => write!(f, "publickey"),
            AuthMethod::KeyboardInteractive => write!(f, "keyboard-interactive"),
        }
    }
}

/// Connection settings for a remote interactive shell.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth_method: AuthMethod,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    /// PEM-encoded private key text.
    #[serde(skip_serializing)]
    pub private_key: Option<String>,
    pub private_key_path: Option<String>,
    #[serde(alias = "private_key_passphrase", skip_serializing)]
    pub passphrase: Option<String>,
    pub terminal_type: String,
    pub cols: u32,
    pub rows: u32,
    pub connect_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 22,
            username: String::new(),
            auth_method: AuthMethod::Password,
            password: None,
            private_key: None,
            private_key_path: None,
            passphrase: None,
            terminal_type: "xterm-256color".into(),
            cols: 80,
            rows: 24,
            connect_timeout_secs: 30,
        }
    }
}

impl RemoteConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.host.trim().is_empty() {
            return Err("missing 'host'".into());
        }
        if self.username.is_empty() {
            return Err("missing 'username'".into());
        }
        if self.cols == 0 || self.rows == 0 {
            return Err("cols and rows must be positive".into());
        }
        Ok(())
    }
}

// Credentials never reach logs.
impl fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("auth_method", &self.auth_method)
            .field("private_key_path", &self.private_key_path)
            .field("terminal_type", &self.terminal_type)
            .field("cols", &self.cols)
            .field("rows", &self.rows)
            .finish_non_exhaustive()
    }
}

// ── File transfer ───────────────────────────────────────────────────

/// Block-transfer protocol flavour requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferProtocol {
    /// 128-byte blocks; checksum trailer when receiving.
    Xmodem,
    /// 1024-byte blocks.
    Xmodem1k,
    /// 1024-byte blocks, CRC trailer.
    Ymodem,
}

impl TransferProtocol {
    /// Whether the sender should use 1024-byte blocks.
    pub fn uses_1k_blocks(self) -> bool {
        matches!(self, TransferProtocol::Xmodem1k | TransferProtocol::Ymodem)
    }

    /// Whether the receiver should request the CRC trailer.
    pub fn receives_with_crc(self) -> bool {
        !matches!(self, TransferProtocol::Xmodem)
    }
}
