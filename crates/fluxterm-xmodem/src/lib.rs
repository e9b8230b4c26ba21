//! # fluxterm-xmodem
//!
//! XMODEM-family block transfer engine.
//!
//! Stop-and-wait framing with 128-byte (SOH) or 1024-byte (STX) blocks, an
//! 8-bit checksum or CRC-16 trailer negotiated by the receiver's start
//! signal, per-block retransmission, and CAN handling. The engine runs over
//! any [`Port`]; it knows nothing about sessions or WebSockets.
//!
//! A transfer in flight has no cancel token. It ends when the protocol
//! finishes, when its retry budget runs out, or when the port returns an
//! error, which is what happens once the underlying transport is closed.
//!
//! ## Crate structure
//!
//! - [`codec`]: checksum, CRC-16, block padding, frame encode/verify
//! - [`port`]: the byte-stream seam and a `StreamPort` adapter
//! - [`sender`]: sender state machine
//! - [`receiver`]: receiver state machine

use std::time::Duration;

pub mod codec;
pub mod error;
pub mod port;
pub mod receiver;
pub mod sender;

pub use codec::{BlockSize, Checksum};
pub use error::TransferError;
pub use port::{Port, StreamPort};
pub use receiver::Receiver;
pub use sender::{SendSummary, Sender};

/// Timing and retry budget shared by both roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    /// How long the sender waits for the receiver's start signal.
    pub handshake_timeout: Duration,
    /// Wait for a single ACK/NAK, or for the rest of a frame.
    pub response_timeout: Duration,
    /// Receiver start-signal repeat interval.
    pub start_interval: Duration,
    /// How many start signals the receiver sends before giving up.
    pub start_attempts: u32,
    /// Attempts per block (and for EOT) before failing.
    pub max_retries: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            response_timeout: Duration::from_secs(3),
            start_interval: Duration::from_secs(1),
            start_attempts: 10,
            max_retries: 10,
        }
    }
}

/// Cumulative progress, reported after each acknowledged block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Payload bytes moved so far. The sender counts unpadded bytes; the
    /// receiver counts whole blocks.
    pub transferred: u64,
    /// Known only on the sending side.
    pub total: Option<u64>,
}
