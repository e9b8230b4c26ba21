//! # Sender
//!
//! `AwaitHandshake → {SendingBlock}* → SendEOT → Done`, or aborted with a
//! [`TransferError`].

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::codec::{self, BlockSize, Checksum, ACK, CAN, EOT, NAK};
use crate::error::TransferError;
use crate::port::{read_byte, Port};
use crate::{Progress, TransferConfig};

/// What a completed send put on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendSummary {
    pub blocks: usize,
    /// Unpadded payload length.
    pub bytes: u64,
    pub checksum: Checksum,
    pub retransmissions: u32,
}

#[derive(Debug, Clone)]
pub struct Sender {
    config: TransferConfig,
    block_size: BlockSize,
}

impl Sender {
    pub fn new(config: TransferConfig) -> Self {
        Self {
            config,
            block_size: BlockSize::Standard,
        }
    }

    pub fn with_block_size(mut self, size: BlockSize) -> Self {
        self.block_size = size;
        self
    }

    /// Send `payload` and wait for the receiver to acknowledge EOT.
    pub async fn send(
        &self,
        port: &dyn Port,
        payload: &[u8],
        mut on_progress: impl FnMut(Progress) + Send,
    ) -> Result<SendSummary, TransferError> {
        let mode = self.await_handshake(port).await?;
        debug!(?mode, block_size = self.block_size.len(), "xmodem handshake complete");

        let total = payload.len() as u64;
        let blocks = codec::split_blocks(payload, self.block_size);
        let mut retransmissions = 0u32;
        let mut sent = 0u64;

        for (index, block) in blocks.iter().enumerate() {
            let number = codec::block_number(index);
            let frame = codec::encode_frame(number, block, mode);
            retransmissions += self.send_frame(port, number, &frame).await?;

            sent = (sent + self.block_size.len() as u64).min(total);
            on_progress(Progress {
                transferred: sent,
                total: Some(total),
            });
        }

        self.send_eot(port).await?;
        info!(blocks = blocks.len(), bytes = total, retransmissions, "xmodem send complete");
        Ok(SendSummary {
            blocks: blocks.len(),
            bytes: total,
            checksum: mode,
            retransmissions,
        })
    }

    async fn await_handshake(&self, port: &dyn Port) -> Result<Checksum, TransferError> {
        let deadline = Instant::now() + self.config.handshake_timeout;
        loop {
            match read_byte(port, deadline).await? {
                None => return Err(TransferError::Timeout),
                Some(CAN) => return Err(TransferError::Cancelled),
                Some(byte) => match Checksum::from_request(byte) {
                    Some(mode) => return Ok(mode),
                    None => debug!(byte, "ignoring noise before handshake"),
                },
            }
        }
    }

    /// Transmit one frame until it is acknowledged. Returns the number of
    /// retransmissions it took.
    async fn send_frame(
        &self,
        port: &dyn Port,
        number: u8,
        frame: &[u8],
    ) -> Result<u32, TransferError> {
        for attempt in 0..self.config.max_retries {
            port.write_all(frame).await?;
            let deadline = Instant::now() + self.config.response_timeout;
            match read_byte(port, deadline).await? {
                Some(ACK) => return Ok(attempt),
                Some(CAN) => return Err(TransferError::Cancelled),
                Some(NAK) => debug!(block = number, attempt, "NAK, retransmitting"),
                Some(other) => debug!(block = number, byte = other, "unexpected response"),
                None => debug!(block = number, attempt, "no response"),
            }
        }
        warn!(block = number, "giving up on block");
        Err(TransferError::TooManyRetries { block: number })
    }

    async fn send_eot(&self, port: &dyn Port) -> Result<(), TransferError> {
        for _ in 0..self.config.max_retries {
            port.write_all(&[EOT]).await?;
            let deadline = Instant::now() + self.config.response_timeout;
            match read_byte(port, deadline).await? {
                Some(ACK) => return Ok(()),
                Some(CAN) => return Err(TransferError::Cancelled),
                _ => {}
            }
        }
        Err(TransferError::Timeout)
    }
}
