//! # Receiver
//!
//! `AwaitFirstFrame → {ReceivingBlock}* → Done`, or aborted with a
//! [`TransferError`].
//!
//! The start handshake has to consume a byte to learn that the sender has
//! begun. That byte is the first frame's header, so it is kept and fed into
//! block parsing instead of being discarded.

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::codec::{self, BlockSize, Checksum, ACK, CAN, EOT, NAK, SOH, STX};
use crate::error::TransferError;
use crate::port::{read_byte, read_until, Port};
use crate::{Progress, TransferConfig};

#[derive(Debug, Clone)]
pub struct Receiver {
    config: TransferConfig,
    mode: Checksum,
}

/// Why the current block was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    Timeout,
    Invalid,
}

impl Receiver {
    pub fn new(config: TransferConfig, mode: Checksum) -> Self {
        Self { config, mode }
    }

    /// Receive a whole file. Blocks are appended verbatim, padding included.
    pub async fn receive(
        &self,
        port: &dyn Port,
        mut on_progress: impl FnMut(Progress) + Send,
    ) -> Result<Vec<u8>, TransferError> {
        let mut pending = Some(self.start(port).await?);
        let mut data = Vec::new();
        let mut expected: u8 = 1;
        let mut failures = 0u32;

        loop {
            let header = match pending.take() {
                Some(byte) => Some(byte),
                None => {
                    let deadline = Instant::now() + self.config.response_timeout;
                    read_byte(port, deadline).await?
                }
            };

            let outcome = match header {
                None => Err(Failure::Timeout),
                Some(EOT) => {
                    port.write_all(&[ACK]).await?;
                    info!(bytes = data.len(), "xmodem receive complete");
                    return Ok(data);
                }
                Some(CAN) => return Err(TransferError::Cancelled),
                Some(byte) => match BlockSize::from_header(byte) {
                    Some(size) => self.read_block(port, size, expected).await?,
                    None => {
                        debug!(byte, "unexpected byte where a header belongs");
                        Err(Failure::Invalid)
                    }
                },
            };

            match outcome {
                Ok(block) => {
                    data.extend_from_slice(&block);
                    port.write_all(&[ACK]).await?;
                    expected = expected.wrapping_add(1);
                    failures = 0;
                    on_progress(Progress {
                        transferred: data.len() as u64,
                        total: None,
                    });
                }
                Err(failure) => {
                    failures += 1;
                    if failures >= self.config.max_retries {
                        warn!(block = expected, ?failure, "giving up on block");
                        return Err(match failure {
                            Failure::Timeout => TransferError::Timeout,
                            Failure::Invalid => TransferError::TooManyRetries { block: expected },
                        });
                    }
                    port.write_all(&[NAK]).await?;
                }
            }
        }
    }

    /// Send the start signal until the first header byte shows up.
    async fn start(&self, port: &dyn Port) -> Result<u8, TransferError> {
        let request = self.mode.request_byte();
        for attempt in 0..self.config.start_attempts {
            port.write_all(&[request]).await?;
            let deadline = Instant::now() + self.config.start_interval;
            loop {
                match read_byte(port, deadline).await? {
                    None => break,
                    Some(CAN) => return Err(TransferError::Cancelled),
                    Some(byte @ (SOH | STX | EOT)) => return Ok(byte),
                    Some(byte) => debug!(byte, attempt, "ignoring byte during start"),
                }
            }
        }
        Err(TransferError::Timeout)
    }

    /// Read the rest of a frame after its header and validate it.
    async fn read_block(
        &self,
        port: &dyn Port,
        size: BlockSize,
        expected: u8,
    ) -> Result<Result<Vec<u8>, Failure>, TransferError> {
        let mut body = vec![0u8; codec::body_len(size, self.mode)];
        let deadline = Instant::now() + self.config.response_timeout;
        let n = read_until(port, &mut body, deadline).await?;
        if n < body.len() {
            debug!(expected, got = n, "frame truncated");
            return Ok(Err(Failure::Timeout));
        }
        Ok(match codec::verify_frame(&body, size, expected, self.mode) {
            Ok(block) => Ok(block.to_vec()),
            Err(e) => {
                debug!(error = %e, "rejecting frame");
                Err(Failure::Invalid)
            }
        })
    }
}
