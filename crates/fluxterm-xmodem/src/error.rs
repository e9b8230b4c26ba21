use std::io;

use thiserror::Error;

/// Terminal outcome of a failed transfer. None of these are retried by the
/// engine beyond its own per-block budget.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("timed out waiting for the peer")]
    Timeout,
    #[error("transfer cancelled by peer")]
    Cancelled,
    #[error("too many retries on block {block}")]
    TooManyRetries { block: u8 },
    /// The port failed. Closing the underlying transport surfaces here,
    /// which is the only way to abort a transfer in flight.
    #[error("port error: {0}")]
    Io(#[from] io::Error),
}
