//! File transfers over the session's bound transport.
//!
//! A transfer runs in its own task so the session keeps serving other
//! envelopes. It holds the session's read lease for its whole duration, so
//! the transport-reader never swallows protocol bytes. There is no cancel
//! path: a transfer ends when the protocol does, or when the transport is
//! closed under it and the next port operation fails.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use fluxterm_common::protocol::{
    Envelope, ErrorCode, FileTransferPayload, ReceiveFileParams, SendFileParams, TransferAction,
};
use fluxterm_xmodem::{BlockSize, Checksum, Port, Progress, Receiver, Sender};
use tracing::{info, warn};

use crate::session::{Session, TransferSlot};
use crate::state::AppState;
use crate::transport::{Binding, TransportError};

/// Presents a bound transport as an engine [`Port`].
pub struct TransportPort {
    binding: Binding,
}

impl TransportPort {
    pub fn new(binding: Binding) -> Self {
        Self { binding }
    }
}

fn to_io(e: TransportError) -> io::Error {
    match e {
        TransportError::Io(e) => e,
        TransportError::Closed => io::Error::new(io::ErrorKind::BrokenPipe, "transport closed"),
        other => io::Error::other(other.to_string()),
    }
}

#[async_trait]
impl Port for TransportPort {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.binding.transport().read(buf).await.map_err(to_io)
    }

    async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let mut rest = data;
        while !rest.is_empty() {
            let n = self.binding.transport().write(rest).await.map_err(to_io)?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            rest = &rest[n..];
        }
        Ok(())
    }
}

/// Common preconditions. Returns the binding and the claimed slot.
async fn prepare(session: &Arc<Session>) -> Option<(Binding, TransferSlot)> {
    let Some(binding) = session.binding() else {
        session
            .send_error(ErrorCode::NotConnected, "Not connected to any port")
            .await;
        return None;
    };
    let Some(slot) = session.begin_transfer() else {
        session
            .send_error(ErrorCode::TransferInProgress, "A file transfer is already running")
            .await;
        return None;
    };
    Some((binding, slot))
}

pub async fn start_send(state: &AppState, session: &Arc<Session>, params: SendFileParams) {
    let data = match params.decode_data() {
        Ok(d) => d,
        Err(e) => {
            session
                .send_error(ErrorCode::DecodeError, format!("Failed to decode file data: {e}"))
                .await;
            return;
        }
    };
    let Some((binding, slot)) = prepare(session).await else {
        return;
    };

    let block_size = if params.uses_1k_blocks() {
        BlockSize::Extended
    } else {
        BlockSize::Standard
    };
    let sender = Sender::new(state.config().transfer.engine_config()).with_block_size(block_size);
    let file_name = params.file_name;
    let total = data.len() as u64;

    let mut start = FileTransferPayload::new(TransferAction::Start, &file_name);
    start.file_size = total;
    start.message = "Starting file transfer...".into();
    session.send_transfer(start).await;

    let session = session.clone();
    tokio::spawn(async move {
        let _slot = slot;
        let _lease = session.acquire_read_lease().await;
        info!(session_id = %session.id(), file = %file_name, bytes = total, "file send started");

        let port = TransportPort::new(binding);
        let progress_session = session.clone();
        let progress_name = file_name.clone();
        let result = sender
            .send(&port, &data, move |p: Progress| {
                let mut ev = FileTransferPayload::new(TransferAction::Progress, &progress_name);
                ev.sent = p.transferred;
                ev.file_size = p.total.unwrap_or(total);
                progress_session.try_send(Envelope::file_transfer(progress_session.id(), ev));
            })
            .await;

        let payload = match result {
            Ok(summary) => {
                info!(
                    session_id = %session.id(),
                    file = %file_name,
                    blocks = summary.blocks,
                    retransmissions = summary.retransmissions,
                    "file send complete"
                );
                let mut ev = FileTransferPayload::new(TransferAction::Complete, &file_name);
                ev.file_size = total;
                ev.sent = summary.bytes;
                ev.message = "File transfer completed successfully".into();
                ev
            }
            Err(e) => {
                warn!(session_id = %session.id(), file = %file_name, error = %e, "file send failed");
                let mut ev = FileTransferPayload::new(TransferAction::Error, &file_name);
                ev.error = e.to_string();
                ev
            }
        };
        session.send(Envelope::file_transfer(session.id(), payload)).await;
    });
}

pub async fn start_receive(state: &AppState, session: &Arc<Session>, params: ReceiveFileParams) {
    let Some((binding, slot)) = prepare(session).await else {
        return;
    };
    let mode = if params.use_crc() {
        Checksum::Crc16
    } else {
        Checksum::Sum8
    };
    let receiver = Receiver::new(state.config().transfer.engine_config(), mode);
    let file_name = params.file_name;

    let mut start = FileTransferPayload::new(TransferAction::Start, &file_name);
    start.message = "Starting file receive...".into();
    session.send_transfer(start).await;

    let session = session.clone();
    tokio::spawn(async move {
        let _slot = slot;
        let _lease = session.acquire_read_lease().await;
        info!(session_id = %session.id(), file = %file_name, ?mode, "file receive started");

        let port = TransportPort::new(binding);
        let progress_session = session.clone();
        let progress_name = file_name.clone();
        let result = receiver
            .receive(&port, move |p: Progress| {
                let mut ev = FileTransferPayload::new(TransferAction::Progress, &progress_name);
                ev.received = p.transferred;
                progress_session.try_send(Envelope::file_transfer(progress_session.id(), ev));
            })
            .await;

        let payload = match result {
            Ok(data) => {
                info!(session_id = %session.id(), file = %file_name, bytes = data.len(), "file receive complete");
                let mut ev = FileTransferPayload::new(TransferAction::Complete, &file_name);
                ev.file_size = data.len() as u64;
                ev.received = data.len() as u64;
                ev.message = BASE64.encode(&data);
                ev
            }
            Err(e) => {
                warn!(session_id = %session.id(), file = %file_name, error = %e, "file receive failed");
                let mut ev = FileTransferPayload::new(TransferAction::Error, &file_name);
                ev.error = e.to_string();
                ev
            }
        };
        session.send(Envelope::file_transfer(session.id(), payload)).await;
    });
}
