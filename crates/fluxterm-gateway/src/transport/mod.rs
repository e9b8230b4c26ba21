//! Byte-stream transports a session can bind.
//!
//! Two variants exist: a local serial device and a remote interactive shell.
//! Both live in a keyed [`Registry`] with take-over-on-open semantics, and a
//! session holds at most one of them at a time through a [`Binding`].

pub mod push;
pub mod registry;
pub mod remote_shell;
pub mod serial;

use std::fmt;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use push::{push_channel, PushError, PushReceiver, PushSender};
pub use registry::Registry;
pub use remote_shell::{RemoteShell, ShellCommand, ShellConnector, ShellIo, SshConnector};
pub use serial::{LineControl, SerialBackend, SerialPort, SerialStreams, SystemSerial};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Serial,
    RemoteShell,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Serial => write!(f, "serial"),
            TransportKind::RemoteShell => write!(f, "remote_shell"),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    /// Closed locally, taken over by another owner, or ended by the peer.
    #[error("transport closed")]
    Closed,
    #[error("failed to open {key}: {reason}")]
    Open { key: String, reason: String },
    #[error("remote shell: {0}")]
    Shell(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Capability set shared by every transport.
///
/// `read` returns `Ok(0)` when nothing arrived within the transport's short
/// poll interval; that is "no data yet", not end of stream. `close` is
/// idempotent, and every operation after it fails with
/// [`TransportError::Closed`].
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    fn kind(&self) -> TransportKind;
    /// Registry key: device path or owning session id.
    fn key(&self) -> &str;
    fn is_closed(&self) -> bool;
    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError>;
    async fn write(&self, data: &[u8]) -> Result<usize, TransportError>;
    async fn close(&self) -> Result<(), TransportError>;
}

/// The transport currently bound to a session.
#[derive(Clone)]
pub enum Binding {
    Serial(Arc<SerialPort>),
    RemoteShell(Arc<RemoteShell>),
}

impl Binding {
    pub fn transport(&self) -> &dyn Transport {
        match self {
            Binding::Serial(port) => port.as_ref(),
            Binding::RemoteShell(shell) => shell.as_ref(),
        }
    }

    /// Same underlying handle, not merely the same key.
    pub fn same(&self, other: &Binding) -> bool {
        match (self, other) {
            (Binding::Serial(a), Binding::Serial(b)) => Arc::ptr_eq(a, b),
            (Binding::RemoteShell(a), Binding::RemoteShell(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = self.transport();
        write!(f, "{}:{}", t.kind(), t.key())
    }
}
