//! The byte-stream seam the engine runs over.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio::time::{timeout_at, Instant};

/// Pause after a read that produced nothing before polling again.
const IDLE_POLL: Duration = Duration::from_millis(10);

/// A bidirectional byte stream a transfer can run over.
///
/// `read` may return `Ok(0)` to mean "nothing arrived within the poll
/// interval"; the engine keeps waiting until its own deadline. Any error is
/// fatal to the transfer.
#[async_trait]
pub trait Port: Send + Sync {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize>;
    async fn write_all(&self, data: &[u8]) -> io::Result<()>;
}

/// Adapts any `AsyncRead + AsyncWrite` stream. End of stream is reported as
/// an `UnexpectedEof` error, since an XMODEM peer never closes mid-transfer.
pub struct StreamPort<S> {
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
}

impl<S: AsyncRead + AsyncWrite> StreamPort<S> {
    pub fn new(stream: S) -> Self {
        let (r, w) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(r),
            writer: Mutex::new(w),
        }
    }
}

#[async_trait]
impl<S> Port for StreamPort<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.reader.lock().await.read(buf).await?;
        if n == 0 && !buf.is_empty() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "stream closed"));
        }
        Ok(n)
    }

    async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        let mut w = self.writer.lock().await;
        w.write_all(data).await?;
        w.flush().await
    }
}

/// Read one byte before `deadline`. `Ok(None)` means the deadline passed.
pub(crate) async fn read_byte(port: &dyn Port, deadline: Instant) -> io::Result<Option<u8>> {
    let mut byte = [0u8; 1];
    Ok(match read_until(port, &mut byte, deadline).await? {
        1 => Some(byte[0]),
        _ => None,
    })
}

/// Fill `buf` before `deadline`, returning how many bytes arrived.
pub(crate) async fn read_until(
    port: &dyn Port,
    buf: &mut [u8],
    deadline: Instant,
) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match timeout_at(deadline, port.read(&mut buf[filled..])).await {
            Ok(Ok(0)) => {
                if Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep(IDLE_POLL.min(deadline.saturating_duration_since(Instant::now())))
                    .await;
            }
            Ok(Ok(n)) => filled += n,
            Ok(Err(e)) => return Err(e),
            Err(_) => break,
        }
    }
    Ok(filled)
}
