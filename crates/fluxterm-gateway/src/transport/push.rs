//! Bounded channel carrying remote-shell output to its reader.
//!
//! The producer is a task owned by the transport and must never stall on a
//! session that stopped draining. A push waits at most `timeout` for room;
//! after that the chunk is dropped and counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PushError {
    #[error("push timed out; chunk dropped")]
    Dropped,
    #[error("receiver closed")]
    Closed,
}

#[derive(Clone)]
pub struct PushSender {
    tx: mpsc::Sender<Bytes>,
    timeout: Duration,
    dropped: Arc<AtomicU64>,
}

pub struct PushReceiver {
    rx: mpsc::Receiver<Bytes>,
    dropped: Arc<AtomicU64>,
}

pub fn push_channel(capacity: usize, timeout: Duration) -> (PushSender, PushReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        PushSender {
            tx,
            timeout,
            dropped: dropped.clone(),
        },
        PushReceiver { rx, dropped },
    )
}

impl PushSender {
    pub async fn push(&self, chunk: Bytes) -> Result<(), PushError> {
        if chunk.is_empty() {
            return Ok(());
        }
        match self.tx.send_timeout(chunk, self.timeout).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(chunk)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(bytes = chunk.len(), dropped = total, "output queue full, chunk dropped");
                Err(PushError::Dropped)
            }
            Err(SendTimeoutError::Closed(_)) => Err(PushError::Closed),
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl PushReceiver {
    /// `None` once every sender is gone and the queue is empty.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub(crate) fn drop_counter(&self) -> Arc<AtomicU64> {
        self.dropped.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn full_queue_drops_after_timeout() {
        let (tx, mut rx) = push_channel(1, Duration::from_millis(500));
        tx.push(Bytes::from_static(b"one")).await.unwrap();

        let started = tokio::time::Instant::now();
        assert_eq!(tx.push(Bytes::from_static(b"two")).await, Err(PushError::Dropped));
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert_eq!(tx.dropped(), 1);
        assert_eq!(rx.dropped(), 1);

        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"one"));
        tx.push(Bytes::from_static(b"three")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"three"));
    }

    #[tokio::test]
    async fn push_waits_for_room_within_timeout() {
        let (tx, mut rx) = push_channel(1, Duration::from_secs(5));
        tx.push(Bytes::from_static(b"a")).await.unwrap();

        let drain = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let first = rx.recv().await;
            let second = rx.recv().await;
            (first, second)
        });
        tx.push(Bytes::from_static(b"b")).await.unwrap();
        let (first, second) = drain.await.unwrap();
        assert_eq!(first.unwrap(), Bytes::from_static(b"a"));
        assert_eq!(second.unwrap(), Bytes::from_static(b"b"));
        assert_eq!(tx.dropped(), 0);
    }

    #[tokio::test]
    async fn empty_chunks_are_skipped_and_closed_is_reported() {
        let (tx, rx) = push_channel(1, Duration::from_millis(10));
        tx.push(Bytes::new()).await.unwrap();
        drop(rx);
        assert_eq!(tx.push(Bytes::from_static(b"x")).await, Err(PushError::Closed));
        assert_eq!(tx.dropped(), 0);
    }
}
