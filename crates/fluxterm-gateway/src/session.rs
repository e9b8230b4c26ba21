//! Per-client session state.
//!
//! A session owns the outbound queue feeding its WebSocket writer, a
//! single-shot stop signal observed by every pump, and at most one bound
//! transport. Teardown is driven by [`AppState::close_session`] and happens
//! exactly once.
//!
//! [`AppState::close_session`]: crate::state::AppState::close_session

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use fluxterm_common::ids;
use fluxterm_common::protocol::{Envelope, ErrorCode, FileTransferPayload, LinkState};
use tokio::sync::{mpsc, watch, OwnedMutexGuard};

use crate::transport::Binding;

pub struct Session {
    id: String,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    stop: watch::Sender<bool>,
    torn_down: AtomicBool,
    binding: Mutex<Option<Binding>>,
    /// Held by whoever may consume bytes from the bound transport: the
    /// transport-reader between reads, a file transfer for its duration.
    read_lease: Arc<tokio::sync::Mutex<()>>,
    transfer_active: AtomicBool,
}

impl Session {
    /// Create a session and the receiving end of its outbound queue.
    pub fn new(outbound_capacity: usize) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(outbound_capacity.max(1));
        let (stop, _) = watch::channel(false);
        let session = Arc::new(Self {
            id: ids::session_id(),
            outbound: Mutex::new(Some(tx)),
            stop,
            torn_down: AtomicBool::new(false),
            binding: Mutex::new(None),
            read_lease: Arc::new(tokio::sync::Mutex::new(())),
            transfer_active: AtomicBool::new(false),
        });
        (session, rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    // ── Outbound ────────────────────────────────────────────────────

    fn sender(&self) -> Option<mpsc::Sender<String>> {
        lock(&self.outbound).clone()
    }

    /// Queue an envelope, waiting for room. Returns `false` once the
    /// session is stopping or the queue is closed.
    pub async fn send(&self, envelope: Envelope) -> bool {
        let Some(tx) = self.sender() else {
            return false;
        };
        let Ok(text) = serde_json::to_string(&envelope) else {
            return false;
        };
        let mut stop = self.stop.subscribe();
        if *stop.borrow() {
            return false;
        }
        tokio::select! {
            sent = tx.send(text) => sent.is_ok(),
            _ = stop.changed() => false,
        }
    }

    /// Queue an envelope only if there is room right now.
    pub fn try_send(&self, envelope: Envelope) -> bool {
        let Some(tx) = self.sender() else {
            return false;
        };
        match serde_json::to_string(&envelope) {
            Ok(text) => tx.try_send(text).is_ok(),
            Err(_) => false,
        }
    }

    pub async fn send_status(&self, state: LinkState, message: &str) -> bool {
        self.send(Envelope::status(&self.id, state, message)).await
    }

    pub async fn send_error(&self, code: ErrorCode, message: impl Into<String>) -> bool {
        self.send(Envelope::error(&self.id, code, message)).await
    }

    pub async fn send_transfer(&self, payload: FileTransferPayload) -> bool {
        self.send(Envelope::file_transfer(&self.id, payload)).await
    }

    // ── Binding ─────────────────────────────────────────────────────

    /// Bind `binding`, returning whatever was bound before.
    pub fn bind(&self, binding: Binding) -> Option<Binding> {
        lock(&self.binding).replace(binding)
    }

    pub fn unbind(&self) -> Option<Binding> {
        lock(&self.binding).take()
    }

    /// Unbind only if `binding` is still the bound handle.
    pub fn unbind_if(&self, binding: &Binding) -> bool {
        let mut slot = lock(&self.binding);
        if slot.as_ref().is_some_and(|b| b.same(binding)) {
            slot.take();
            true
        } else {
            false
        }
    }

    pub fn binding(&self) -> Option<Binding> {
        lock(&self.binding).clone()
    }

    pub fn is_bound_to(&self, binding: &Binding) -> bool {
        lock(&self.binding).as_ref().is_some_and(|b| b.same(binding))
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    pub fn subscribe_stop(&self) -> watch::Receiver<bool> {
        self.stop.subscribe()
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop.borrow()
    }

    /// Mark the session as torn down and fire the stop signal. Only the
    /// first caller gets `true`.
    pub(crate) fn begin_teardown(&self) -> bool {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.stop.send_replace(true);
        true
    }

    /// Drop the queue's sender so the outbound pump sees it close once
    /// drained.
    pub(crate) fn close_outbound(&self) {
        lock(&self.outbound).take();
    }

    // ── Transfers ───────────────────────────────────────────────────

    pub async fn acquire_read_lease(&self) -> OwnedMutexGuard<()> {
        self.read_lease.clone().lock_owned().await
    }

    /// Claim the session's single transfer slot.
    pub fn begin_transfer(self: &Arc<Self>) -> Option<TransferSlot> {
        self.transfer_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| TransferSlot {
                session: self.clone(),
            })
    }

    pub fn transfer_active(&self) -> bool {
        self.transfer_active.load(Ordering::Acquire)
    }
}

/// Releases the session's transfer slot on drop.
pub struct TransferSlot {
    session: Arc<Session>,
}

impl Drop for TransferSlot {
    fn drop(&mut self) {
        self.session.transfer_active.store(false, Ordering::Release);
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_stops_after_teardown() {
        let (session, mut rx) = Session::new(4);
        assert!(session.send_status(LinkState::Ready, "hi").await);
        let text = rx.recv().await.unwrap();
        assert!(text.contains("\"ready\""));

        assert!(session.begin_teardown());
        assert!(!session.begin_teardown(), "teardown fires once");
        assert!(session.is_stopped());
        assert!(!session.send_status(LinkState::Ready, "late").await);
    }

    #[tokio::test]
    async fn blocked_send_is_released_by_stop() {
        let (session, _rx) = Session::new(1);
        assert!(session.try_send(Envelope::data(session.id(), b"a")));
        assert!(!session.try_send(Envelope::data(session.id(), b"b")));

        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.send(Envelope::data(session.id(), b"c")).await })
        };
        tokio::task::yield_now().await;
        session.begin_teardown();
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn closing_outbound_ends_the_queue() {
        let (session, mut rx) = Session::new(4);
        session.try_send(Envelope::data(session.id(), b"x"));
        session.close_outbound();
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
        assert!(!session.try_send(Envelope::data(session.id(), b"y")));
    }

    #[test]
    fn transfer_slot_is_exclusive() {
        let (session, _rx) = Session::new(1);
        let slot = session.begin_transfer().unwrap();
        assert!(session.transfer_active());
        assert!(session.begin_transfer().is_none());
        drop(slot);
        assert!(!session.transfer_active());
        assert!(session.begin_transfer().is_some());
    }

    #[test]
    fn ids_are_session_prefixed() {
        let (a, _) = Session::new(1);
        let (b, _) = Session::new(1);
        assert!(a.id().starts_with("ses_"));
        assert_ne!(a.id(), b.id());
    }
}
