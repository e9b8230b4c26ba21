//! Keyed table of live transport handles.
//!
//! At most one live handle exists per key. Opening a key that is already
//! held closes and evicts the previous handle before the new one is opened,
//! so reconnecting never fails because of a stale owner.
//!
//! The table lock only guards map edits and is never held across transport
//! I/O. Opens of the same key are serialized by a per-key gate, so a slow
//! connect on one key never blocks another key.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{Transport, TransportError};

pub struct Registry<T: Transport> {
    entries: Mutex<HashMap<String, Arc<T>>>,
    /// Per-key open gates, dropped once no open is waiting on them.
    gates: DashMap<String, Arc<Mutex<()>>>,
}

impl<T: Transport> Default for Registry<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            gates: DashMap::new(),
        }
    }
}

impl<T: Transport> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open `key` with `open`, taking over from any current holder.
    ///
    /// Concurrent opens of one key are serialized, and the previous handle
    /// is always closed before the new one is opened.
    pub async fn open_with<F, Fut>(&self, key: &str, open: F) -> Result<Arc<T>, TransportError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let gate = self.gates.entry(key.to_owned()).or_default().clone();
        let result = {
            let _turn = gate.lock().await;
            self.take_over(key, open).await
        };
        drop(gate);
        self.gates.remove_if(key, |_, g| Arc::strong_count(g) == 1);
        result
    }

    async fn take_over<F, Fut>(&self, key: &str, open: F) -> Result<Arc<T>, TransportError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let previous = self.entries.lock().await.remove(key);
        if let Some(previous) = previous {
            warn!(key, kind = %previous.kind(), "taking over open transport");
            if let Err(e) = previous.close().await {
                debug!(key, error = %e, "error closing previous transport");
            }
        }
        let handle = Arc::new(open().await?);
        info!(key, kind = %handle.kind(), "transport opened");
        self.entries
            .lock()
            .await
            .insert(key.to_owned(), handle.clone());
        Ok(handle)
    }

    pub async fn get(&self, key: &str) -> Option<Arc<T>> {
        self.entries.lock().await.get(key).cloned()
    }

    /// Keys of every live handle, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Close and evict `key`. Returns `false` if nothing was open under it.
    pub async fn close(&self, key: &str) -> Result<bool, TransportError> {
        let removed = self.entries.lock().await.remove(key);
        match removed {
            Some(handle) => {
                handle.close().await?;
                info!(key, "transport closed");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Close `handle` and evict it, unless its key has since been taken
    /// over by a different handle.
    pub async fn release(&self, handle: &Arc<T>) -> Result<(), TransportError> {
        {
            let mut entries = self.entries.lock().await;
            if entries
                .get(handle.key())
                .is_some_and(|current| Arc::ptr_eq(current, handle))
            {
                entries.remove(handle.key());
            }
        }
        handle.close().await
    }

    pub async fn close_all(&self) {
        let drained: Vec<_> = self.entries.lock().await.drain().collect();
        for (key, handle) in drained {
            if let Err(e) = handle.close().await {
                debug!(key, error = %e, "error closing transport");
            }
        }
    }
}
