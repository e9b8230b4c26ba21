//! Shared application state: the session hub.

use std::sync::Arc;

use dashmap::DashMap;
use fluxterm_common::models::{RemoteConfig, SerialConfig};
use tracing::{debug, info};

use crate::config::GatewayConfig;
use crate::origin::OriginPolicy;
use crate::session::Session;
use crate::transport::{
    Binding, Registry, RemoteShell, SerialBackend, SerialPort, ShellConnector, SshConnector,
    SystemSerial, Transport, TransportError,
};

/// State shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<Inner>,
}

struct Inner {
    config: GatewayConfig,
    origin: OriginPolicy,
    /// Live sessions, keyed by session id.
    sessions: DashMap<String, Arc<Session>>,
    /// Open serial devices, keyed by device path.
    serial_ports: Registry<SerialPort>,
    /// Open remote shells, keyed by owning session id.
    shells: Registry<RemoteShell>,
    serial_backend: Arc<dyn SerialBackend>,
    shell_connector: Arc<dyn ShellConnector>,
}

impl AppState {
    pub fn new(
        config: GatewayConfig,
        origin: OriginPolicy,
        serial_backend: Arc<dyn SerialBackend>,
        shell_connector: Arc<dyn ShellConnector>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                origin,
                sessions: DashMap::new(),
                serial_ports: Registry::new(),
                shells: Registry::new(),
                serial_backend,
                shell_connector,
            }),
        }
    }

    /// Real serial devices and SSH.
    pub fn with_system_backends(config: GatewayConfig, origin: OriginPolicy) -> Self {
        Self::new(config, origin, Arc::new(SystemSerial), Arc::new(SshConnector))
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub fn origin(&self) -> &OriginPolicy {
        &self.inner.origin
    }

    pub fn serial_ports(&self) -> &Registry<SerialPort> {
        &self.inner.serial_ports
    }

    pub fn shells(&self) -> &Registry<RemoteShell> {
        &self.inner.shells
    }

    pub fn serial_backend(&self) -> Arc<dyn SerialBackend> {
        self.inner.serial_backend.clone()
    }

    // ── Sessions ────────────────────────────────────────────────────

    pub fn register(&self, session: Arc<Session>) {
        self.inner.sessions.insert(session.id().to_owned(), session);
    }

    pub fn deregister(&self, id: &str) {
        self.inner.sessions.remove(id);
    }

    pub fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.sessions.get(id).map(|s| s.value().clone())
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Tear a session down: stop its pumps, release its transport, forget
    /// it, and close its outbound queue. Safe to call from any pump; only
    /// the first call does anything.
    pub async fn close_session(&self, session: &Arc<Session>) {
        if !session.begin_teardown() {
            return;
        }
        if let Some(binding) = session.unbind() {
            self.release(&binding).await;
        }
        self.deregister(session.id());
        session.close_outbound();
        info!(session_id = %session.id(), "session closed");
    }

    /// Stop every session and close every transport.
    pub async fn shutdown(&self) {
        let sessions: Vec<_> = self
            .inner
            .sessions
            .iter()
            .map(|s| s.value().clone())
            .collect();
        for session in sessions {
            self.close_session(&session).await;
        }
        self.inner.serial_ports.close_all().await;
        self.inner.shells.close_all().await;
    }

    // ── Transports ──────────────────────────────────────────────────

    /// Open (or take over) the serial device named in `config`.
    pub async fn open_serial(&self, config: SerialConfig) -> Result<Arc<SerialPort>, TransportError> {
        let backend = self.inner.serial_backend.clone();
        let key = config.port.clone();
        self.inner
            .serial_ports
            .open_with(&key, || async move { SerialPort::open(backend.as_ref(), config).await })
            .await
    }

    /// Open a remote shell owned by `session_id`, replacing any it had.
    pub async fn open_shell(
        &self,
        session_id: &str,
        config: &RemoteConfig,
    ) -> Result<Arc<RemoteShell>, TransportError> {
        let connector = self.inner.shell_connector.clone();
        let settings = &self.inner.config.transport;
        self.inner
            .shells
            .open_with(session_id, || async move {
                connector.connect(session_id, config, settings).await
            })
            .await
    }

    /// Close a bound transport and evict it from its registry if the
    /// registry still holds that same handle.
    pub async fn release(&self, binding: &Binding) {
        let result = match binding {
            Binding::Serial(port) => self.inner.serial_ports.release(port).await,
            Binding::RemoteShell(shell) => self.inner.shells.release(shell).await,
        };
        if let Err(e) = result {
            debug!(transport = ?binding, error = %e, "error releasing transport");
        }
        debug!(
            kind = %binding.transport().kind(),
            key = binding.transport().key(),
            "transport released"
        );
    }
}
