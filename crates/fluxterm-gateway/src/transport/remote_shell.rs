//! Remote interactive shell transport.
//!
//! A background task owned by the transport drives the remote channel. It
//! forwards writes and window changes from [`ShellCommand`]s and pushes
//! every output chunk into a bounded [`push_channel`]; `Transport::read`
//! drains that channel. The task ends on remote EOF, on `close`, or when the
//! transport is dropped, and the next read then reports `Closed`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use fluxterm_common::models::{AuthMethod, RemoteConfig};
use russh::client::{self, KeyboardInteractiveAuthResponse};
use russh::{ChannelMsg, Disconnect, Pty};
use russh_keys::key;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, warn};

use super::push::{push_channel, PushReceiver, PushSender};
use super::{Transport, TransportError, TransportKind};
use crate::config::TransportSettings;

/// Requests from the transport to its channel task.
pub enum ShellCommand {
    Data(Vec<u8>, oneshot::Sender<Result<(), String>>),
    Resize {
        cols: u32,
        rows: u32,
        reply: oneshot::Sender<Result<(), String>>,
    },
}

/// The channel task's side of a [`RemoteShell`].
pub struct ShellIo {
    pub commands: mpsc::Receiver<ShellCommand>,
    pub output: PushSender,
    /// Flips to `true` when the transport is closed.
    pub shutdown: watch::Receiver<bool>,
}

pub struct RemoteShell {
    key: String,
    read_timeout: Duration,
    commands: mpsc::Sender<ShellCommand>,
    output: Mutex<PushReceiver>,
    pending: Mutex<Bytes>,
    shutdown: watch::Sender<bool>,
    dropped: Arc<AtomicU64>,
    closed: AtomicBool,
}

impl RemoteShell {
    /// Create the transport half and the task half of a shell.
    pub fn new(key: impl Into<String>, settings: &TransportSettings) -> (Self, ShellIo) {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let (out_tx, out_rx) = push_channel(settings.push_capacity, settings.push_timeout());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shell = Self {
            key: key.into(),
            read_timeout: settings.read_timeout(),
            commands: cmd_tx,
            dropped: out_rx.drop_counter(),
            output: Mutex::new(out_rx),
            pending: Mutex::new(Bytes::new()),
            shutdown: shutdown_tx,
            closed: AtomicBool::new(false),
        };
        let io = ShellIo {
            commands: cmd_rx,
            output: out_tx,
            shutdown: shutdown_rx,
        };
        (shell, io)
    }

    pub async fn resize(&self, cols: u32, rows: u32) -> Result<(), TransportError> {
        let (reply, rx) = oneshot::channel();
        self.request(ShellCommand::Resize { cols, rows, reply }, rx).await
    }

    /// Output chunks dropped because the session stopped draining.
    pub fn dropped_chunks(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    async fn request(
        &self,
        cmd: ShellCommand,
        rx: oneshot::Receiver<Result<(), String>>,
    ) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.commands
            .send(cmd)
            .await
            .map_err(|_| TransportError::Closed)?;
        rx.await
            .map_err(|_| TransportError::Closed)?
            .map_err(TransportError::Shell)
    }
}

#[async_trait]
impl Transport for RemoteShell {
    fn kind(&self) -> TransportKind {
        TransportKind::RemoteShell
    }

    fn key(&self) -> &str {
        &self.key
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut pending = self.pending.lock().await;
        if pending.is_empty() {
            let mut output = self.output.lock().await;
            match tokio::time::timeout(self.read_timeout, output.recv()).await {
                Err(_) => return Ok(0),
                Ok(None) => return Err(TransportError::Closed),
                Ok(Some(chunk)) => *pending = chunk,
            }
        }
        let n = pending.len().min(buf.len());
        buf[..n].copy_from_slice(&pending.split_to(n));
        Ok(n)
    }

    async fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        let (reply, rx) = oneshot::channel();
        self.request(ShellCommand::Data(data.to_vec(), reply), rx).await?;
        Ok(data.len())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.shutdown.send_replace(true);
        debug!(key = %self.key, "remote shell closed");
        Ok(())
    }
}

/// Opens remote shells.
#[async_trait]
pub trait ShellConnector: Send + Sync + 'static {
    async fn connect(
        &self,
        key: &str,
        config: &RemoteConfig,
        settings: &TransportSettings,
    ) -> Result<RemoteShell, TransportError>;
}

// ── SSH ─────────────────────────────────────────────────────────────

/// SSH with a pseudo-terminal through `russh`.
pub struct SshConnector;

struct AcceptAnyHost;

#[async_trait]
impl client::Handler for AcceptAnyHost {
    type Error = russh::Error;

    // Host keys are not verified.
    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

fn shell_err(e: impl std::fmt::Display) -> TransportError {
    TransportError::Shell(e.to_string())
}

#[async_trait]
impl ShellConnector for SshConnector {
    async fn connect(
        &self,
        key: &str,
        config: &RemoteConfig,
        settings: &TransportSettings,
    ) -> Result<RemoteShell, TransportError> {
        let connect_timeout = Duration::from_secs(config.connect_timeout_secs.max(1));
        let ssh_config = Arc::new(client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(Duration::from_secs(30)),
            ..Default::default()
        });

        warn!(host = %config.host, "host key verification is disabled");
        let mut session = tokio::time::timeout(
            connect_timeout,
            client::connect(ssh_config, (config.host.as_str(), config.port), AcceptAnyHost),
        )
        .await
        .map_err(|_| shell_err(format!("connection to {}:{} timed out", config.host, config.port)))?
        .map_err(shell_err)?;

        if !authenticate(&mut session, config).await? {
            return Err(shell_err(format!(
                "{} authentication failed for {}",
                config.auth_method, config.username
            )));
        }

        let channel = session.channel_open_session().await.map_err(shell_err)?;
        channel
            .request_pty(
                false,
                &config.terminal_type,
                config.cols,
                config.rows,
                0,
                0,
                &[
                    (Pty::ECHO, 1),
                    (Pty::TTY_OP_ISPEED, 14400),
                    (Pty::TTY_OP_OSPEED, 14400),
                ],
            )
            .await
            .map_err(shell_err)?;
        channel.request_shell(true).await.map_err(shell_err)?;

        info!(
            key,
            host = %config.host,
            port = config.port,
            user = %config.username,
            "remote shell connected"
        );

        let (shell, io) = RemoteShell::new(key, settings);
        tokio::spawn(drive_channel(session, channel, io));
        Ok(shell)
    }
}

async fn authenticate(
    session: &mut client::Handle<AcceptAnyHost>,
    config: &RemoteConfig,
) -> Result<bool, TransportError> {
    let user = config.username.as_str();
    match config.auth_method {
        AuthMethod::Password => {
            let password = config.password.clone().unwrap_or_default();
            session
                .authenticate_password(user, password)
                .await
                .map_err(shell_err)
        }
        AuthMethod::PublicKey => {
            let passphrase = config.passphrase.as_deref();
            let key_pair = if let Some(path) = &config.private_key_path {
                russh_keys::load_secret_key(path, passphrase).map_err(shell_err)?
            } else if let Some(pem) = &config.private_key {
                russh_keys::decode_secret_key(pem, passphrase).map_err(shell_err)?
            } else {
                return Err(shell_err("publickey auth needs private_key or private_key_path"));
            };
            session
                .authenticate_publickey(user, Arc::new(key_pair))
                .await
                .map_err(shell_err)
        }
        AuthMethod::KeyboardInteractive => {
            let password = config.password.clone().unwrap_or_default();
            let mut response = session
                .authenticate_keyboard_interactive_start(user, None::<String>)
                .await
                .map_err(shell_err)?;
            // Every prompt gets the password; bounded in case the server loops.
            for _ in 0..8 {
                match response {
                    KeyboardInteractiveAuthResponse::Success => return Ok(true),
                    KeyboardInteractiveAuthResponse::Failure => return Ok(false),
                    KeyboardInteractiveAuthResponse::InfoRequest { prompts, .. } => {
                        let answers = prompts.iter().map(|_| password.clone()).collect();
                        response = session
                            .authenticate_keyboard_interactive_respond(answers)
                            .await
                            .map_err(shell_err)?;
                    }
                }
            }
            Ok(false)
        }
    }
}

async fn drive_channel(
    session: client::Handle<AcceptAnyHost>,
    mut channel: russh::Channel<client::Msg>,
    mut io: ShellIo,
) {
    loop {
        tokio::select! {
            changed = io.shutdown.changed() => {
                if changed.is_err() || *io.shutdown.borrow() {
                    break;
                }
            }
            cmd = io.commands.recv() => match cmd {
                None => break,
                Some(ShellCommand::Data(bytes, reply)) => {
                    let result = channel.data(&bytes[..]).await.map_err(|e| e.to_string());
                    let _ = reply.send(result);
                }
                Some(ShellCommand::Resize { cols, rows, reply }) => {
                    let result = channel
                        .window_change(cols, rows, 0, 0)
                        .await
                        .map_err(|e| e.to_string());
                    let _ = reply.send(result);
                }
            },
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) | Some(ChannelMsg::ExtendedData { data, .. }) => {
                    if let Err(super::PushError::Closed) =
                        io.output.push(Bytes::copy_from_slice(&data)).await
                    {
                        break;
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    debug!(exit_status, "remote shell exited");
                }
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            },
        }
    }

    let _ = channel.close().await;
    let _ = session
        .disconnect(Disconnect::ByApplication, "", "English")
        .await;
    debug!("remote shell channel task finished");
}
