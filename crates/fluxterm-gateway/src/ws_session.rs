//! WebSocket session endpoint.
//!
//! Endpoint: GET /ws
//!
//! Each connection gets a [`Session`] and three pumps:
//! 1. inbound: reads client frames under a renewable deadline and
//!    dispatches each envelope
//! 2. outbound: drains the session queue into the socket, pings when idle,
//!    and closes the socket gracefully when the session stops
//! 3. transport-reader: while a transport is bound, forwards its bytes to
//!    the client as `data` envelopes
//!
//! Whichever pump ends first tears the session down.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures::stream::{SplitSink, SplitStream, StreamExt};
use futures::SinkExt;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use fluxterm_common::protocol::{
    ControlError, ControlPayload, ControlRequest, DataPayload, Envelope, ErrorCode, LinkState,
    MessageType,
};

use crate::session::Session;
use crate::state::AppState;
use crate::transfer;
use crate::transport::{Binding, Transport, TransportError};

/// Pause after a non-fatal transport read error.
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Axum handler: checks the origin, then upgrades HTTP to WebSocket.
pub async fn handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(origin) = state.origin().check(&headers) {
        warn!(origin = %origin, "rejected websocket upgrade");
        return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }
    ws.on_upgrade(move |socket| run_session(state, socket))
}

/// Drive one client connection until it ends.
pub async fn run_session(state: AppState, socket: WebSocket) {
    let (session, outbound_rx) = Session::new(state.config().session.outbound_capacity);
    state.register(session.clone());
    info!(session_id = %session.id(), "session opened");

    session
        .send_status(LinkState::Ready, "WebSocket connection established")
        .await;

    let (ws_tx, ws_rx) = socket.split();
    let writer = tokio::spawn(outbound_pump(
        state.clone(),
        session.clone(),
        ws_tx,
        outbound_rx,
    ));

    inbound_pump(&state, &session, ws_rx).await;
    state.close_session(&session).await;
    let _ = writer.await;
}

// ── Pumps ───────────────────────────────────────────────────────────

async fn inbound_pump(state: &AppState, session: &Arc<Session>, mut ws_rx: SplitStream<WebSocket>) {
    let read_timeout = state.config().session.read_timeout();
    let mut stop = session.subscribe_stop();

    loop {
        let next = tokio::select! {
            _ = stop.changed() => break,
            next = timeout(read_timeout, ws_rx.next()) => next,
        };
        // Every frame, pongs included, renews the deadline.
        match next {
            Err(_) => {
                warn!(session_id = %session.id(), "client read deadline expired");
                break;
            }
            Ok(None) | Ok(Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Err(e))) => {
                debug!(session_id = %session.id(), error = %e, "client read failed");
                break;
            }
            Ok(Some(Ok(Message::Text(text)))) => dispatch(state, session, text.as_str()).await,
            Ok(Some(Ok(Message::Binary(bytes)))) => match std::str::from_utf8(&bytes) {
                Ok(text) => dispatch(state, session, text).await,
                Err(_) => {
                    session
                        .send_error(ErrorCode::InvalidMessage, "Binary frame is not UTF-8")
                        .await;
                }
            },
            Ok(Some(Ok(_))) => {} // Ping/Pong
        }
    }
}

async fn outbound_pump(
    state: AppState,
    session: Arc<Session>,
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<String>,
) {
    let cfg = &state.config().session;
    let write_timeout = cfg.write_timeout();
    let ping_interval = cfg.ping_interval();
    let mut stop = session.subscribe_stop();
    let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    let mut healthy = true;

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Some(text) => {
                    if !write(&mut ws_tx, Message::Text(text.into()), write_timeout).await {
                        healthy = false;
                        break;
                    }
                    ping.reset();
                }
                None => break,
            },
            _ = ping.tick() => {
                if !write(&mut ws_tx, Message::Ping(Default::default()), write_timeout).await {
                    healthy = false;
                    break;
                }
            }
            _ = stop.changed() => break,
        }
    }

    if healthy {
        // Flush what was queued before the stop, then close politely.
        while let Ok(text) = rx.try_recv() {
            if !write(&mut ws_tx, Message::Text(text.into()), write_timeout).await {
                healthy = false;
                break;
            }
        }
    }
    if healthy {
        let frame = CloseFrame {
            code: close_code::NORMAL,
            reason: "session closed".into(),
        };
        let _ = write(&mut ws_tx, Message::Close(Some(frame)), write_timeout).await;
    }
    let _ = timeout(write_timeout, ws_tx.close()).await;
    state.close_session(&session).await;
}

async fn write(ws_tx: &mut SplitSink<WebSocket, Message>, msg: Message, limit: Duration) -> bool {
    matches!(timeout(limit, ws_tx.send(msg)).await, Ok(Ok(())))
}

/// Forward bytes from `binding` to the client until the session stops or
/// the binding changes.
fn spawn_transport_reader(state: AppState, session: Arc<Session>, binding: Binding) {
    tokio::spawn(async move {
        let mut stop = session.subscribe_stop();
        let mut buf = vec![0u8; state.config().session.read_buffer_size.max(1)];

        while !session.is_stopped() && session.is_bound_to(&binding) {
            let result = tokio::select! {
                _ = stop.changed() => break,
                r = async {
                    let _lease = session.acquire_read_lease().await;
                    binding.transport().read(&mut buf).await
                } => r,
            };
            match result {
                Ok(0) => {}
                Ok(n) => {
                    if !session.send(Envelope::data(session.id(), &buf[..n])).await {
                        break;
                    }
                }
                Err(TransportError::Closed) => {
                    if session.unbind_if(&binding) {
                        state.release(&binding).await;
                        info!(session_id = %session.id(), transport = ?binding, "transport closed underneath session");
                        session
                            .send_status(LinkState::Disconnected, "Transport closed")
                            .await;
                    }
                    break;
                }
                Err(e) => {
                    debug!(session_id = %session.id(), error = %e, "transport read failed");
                    tokio::time::sleep(READ_ERROR_BACKOFF).await;
                }
            }
        }
        debug!(session_id = %session.id(), transport = ?binding, "transport reader stopped");
    });
}

// ── Dispatch ────────────────────────────────────────────────────────

/// Route one inbound frame by envelope type.
pub async fn dispatch(state: &AppState, session: &Arc<Session>, text: &str) {
    let envelope: Envelope = match serde_json::from_str(text) {
        Ok(env) => env,
        Err(e) => {
            debug!(session_id = %session.id(), error = %e, "malformed envelope");
            session
                .send_error(ErrorCode::InvalidMessage, format!("Invalid message format: {e}"))
                .await;
            return;
        }
    };

    match &envelope.msg_type {
        MessageType::Data => handle_data(session, &envelope).await,
        MessageType::Control => handle_control(state, session, &envelope).await,
        other => {
            session
                .send_error(
                    ErrorCode::UnknownType,
                    format!("Unknown message type: {}", other.as_str()),
                )
                .await;
        }
    }
}

async fn handle_data(session: &Arc<Session>, envelope: &Envelope) {
    let payload: DataPayload = match envelope.parse_payload() {
        Ok(p) => p,
        Err(e) => {
            session
                .send_error(ErrorCode::InvalidData, format!("Invalid data payload: {e}"))
                .await;
            return;
        }
    };
    let Some(binding) = session.binding() else {
        session
            .send_error(ErrorCode::NotConnected, "Not connected to any port")
            .await;
        return;
    };
    let bytes = match payload.decode() {
        Ok(b) => b,
        Err(e) => {
            session
                .send_error(ErrorCode::DecodeError, format!("Failed to decode data: {e}"))
                .await;
            return;
        }
    };
    if let Err(e) = binding.transport().write(&bytes).await {
        session
            .send_error(ErrorCode::WriteError, format!("Failed to write: {e}"))
            .await;
    }
}

async fn handle_control(state: &AppState, session: &Arc<Session>, envelope: &Envelope) {
    let payload: ControlPayload = match envelope.parse_payload() {
        Ok(p) => p,
        Err(e) => {
            session
                .send_error(ErrorCode::InvalidControl, format!("Invalid control payload: {e}"))
                .await;
            return;
        }
    };
    let request = match ControlRequest::from_payload(payload) {
        Ok(r) => r,
        Err(e @ ControlError::UnknownAction(_)) => {
            session.send_error(ErrorCode::UnknownAction, e.to_string()).await;
            return;
        }
        Err(e @ ControlError::InvalidParams { .. }) => {
            session.send_error(ErrorCode::InvalidParams, e.to_string()).await;
            return;
        }
    };
    debug!(session_id = %session.id(), action = request.action(), "control request");

    match request {
        ControlRequest::Connect(config) => match state.open_serial(config).await {
            Ok(port) => {
                bind(state, session, Binding::Serial(port)).await;
                session
                    .send_status(LinkState::Connected, "Port opened successfully")
                    .await;
            }
            Err(e) => {
                session
                    .send_error(ErrorCode::OpenFailed, format!("Failed to open port: {e}"))
                    .await;
            }
        },
        ControlRequest::ConnectRemote(config) => {
            match state.open_shell(session.id(), &config).await {
                Ok(shell) => {
                    bind(state, session, Binding::RemoteShell(shell)).await;
                    session
                        .send_status(LinkState::Connected, "SSH connected successfully")
                        .await;
                }
                Err(e) => {
                    session
                        .send_error(ErrorCode::SshConnectFailed, format!("Failed to connect: {e}"))
                        .await;
                }
            }
        }
        ControlRequest::Disconnect => {
            if let Some(binding) = session.unbind() {
                info!(session_id = %session.id(), transport = ?binding, "transport unbound");
                state.release(&binding).await;
            }
            session
                .send_status(LinkState::Disconnected, "Connection closed")
                .await;
        }
        ControlRequest::Resize(size) => {
            // Serial devices have no window size.
            if let Some(Binding::RemoteShell(shell)) = session.binding() {
                if let Err(e) = shell.resize(size.cols, size.rows).await {
                    session
                        .send_error(ErrorCode::ResizeFailed, format!("Failed to resize: {e}"))
                        .await;
                }
            }
        }
        ControlRequest::SendFile(params) => transfer::start_send(state, session, params).await,
        ControlRequest::ReceiveFile(params) => {
            transfer::start_receive(state, session, params).await
        }
    }
}

/// Bind a freshly opened transport, releasing whatever was bound before,
/// and start forwarding its output.
async fn bind(state: &AppState, session: &Arc<Session>, binding: Binding) {
    info!(session_id = %session.id(), transport = ?binding, "transport bound");
    if let Some(previous) = session.bind(binding.clone()) {
        if !previous.same(&binding) {
            state.release(&previous).await;
        }
    }
    spawn_transport_reader(state.clone(), session.clone(), binding);
}
