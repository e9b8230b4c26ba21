//! Serial device catalog and out-of-session port control.
//!
//! Port names travel in the path, so device paths must be percent-encoded
//! (`/dev/ttyUSB0` → `%2Fdev%2FttyUSB0`).

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use fluxterm_common::models::SerialConfig;

use super::ApiError;
use crate::state::AppState;
use crate::transport::{SerialPort, Transport};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_ports))
        .route("/open", get(list_open).post(open_port))
        .route("/{name}/close", post(close_port))
        .route("/{name}/status", get(port_status))
        .route("/{name}/dtr", post(set_dtr))
        .route("/{name}/rts", post(set_rts))
}

#[derive(Deserialize)]
struct LineLevel {
    value: bool,
}

async fn list_ports(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let backend = state.serial_backend();
    let ports = tokio::task::spawn_blocking(move || backend.list())
        .await
        .map_err(|e| ApiError::internal(e.to_string()))??;
    Ok(Json(json!({ "ports": ports })))
}

async fn list_open(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "ports": state.serial_ports().keys().await }))
}

async fn open_port(
    State(state): State<AppState>,
    body: Result<Json<SerialConfig>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(config) = body.map_err(|_| ApiError::bad_request("invalid configuration"))?;
    config.validate().map_err(ApiError::bad_request)?;
    let port = state.open_serial(config).await?;
    Ok(Json(json!({
        "message": "port opened successfully",
        "config": port.config(),
    })))
}

async fn close_port(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    if !state.serial_ports().close(&name).await? {
        return Err(ApiError::not_found("port not found"));
    }
    Ok(Json(json!({ "message": "port closed successfully" })))
}

async fn port_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let port = find(&state, &name).await?;
    Ok(Json(json!({
        "name": name,
        "open": !port.is_closed(),
        "config": port.config(),
    })))
}

async fn set_dtr(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Result<Json<LineLevel>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(level) = body.map_err(|_| ApiError::bad_request("invalid request"))?;
    find(&state, &name).await?.set_dtr(level.value)?;
    Ok(Json(json!({ "message": "DTR set successfully" })))
}

async fn set_rts(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Result<Json<LineLevel>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(level) = body.map_err(|_| ApiError::bad_request("invalid request"))?;
    find(&state, &name).await?.set_rts(level.value)?;
    Ok(Json(json!({ "message": "RTS set successfully" })))
}

async fn find(state: &AppState, name: &str) -> Result<Arc<SerialPort>, ApiError> {
    state
        .serial_ports()
        .get(name)
        .await
        .ok_or_else(|| ApiError::not_found("port not found"))
}
