//! FluxTerm gateway library.
//!
//! Re-exports the router, shared state, sessions and transports so they can
//! be used by integration tests and embedded in other binaries.

pub mod api;
pub mod config;
pub mod origin;
pub mod session;
pub mod state;
pub mod transfer;
pub mod transport;
pub mod ws_session;

use axum::routing::get;
use axum::Router;

use crate::state::AppState;

/// Routes served by the gateway, with CORS from the origin policy but
/// without static files or tracing.
pub fn app(state: AppState) -> Router {
    let cors = state.origin().cors_layer();
    Router::new()
        .route("/health", get(api::health))
        .route("/ws", get(ws_session::handler))
        .nest("/api", api::router())
        .with_state(state)
        .layer(cors)
}
