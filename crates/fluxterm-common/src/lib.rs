//! Shared types for the FluxTerm terminal gateway.
//!
//! This crate contains:
//! - **Protocol messages**: the WebSocket envelope and every payload type
//!   exchanged between the browser client and a gateway session
//! - **Control requests**: closed, validated variants for each control action
//! - **Data models**: serial/remote-shell settings and device catalog entries
//! - **ID generation**: prefixed UUIDv7 session identifiers (`ses_`)

pub mod ids;
pub mod models;
pub mod protocol;
