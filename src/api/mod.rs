//! Web API module for Social Markets
//!
//! REST endpoints for markets, predictions, proposals and account linking,
//! plus a WebSocket feed of market events.

pub mod routes;
pub mod server;
pub mod ws;

pub use server::{create_app, AppState};
