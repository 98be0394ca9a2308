//! WebSocket push of market events

mod handler;

pub use handler::{ws_handler, WsClientMessage, WsServerMessage};
