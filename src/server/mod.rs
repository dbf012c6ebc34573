//! WebSocket server module
//!
//! Accepts terminal clients and routes their messages to the session registry.

mod protocol;
mod websocket;

pub use websocket::*;
