//! WebSocket server module
//!
//! Accepts terminal and notification clients and routes them to the session
//! registry and the activity monitor.

mod connection;
mod notifications;
mod output;
mod protocol;
mod websocket;

pub use connection::*;
pub use notifications::*;
pub use output::*;
pub use protocol::*;
pub use websocket::*;
