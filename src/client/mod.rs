//! Connecting side: a reconnecting WebSocket client.

pub mod connection;
pub mod proxy;

pub use connection::{reconnect_delay, AuthCallback, WsClient};
