//! Real-time WebSocket layer: a reconnecting client, and a server that fans
//! messages out through a hub of rooms.

pub mod client;
pub mod config;
pub mod message;
pub mod server;
pub mod state;
pub mod utils;

pub use client::WsClient;
pub use config::{ClientConfig, RateLimitStrategy, ServerConfig};
pub use message::{Message, MessageType};
pub use server::{Hub, Room, RoomOptions, Server, ServerClient};
pub use state::{AuthInfo, ClientInfo, ConnectionState, MetricsSnapshot};
pub use utils::error::{Result, WebSocketError};
