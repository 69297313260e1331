use thiserror::Error;

/// Represents the errors produced by the client, the server and the hub.
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// Represents a general connection error.
    ///
    /// Dial or upgrade failures end up here, as do transports closed mid-operation.
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// The configured URL could not be parsed or uses an unsupported scheme.
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Indicates that authentication has failed.
    ///
    /// This can happen if the provided credentials or authentication token is invalid.
    #[error("Authentication failed: {0}")]
    AuthenticationError(String),

    /// The client is not authorized to perform a specific action.
    ///
    /// Raised by room admission when auth is required or the role check fails.
    #[error("unauthorized")]
    Unauthorized,

    /// The connection is not in the `Connected` state.
    #[error("not connected")]
    NotConnected,

    /// `connect` was called while a connection attempt or connection was active.
    #[error("already connecting/connected")]
    AlreadyConnected,

    /// The client was closed explicitly and will not connect again.
    #[error("client closed")]
    ClientClosed,

    /// Indicates that the client has exceeded the allowed request rate.
    #[error("rate limit exceeded")]
    RateLimitExceeded,

    /// Payload is larger than the configured maximum.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// The per-connection send queue has no free capacity.
    #[error("queue full")]
    QueueFull,

    /// No pong arrived within the configured timeout.
    #[error("heartbeat timeout")]
    HeartbeatTimeout,

    /// A read or write did not complete within its deadline.
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// The room has reached its member limit.
    #[error("room full")]
    RoomFull,

    /// The named room does not exist.
    #[error("room not found: {0}")]
    RoomNotFound(String),

    /// A room with this name already exists.
    #[error("room already exists: {0}")]
    RoomExists(String),

    /// The room was closed and no longer accepts members.
    #[error("room closed")]
    RoomClosed,

    /// The client id is unknown to the hub.
    #[error("client not found: {0}")]
    ClientNotFound(String),

    /// A client with the same id is already registered.
    #[error("client already registered: {0}")]
    DuplicateClient(String),

    /// The room name is empty, too long or contains control characters.
    #[error("invalid room name: {0}")]
    InvalidRoomName(String),

    /// The hub dispatch loop is not running.
    #[error("hub is not running")]
    HubNotRunning,

    /// Represents an error related to WebSocket message handling.
    #[error("Message error: {0}")]
    MessageError(#[from] crate::message::MessageError),

    /// Indicates a failure in serializing or deserializing data.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Represents an error in the server or client configuration.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Metrics registry setup failed.
    #[error("Metrics error: {0}")]
    MetricsError(#[from] prometheus::Error),

    /// Error reported by the underlying WebSocket protocol implementation.
    #[error("Transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WebSocketError {
    /// Whether the error belongs to the synchronous send path
    /// (not connected, rate limited, too large, queue full).
    pub fn is_send_error(&self) -> bool {
        matches!(
            self,
            WebSocketError::NotConnected
                | WebSocketError::RateLimitExceeded
                | WebSocketError::MessageTooLarge { .. }
                | WebSocketError::QueueFull
        )
    }
}

/// Implements conversion from `serde_json::Error` to `WebSocketError`.
///
/// This allows serialization errors to be automatically converted into
/// `WebSocketError::SerializationError`.
impl From<serde_json::Error> for WebSocketError {
    fn from(err: serde_json::Error) -> Self {
        WebSocketError::SerializationError(err.to_string())
    }
}

impl From<url::ParseError> for WebSocketError {
    fn from(err: url::ParseError) -> Self {
        WebSocketError::InvalidUrl(err.to_string())
    }
}

pub type Result<T, E = WebSocketError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_errors_use_short_messages() {
        assert_eq!(WebSocketError::NotConnected.to_string(), "not connected");
        assert_eq!(WebSocketError::QueueFull.to_string(), "queue full");
        assert_eq!(WebSocketError::RateLimitExceeded.to_string(), "rate limit exceeded");
        assert_eq!(WebSocketError::RoomFull.to_string(), "room full");
        assert_eq!(WebSocketError::Unauthorized.to_string(), "unauthorized");
    }

    #[test]
    fn classifies_send_path_errors() {
        assert!(WebSocketError::QueueFull.is_send_error());
        assert!(WebSocketError::MessageTooLarge { size: 10, max: 5 }.is_send_error());
        assert!(!WebSocketError::RoomFull.is_send_error());
        assert!(!WebSocketError::HeartbeatTimeout.is_send_error());
    }
}
