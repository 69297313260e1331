use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Room control requests a client may send as a JSON text frame.
///
/// Text frames that do not parse as one of these are treated as application data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    JoinRoom { room: String },
    LeaveRoom { room: String },
    /// Relay `content` to every other member of `room`.
    RoomMessage { room: String, content: Value },
}

/// Replies and relayed data the server sends back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    RoomJoined { room: String },
    RoomLeft { room: String },
    RoomMessage {
        room: String,
        from: String,
        content: Value,
    },
    Error { message: String },
}

impl ServerMessage {
    pub fn error(message: impl ToString) -> Self {
        ServerMessage::Error {
            message: message.to_string(),
        }
    }
}

impl ClientMessage {
    /// Parses a control message, returning `None` for anything else.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    pub fn room(&self) -> &str {
        match self {
            ClientMessage::JoinRoom { room }
            | ClientMessage::LeaveRoom { room }
            | ClientMessage::RoomMessage { room, .. } => room,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_control_messages() {
        assert_eq!(
            ClientMessage::parse(r#"{"type":"join_room","room":"lobby"}"#),
            Some(ClientMessage::JoinRoom { room: "lobby".into() })
        );
        let relay = ClientMessage::parse(r#"{"type":"room_message","room":"r","content":{"n":1}}"#)
            .unwrap();
        assert_eq!(relay.room(), "r");
        assert_eq!(ClientMessage::parse("hello"), None);
        assert_eq!(ClientMessage::parse(r#"{"type":"dance"}"#), None);
    }

    #[test]
    fn server_messages_are_tagged() {
        let value = serde_json::to_value(ServerMessage::RoomJoined { room: "r".into() }).unwrap();
        assert_eq!(value, json!({"type": "room_joined", "room": "r"}));
        let value = serde_json::to_value(ServerMessage::error("room full")).unwrap();
        assert_eq!(value, json!({"type": "error", "message": "room full"}));
    }
}
