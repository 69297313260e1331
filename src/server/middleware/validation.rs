use crate::{message::Message, utils::error::WebSocketError};

pub const MAX_ROOM_NAME_LEN: usize = 128;

/// Rejects inbound messages larger than `max_size` bytes. Zero means no limit.
pub fn validate_inbound(message: &Message, max_size: usize) -> Result<(), WebSocketError> {
    if max_size > 0 && message.len() > max_size {
        return Err(WebSocketError::MessageTooLarge {
            size: message.len(),
            max: max_size,
        });
    }
    Ok(())
}

/// Room names must be non-empty, reasonably short and free of control characters.
pub fn validate_room_name(name: &str) -> Result<(), WebSocketError> {
    if name.trim().is_empty() {
        return Err(WebSocketError::InvalidRoomName("empty".into()));
    }
    if name.chars().count() > MAX_ROOM_NAME_LEN {
        return Err(WebSocketError::InvalidRoomName(format!(
            "longer than {MAX_ROOM_NAME_LEN} characters"
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(WebSocketError::InvalidRoomName(
            "contains control characters".into(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_cap() {
        let msg = Message::text("12345");
        assert!(validate_inbound(&msg, 5).is_ok());
        assert!(validate_inbound(&msg, 0).is_ok());
        assert!(matches!(
            validate_inbound(&msg, 4),
            Err(WebSocketError::MessageTooLarge { size: 5, max: 4 })
        ));
    }

    #[test]
    fn room_names() {
        assert!(validate_room_name("lobby").is_ok());
        assert!(validate_room_name("").is_err());
        assert!(validate_room_name("   ").is_err());
        assert!(validate_room_name("a\nb").is_err());
        assert!(validate_room_name(&"x".repeat(MAX_ROOM_NAME_LEN + 1)).is_err());
    }
}
