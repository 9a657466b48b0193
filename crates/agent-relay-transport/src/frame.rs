//! Conversions between axum WebSocket messages and `Frame`s.

use agent_relay_core::Frame;
use axum::extract::ws::Message;

/// Convert an outbound frame into a WebSocket message.
#[must_use]
pub fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Ping(data) => Message::Ping(data.into()),
        Frame::Pong(data) => Message::Pong(data.into()),
        Frame::Close => Message::Close(None),
    }
}

/// Convert an inbound WebSocket message into a frame.
///
/// Binary messages are accepted if they hold UTF-8 text; anything else
/// yields `None` and is skipped.
#[must_use]
pub fn from_message(message: Message) -> Option<Frame> {
    match message {
        Message::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
        Message::Binary(data) => String::from_utf8(data.to_vec()).ok().map(Frame::Text),
        Message::Ping(data) => Some(Frame::Ping(data.to_vec())),
        Message::Pong(data) => Some(Frame::Pong(data.to_vec())),
        Message::Close(_) => Some(Frame::Close),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_roundtrip() {
        let frame = Frame::Text(r#"{"type":"heartbeat"}"#.to_string());
        assert_eq!(from_message(to_message(frame.clone())), Some(frame));
    }

    #[test]
    fn test_binary_utf8_is_text() {
        let msg = Message::Binary(b"{}".to_vec().into());
        assert_eq!(from_message(msg), Some(Frame::Text("{}".to_string())));
    }

    #[test]
    fn test_binary_garbage_is_skipped() {
        let msg = Message::Binary(vec![0xff, 0xfe].into());
        assert_eq!(from_message(msg), None);
    }

    #[test]
    fn test_control_frames() {
        assert_eq!(from_message(to_message(Frame::probe())), Some(Frame::probe()));
        assert_eq!(from_message(Message::Close(None)), Some(Frame::Close));
    }
}
