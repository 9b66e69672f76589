//! WebSocket message types.
//!
//! A [`Message`] is what the delegate sees: a complete text or binary
//! payload after reassembly. [`FrameData`] is the seam for outbound data;
//! the frame opcode is taken from the payload's type, never sniffed from
//! its contents.

use bytes::{Buf, Bytes};

use crate::error::CloseCode;
use crate::frame::{Frame, FrameError, Opcode};

/// A WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A text message (UTF-8 encoded).
    Text(String),
    /// A binary message.
    Binary(Bytes),
    /// A ping frame with optional payload.
    Ping(Bytes),
    /// A pong frame with optional payload.
    Pong(Bytes),
    /// A close frame with optional code and reason.
    Close(Option<CloseFrame>),
}

impl Message {
    /// Create a new text message.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    /// Create a new binary message.
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::Binary(data.into())
    }

    /// Create a new ping message.
    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self::Ping(data.into())
    }

    /// Create a new pong message.
    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self::Pong(data.into())
    }

    /// Create a close message with a code and reason.
    pub fn close(code: CloseCode, reason: impl Into<String>) -> Self {
        Self::Close(Some(CloseFrame::new(code, reason)))
    }

    /// Build a data message from a complete (possibly reassembled) payload.
    ///
    /// Text payloads must be valid UTF-8.
    pub fn from_data(opcode: Opcode, payload: Bytes) -> Result<Self, FrameError> {
        match opcode {
            Opcode::Text => String::from_utf8(payload.to_vec())
                .map(Self::Text)
                .map_err(|_| FrameError::InvalidUtf8),
            Opcode::Binary => Ok(Self::Binary(payload)),
            _ => Err(FrameError::ProtocolViolation("not a data opcode")),
        }
    }

    /// Check if this is a text message.
    pub fn is_text(&self) -> bool {
        matches!(self, Self::Text(_))
    }

    /// Check if this is a binary message.
    pub fn is_binary(&self) -> bool {
        matches!(self, Self::Binary(_))
    }

    /// Check if this is a close message.
    pub fn is_close(&self) -> bool {
        matches!(self, Self::Close(_))
    }

    /// Check if this is a data message (text or binary).
    pub fn is_data(&self) -> bool {
        matches!(self, Self::Text(_) | Self::Binary(_))
    }

    /// Get the message payload as text.
    ///
    /// Returns `None` if this is not a text message.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get the message payload as bytes.
    ///
    /// Returns `None` for close messages.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Text(s) => Some(s.as_bytes()),
            Self::Binary(b) | Self::Ping(b) | Self::Pong(b) => Some(b),
            Self::Close(_) => None,
        }
    }

    /// The opcode this message is sent with.
    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Text(_) => Opcode::Text,
            Self::Binary(_) => Opcode::Binary,
            Self::Ping(_) => Opcode::Ping,
            Self::Pong(_) => Opcode::Pong,
            Self::Close(_) => Opcode::Close,
        }
    }

    /// Get the length of the message payload in bytes.
    pub fn len(&self) -> usize {
        match self {
            Self::Text(s) => s.len(),
            Self::Binary(b) | Self::Ping(b) | Self::Pong(b) => b.len(),
            Self::Close(Some(frame)) => 2 + frame.reason.len(),
            Self::Close(None) => 0,
        }
    }

    /// Check if the message payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<Vec<u8>> for Message {
    fn from(b: Vec<u8>) -> Self {
        Self::Binary(b.into())
    }
}

impl From<Bytes> for Message {
    fn from(b: Bytes) -> Self {
        Self::Binary(b)
    }
}

/// Status code and reason carried by a close frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseFrame {
    /// The close code.
    pub code: u16,
    /// The close reason.
    pub reason: String,
}

impl CloseFrame {
    /// Create a new close frame.
    pub fn new(code: CloseCode, reason: impl Into<String>) -> Self {
        Self {
            code: code.as_u16(),
            reason: reason.into(),
        }
    }

    /// Create a normal close frame.
    pub fn normal(reason: impl Into<String>) -> Self {
        Self::new(CloseCode::Normal, reason)
    }

    /// Create a close frame for going away.
    pub fn going_away(reason: impl Into<String>) -> Self {
        Self::new(CloseCode::GoingAway, reason)
    }

    /// Get the close code enum value if it's a standard code.
    pub fn close_code(&self) -> Option<CloseCode> {
        CloseCode::from_u16(self.code)
    }

    /// Parse a close frame payload. An empty payload carries no status.
    pub fn parse(payload: &[u8]) -> Result<Option<Self>, FrameError> {
        match payload.len() {
            0 => Ok(None),
            1 => Err(FrameError::InvalidClosePayload),
            _ => {
                let mut buf = payload;
                let code = buf.get_u16();
                let reason =
                    std::str::from_utf8(buf).map_err(|_| FrameError::InvalidClosePayload)?;
                Ok(Some(Self {
                    code,
                    reason: reason.to_string(),
                }))
            }
        }
    }
}

/// Outbound payload types.
///
/// Strings are sent as text frames and byte containers as binary frames.
/// Control frames are produced by the connection itself; a [`Message`]
/// holding a ping, pong or close is refused by every send path.
pub trait FrameData {
    /// Convert into a single final frame.
    fn into_frame(self) -> Frame;
}

/// Convert `data` into a frame, refusing anything but text and binary.
pub(crate) fn data_frame<T: FrameData>(data: T) -> Result<Frame, FrameError> {
    let frame = data.into_frame();
    if frame.opcode.is_data() {
        Ok(frame)
    } else {
        Err(FrameError::NotDataFrame(frame.opcode))
    }
}

impl FrameData for String {
    fn into_frame(self) -> Frame {
        Frame::text(self)
    }
}

impl FrameData for &str {
    fn into_frame(self) -> Frame {
        Frame::new(Opcode::Text, Bytes::copy_from_slice(self.as_bytes()))
    }
}

impl FrameData for &String {
    fn into_frame(self) -> Frame {
        self.as_str().into_frame()
    }
}

impl FrameData for Vec<u8> {
    fn into_frame(self) -> Frame {
        Frame::binary(self)
    }
}

impl FrameData for &[u8] {
    fn into_frame(self) -> Frame {
        Frame::binary(Bytes::copy_from_slice(self))
    }
}

impl FrameData for Bytes {
    fn into_frame(self) -> Frame {
        Frame::binary(self)
    }
}

impl FrameData for Message {
    fn into_frame(self) -> Frame {
        match self {
            Self::Text(text) => Frame::text(text),
            Self::Binary(data) => Frame::binary(data),
            Self::Ping(data) => Frame::ping(data),
            Self::Pong(data) => Frame::pong(data),
            Self::Close(None) => Frame::close_raw(None, ""),
            Self::Close(Some(close)) => Frame::close_raw(Some(close.code), &close.reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_text() {
        let msg = Message::text("hello");
        assert!(msg.is_text());
        assert!(msg.is_data());
        assert_eq!(msg.as_text(), Some("hello"));
        assert_eq!(msg.len(), 5);
        assert_eq!(msg.opcode(), Opcode::Text);
    }

    #[test]
    fn test_message_binary() {
        let msg = Message::binary(vec![1, 2, 3, 4]);
        assert!(msg.is_binary());
        assert_eq!(msg.as_bytes(), Some(&[1, 2, 3, 4][..]));
        assert_eq!(msg.len(), 4);
    }

    #[test]
    fn test_message_from_data() {
        assert_eq!(
            Message::from_data(Opcode::Text, Bytes::from_static(b"hi")),
            Ok(Message::text("hi"))
        );
        assert_eq!(
            Message::from_data(Opcode::Binary, Bytes::from_static(&[0xff])),
            Ok(Message::binary(vec![0xff]))
        );
        assert_eq!(
            Message::from_data(Opcode::Text, Bytes::from_static(&[0xff, 0xfe])),
            Err(FrameError::InvalidUtf8)
        );
        assert!(Message::from_data(Opcode::Ping, Bytes::new()).is_err());
    }

    #[test]
    fn test_message_close() {
        let msg = Message::close(CloseCode::Normal, "goodbye");
        assert!(msg.is_close());
        assert_eq!(msg.len(), 9);
    }

    #[test]
    fn test_close_frame_parse() {
        assert_eq!(CloseFrame::parse(&[]), Ok(None));
        assert_eq!(CloseFrame::parse(&[0x03]), Err(FrameError::InvalidClosePayload));
        assert_eq!(
            CloseFrame::parse(&[0x03, 0xE9, b'o', b'k']),
            Ok(Some(CloseFrame {
                code: 1001,
                reason: "ok".into()
            }))
        );
        assert_eq!(
            CloseFrame::parse(&[0x03, 0xE8, 0xff]),
            Err(FrameError::InvalidClosePayload)
        );
    }

    #[test]
    fn test_close_frame_constructors() {
        assert_eq!(CloseFrame::normal("done").code, 1000);
        assert_eq!(
            CloseFrame::going_away("bye").close_code(),
            Some(CloseCode::GoingAway)
        );
    }

    #[test]
    fn test_frame_data_opcode_follows_type() {
        assert_eq!("hi".into_frame().opcode, Opcode::Text);
        assert_eq!(String::from("hi").into_frame().opcode, Opcode::Text);
        // bytes that happen to be valid UTF-8 are still binary
        assert_eq!(b"hi".to_vec().into_frame().opcode, Opcode::Binary);
        assert_eq!((&b"hi"[..]).into_frame().opcode, Opcode::Binary);
        assert_eq!(Bytes::from_static(b"hi").into_frame().opcode, Opcode::Binary);
        assert_eq!(Message::ping(vec![1]).into_frame().opcode, Opcode::Ping);
    }

    #[test]
    fn test_frame_data_close_message() {
        let frame = Message::close(CloseCode::GoingAway, "bye").into_frame();
        assert_eq!(frame.opcode, Opcode::Close);
        assert_eq!(&frame.payload[..], &[0x03, 0xE9, b'b', b'y', b'e']);
    }

    #[test]
    fn test_data_frame_refuses_control_messages() {
        assert_eq!(data_frame("hi").unwrap(), Frame::text("hi"));
        assert!(data_frame(Message::binary(vec![1])).is_ok());
        assert_eq!(
            data_frame(Message::close(CloseCode::Normal, "bye")),
            Err(FrameError::NotDataFrame(Opcode::Close))
        );
        assert_eq!(
            data_frame(Message::ping(vec![1])),
            Err(FrameError::NotDataFrame(Opcode::Ping))
        );
        assert_eq!(
            data_frame(Message::pong(Bytes::new())),
            Err(FrameError::NotDataFrame(Opcode::Pong))
        );
    }
}
