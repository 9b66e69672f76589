//! Frame codec for the hybi draft wire format.
//!
//! Decoding is incremental: [`decode_frame`] looks at whatever bytes have
//! arrived so far and either returns a complete frame together with the
//! number of bytes it occupied, reports that more bytes are needed, or
//! rejects the input as malformed. Encoding always produces unmasked
//! frames, as frames sent by a server must never be masked.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               |Masking-key, if MASK set to 1  |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +-------------------------------- - - - - - - - - - - - - - - - +
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::error::CloseCode;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Default ceiling for a single frame payload (16 MB).
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Errors produced while decoding or interpreting frames.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// One of RSV1-3 was set; no extension is negotiated.
    #[error("reserved bits set: 0x{0:X}")]
    ReservedBitsSet(u8),

    /// Opcode outside the defined set.
    #[error("invalid opcode: 0x{0:X}")]
    InvalidOpcode(u8),

    /// 64-bit length with the most significant bit set, or a length that
    /// does not fit in memory.
    #[error("payload length overflow")]
    LengthOverflow,

    /// Declared payload exceeds the configured ceiling.
    #[error("payload too large: {size} bytes (max: {max})")]
    PayloadTooLarge {
        /// Declared payload size.
        size: u64,
        /// Configured ceiling.
        max: usize,
    },

    /// A reassembled message grew past the configured ceiling.
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge {
        /// Size the message would have reached.
        size: usize,
        /// Configured ceiling.
        max: usize,
    },

    /// Control frame with more than 125 bytes of payload.
    #[error("control frame payload too large: {0} bytes (max: 125)")]
    ControlFrameTooLarge(u64),

    /// Control frame without FIN.
    #[error("control frame cannot be fragmented")]
    FragmentedControlFrame,

    /// Client frame without a masking key.
    #[error("client frame is not masked")]
    UnmaskedFrame,

    /// Text payload is not UTF-8.
    #[error("invalid UTF-8 in text payload")]
    InvalidUtf8,

    /// Close payload of one byte, or with a non-UTF-8 reason.
    #[error("invalid close payload")]
    InvalidClosePayload,

    /// Frame sequence that violates the fragmentation rules.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    /// A control message was handed to a data send path.
    #[error("{0:?} is not a data opcode; only text and binary messages can be sent")]
    NotDataFrame(Opcode),
}

impl FrameError {
    /// The close code to send when this error ends a connection.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::PayloadTooLarge { .. } | Self::MessageTooLarge { .. } => CloseCode::MessageTooBig,
            Self::InvalidUtf8 => CloseCode::InvalidPayload,
            _ => CloseCode::Protocol,
        }
    }
}

/// Frame opcode (4 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    /// Continuation of a fragmented message.
    Continuation = 0x0,
    /// Text data frame.
    Text = 0x1,
    /// Binary data frame.
    Binary = 0x2,
    /// Connection close.
    Close = 0x8,
    /// Ping.
    Ping = 0x9,
    /// Pong.
    Pong = 0xA,
}

impl Opcode {
    /// Returns true for Close, Ping and Pong.
    pub const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }

    /// Returns true for Continuation, Text and Binary.
    pub const fn is_data(self) -> bool {
        !self.is_control()
    }

    /// Parse the low four bits of the first header byte.
    pub fn from_u8(value: u8) -> Result<Self, FrameError> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(FrameError::InvalidOpcode(value)),
        }
    }

    /// The wire value of this opcode.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }
}

/// A single frame.
///
/// Decoded frames carry their payload already unmasked; `masked` and
/// `mask_key` record what was on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment of a message.
    pub fin: bool,
    /// Frame opcode.
    pub opcode: Opcode,
    /// Whether the payload was masked on the wire.
    pub masked: bool,
    /// The masking key, if any.
    pub mask_key: Option<[u8; 4]>,
    /// Unmasked payload.
    pub payload: Bytes,
}

impl Frame {
    /// Create a final, unmasked frame.
    pub fn new(opcode: Opcode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin: true,
            opcode,
            masked: false,
            mask_key: None,
            payload: payload.into(),
        }
    }

    /// Create a text frame.
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Opcode::Text, Bytes::from(text.into()))
    }

    /// Create a binary frame.
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Binary, data)
    }

    /// Create a ping frame.
    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Ping, data)
    }

    /// Create a pong frame.
    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self::new(Opcode::Pong, data)
    }

    /// Create a close frame. The reason is truncated so the payload stays
    /// within the control frame limit.
    pub fn close(code: Option<CloseCode>, reason: &str) -> Self {
        Self::close_raw(code.map(CloseCode::as_u16), reason)
    }

    /// Create a close frame from a raw status code, used when echoing a
    /// code the peer sent that has no [`CloseCode`] variant.
    pub fn close_raw(code: Option<u16>, reason: &str) -> Self {
        let Some(code) = code else {
            return Self::new(Opcode::Close, Bytes::new());
        };
        let reason = truncate_utf8(reason, MAX_CONTROL_PAYLOAD - 2);
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code);
        payload.put_slice(reason.as_bytes());
        Self::new(Opcode::Close, payload.freeze())
    }

    /// Set the FIN flag.
    pub fn with_fin(mut self, fin: bool) -> Self {
        self.fin = fin;
        self
    }

    /// Length of this frame once encoded (unmasked).
    pub fn encoded_len(&self) -> usize {
        header_len(self.payload.len(), false) + self.payload.len()
    }
}

/// XOR `payload` in place with the rotating four-byte key.
///
/// Masking is an involution: applying the same key twice restores the
/// original bytes.
pub fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Try to decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` holds only a prefix of a frame,
/// `Ok(Some((frame, consumed)))` when a full frame is available, and an
/// error when the header is malformed or the declared length exceeds
/// `max_payload`. Length fields wider than necessary are accepted.
pub fn decode_frame(buf: &[u8], max_payload: usize) -> Result<Option<(Frame, usize)>, FrameError> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let first = buf[0];
    let second = buf[1];

    let rsv = (first >> 4) & 0x07;
    if rsv != 0 {
        return Err(FrameError::ReservedBitsSet(rsv));
    }

    let fin = first & 0x80 != 0;
    let opcode = Opcode::from_u8(first & 0x0F)?;
    let masked = second & 0x80 != 0;
    let short_len = second & 0x7F;

    if opcode.is_control() {
        if !fin {
            return Err(FrameError::FragmentedControlFrame);
        }
        if usize::from(short_len) > MAX_CONTROL_PAYLOAD {
            return Err(FrameError::ControlFrameTooLarge(u64::from(short_len)));
        }
    }

    let mut offset = 2;
    let declared: u64 = match short_len {
        126 => {
            if buf.len() < 4 {
                return Ok(None);
            }
            offset = 4;
            u64::from(u16::from_be_bytes([buf[2], buf[3]]))
        }
        127 => {
            if buf.len() < 10 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            offset = 10;
            let len = u64::from_be_bytes(raw);
            if len & (1 << 63) != 0 {
                return Err(FrameError::LengthOverflow);
            }
            len
        }
        n => u64::from(n),
    };

    let payload_len = usize::try_from(declared).map_err(|_| FrameError::LengthOverflow)?;
    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: declared,
            max: max_payload,
        });
    }

    let mask_key = if masked {
        if buf.len() < offset + 4 {
            return Ok(None);
        }
        let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
        offset += 4;
        Some(key)
    } else {
        None
    };

    let end = offset
        .checked_add(payload_len)
        .ok_or(FrameError::LengthOverflow)?;
    if buf.len() < end {
        return Ok(None);
    }

    let mut payload = BytesMut::from(&buf[offset..end]);
    if let Some(key) = mask_key {
        apply_mask(&mut payload, key);
    }

    let frame = Frame {
        fin,
        opcode,
        masked,
        mask_key,
        payload: payload.freeze(),
    };
    Ok(Some((frame, end)))
}

/// Encode a frame for sending from the server. The mask bit is never set,
/// whatever `frame.masked` says, and the shortest length form is used.
pub fn encode_frame(frame: &Frame) -> Bytes {
    let len = frame.payload.len();
    let mut buf = BytesMut::with_capacity(header_len(len, false) + len);

    let mut first = frame.opcode.as_u8();
    if frame.fin {
        first |= 0x80;
    }
    buf.put_u8(first);

    if len < 126 {
        buf.put_u8(len as u8);
    } else if let Ok(short) = u16::try_from(len) {
        buf.put_u8(126);
        buf.put_u16(short);
    } else {
        buf.put_u8(127);
        buf.put_u64(len as u64);
    }

    buf.put_slice(&frame.payload);
    buf.freeze()
}

fn header_len(payload_len: usize, masked: bool) -> usize {
    let len_bytes = if payload_len < 126 {
        0
    } else if payload_len <= usize::from(u16::MAX) {
        2
    } else {
        8
    };
    2 + len_bytes + if masked { 4 } else { 0 }
}

fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// Client-side encoder used to feed the decoder masked frames.
    fn masked(opcode: Opcode, fin: bool, payload: &[u8], key: [u8; 4]) -> Vec<u8> {
        let mut out = Vec::new();
        out.push((if fin { 0x80 } else { 0 }) | opcode.as_u8());
        let len = payload.len();
        if len < 126 {
            out.push(0x80 | len as u8);
        } else if len <= usize::from(u16::MAX) {
            out.push(0x80 | 126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            out.push(0x80 | 127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }
        out.extend_from_slice(&key);
        let mut body = payload.to_vec();
        apply_mask(&mut body, key);
        out.extend_from_slice(&body);
        out
    }

    #[test]
    fn test_decode_masked_hello() {
        let wire = [
            0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
        ];
        let (frame, consumed) = decode_frame(&wire, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        assert_eq!(consumed, wire.len());
        assert!(frame.fin);
        assert!(frame.masked);
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(frame.mask_key, Some([0x37, 0xfa, 0x21, 0x3d]));
        assert_eq!(&frame.payload[..], b"Hello");
    }

    #[test]
    fn test_decode_unmasked_hello() {
        let wire = [0x81, 0x05, b'H', b'e', b'l', b'l', b'o'];
        let (frame, consumed) = decode_frame(&wire, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        assert_eq!(consumed, 7);
        assert!(!frame.masked);
        assert_eq!(&frame.payload[..], b"Hello");
    }

    #[test]
    fn test_decode_needs_more_data() {
        assert_eq!(decode_frame(&[], DEFAULT_MAX_PAYLOAD), Ok(None));
        assert_eq!(decode_frame(&[0x81], DEFAULT_MAX_PAYLOAD), Ok(None));
        // 16-bit length announced but not present yet
        assert_eq!(decode_frame(&[0x82, 126, 0x01], DEFAULT_MAX_PAYLOAD), Ok(None));
        // 64-bit length announced but not present yet
        assert_eq!(decode_frame(&[0x82, 127, 0, 0, 0], DEFAULT_MAX_PAYLOAD), Ok(None));
        // mask key incomplete
        assert_eq!(decode_frame(&[0x81, 0x85, 0x37, 0xfa], DEFAULT_MAX_PAYLOAD), Ok(None));
    }

    #[test]
    fn test_decode_consumes_only_first_frame() {
        let mut wire = masked(Opcode::Text, true, b"one", [1, 2, 3, 4]);
        let first_len = wire.len();
        wire.extend(masked(Opcode::Text, true, b"two", [5, 6, 7, 8]));

        let (frame, consumed) = decode_frame(&wire, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        assert_eq!(consumed, first_len);
        assert_eq!(&frame.payload[..], b"one");

        let (frame, _) = decode_frame(&wire[consumed..], DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        assert_eq!(&frame.payload[..], b"two");
    }

    #[test]
    fn test_decode_extended_16bit_length() {
        let payload = vec![0xAB; 300];
        let wire = masked(Opcode::Binary, true, &payload, [9, 8, 7, 6]);
        assert_eq!(wire[1], 0x80 | 126);
        let (frame, consumed) = decode_frame(&wire, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        assert_eq!(consumed, 2 + 2 + 4 + 300);
        assert_eq!(frame.payload.len(), 300);
    }

    #[test]
    fn test_decode_extended_64bit_length() {
        let payload = vec![0x11; 70_000];
        let wire = masked(Opcode::Binary, true, &payload, [1, 1, 1, 1]);
        assert_eq!(wire[1], 0x80 | 127);
        let (frame, consumed) = decode_frame(&wire, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        assert_eq!(consumed, 2 + 8 + 4 + 70_000);
        assert_eq!(frame.payload, Bytes::from(payload));
    }

    #[test]
    fn test_decode_accepts_non_minimal_length() {
        // 5-byte payload carried in a 16-bit length field
        let wire = [0x81, 126, 0x00, 0x05, b'H', b'e', b'l', b'l', b'o'];
        let (frame, consumed) = decode_frame(&wire, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
        assert_eq!(consumed, wire.len());
        assert_eq!(&frame.payload[..], b"Hello");
    }

    #[test]
    fn test_decode_rejects_reserved_bits() {
        let wire = [0xC1, 0x00];
        assert_eq!(
            decode_frame(&wire, DEFAULT_MAX_PAYLOAD),
            Err(FrameError::ReservedBitsSet(0x4))
        );
    }

    #[test]
    fn test_decode_rejects_unknown_opcode() {
        assert_eq!(
            decode_frame(&[0x83, 0x00], DEFAULT_MAX_PAYLOAD),
            Err(FrameError::InvalidOpcode(0x3))
        );
        assert_eq!(
            decode_frame(&[0x8B, 0x00], DEFAULT_MAX_PAYLOAD),
            Err(FrameError::InvalidOpcode(0xB))
        );
    }

    #[test]
    fn test_decode_rejects_fragmented_control_frame() {
        assert_eq!(
            decode_frame(&[0x09, 0x00], DEFAULT_MAX_PAYLOAD),
            Err(FrameError::FragmentedControlFrame)
        );
    }

    #[test]
    fn test_decode_rejects_oversized_control_frame() {
        assert_eq!(
            decode_frame(&[0x89, 126, 0x00, 0x80], DEFAULT_MAX_PAYLOAD),
            Err(FrameError::ControlFrameTooLarge(126))
        );
    }

    #[test]
    fn test_decode_rejects_length_with_high_bit() {
        let mut wire = vec![0x82, 127];
        wire.extend_from_slice(&(1u64 << 63).to_be_bytes());
        assert_eq!(decode_frame(&wire, DEFAULT_MAX_PAYLOAD), Err(FrameError::LengthOverflow));
    }

    #[test]
    fn test_decode_rejects_payload_over_ceiling_before_body_arrives() {
        let mut wire = vec![0x82, 127];
        wire.extend_from_slice(&(1u64 << 40).to_be_bytes());
        assert!(matches!(
            decode_frame(&wire, 1024),
            Err(FrameError::PayloadTooLarge { max: 1024, .. })
        ));
    }

    #[test]
    fn test_encode_short_frame() {
        let encoded = encode_frame(&Frame::text("Hello"));
        assert_eq!(&encoded[..], &[0x81, 0x05, b'H', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn test_encode_length_boundaries() {
        let at_125 = encode_frame(&Frame::binary(vec![0u8; 125]));
        assert_eq!(at_125[1], 125);
        assert_eq!(at_125.len(), 2 + 125);

        let at_126 = encode_frame(&Frame::binary(vec![0u8; 126]));
        assert_eq!(at_126[1], 126);
        assert_eq!(&at_126[2..4], &126u16.to_be_bytes());
        assert_eq!(at_126.len(), 4 + 126);

        let at_65536 = encode_frame(&Frame::binary(vec![0u8; 65_536]));
        assert_eq!(at_65536[1], 127);
        assert_eq!(&at_65536[2..10], &65_536u64.to_be_bytes());
        assert_eq!(at_65536.len(), 10 + 65_536);
    }

    #[test]
    fn test_encode_never_masks() {
        let mut frame = Frame::text("secret");
        frame.masked = true;
        frame.mask_key = Some([1, 2, 3, 4]);
        let encoded = encode_frame(&frame);
        assert_eq!(encoded[1] & 0x80, 0);
        assert_eq!(&encoded[2..], b"secret");
        assert_eq!(encoded.len(), frame.encoded_len());
    }

    #[test]
    fn test_encode_continuation_without_fin() {
        let encoded = encode_frame(&Frame::new(Opcode::Continuation, "ab").with_fin(false));
        assert_eq!(encoded[0], 0x00);
    }

    #[test]
    fn test_close_frame_payload() {
        let frame = Frame::close(Some(CloseCode::Normal), "bye");
        assert_eq!(&frame.payload[..], &[0x03, 0xE8, b'b', b'y', b'e']);
        assert!(Frame::close(None, "ignored").payload.is_empty());
    }

    #[test]
    fn test_close_frame_reason_truncated_on_char_boundary() {
        let reason = "é".repeat(100);
        let frame = Frame::close(Some(CloseCode::GoingAway), &reason);
        assert!(frame.payload.len() <= MAX_CONTROL_PAYLOAD);
        assert!(std::str::from_utf8(&frame.payload[2..]).is_ok());
    }

    #[test]
    fn test_apply_mask_cycles_key() {
        let mut single = [0x04];
        apply_mask(&mut single, [1, 2, 3, 4]);
        assert_eq!(single, [0x05]);

        let mut data = [0u8; 6];
        apply_mask(&mut data, [1, 2, 3, 4]);
        assert_eq!(data, [1, 2, 3, 4, 1, 2]);
    }

    #[test]
    fn test_apply_mask_is_involution() {
        let key = [0xde, 0xad, 0xbe, 0xef];
        let mut data = b"some payload bytes".to_vec();
        apply_mask(&mut data, key);
        assert_ne!(&data[..], b"some payload bytes");
        apply_mask(&mut data, key);
        assert_eq!(&data[..], b"some payload bytes");
    }

    #[test]
    fn test_frame_error_close_codes() {
        assert_eq!(FrameError::InvalidUtf8.close_code(), CloseCode::InvalidPayload);
        assert_eq!(
            FrameError::MessageTooLarge { size: 2, max: 1 }.close_code(),
            CloseCode::MessageTooBig
        );
        assert_eq!(FrameError::UnmaskedFrame.close_code(), CloseCode::Protocol);
    }

    proptest! {
        #[test]
        fn prop_masked_frames_decode_to_original(
            payload in proptest::collection::vec(any::<u8>(), 0..70_000),
            key in any::<[u8; 4]>(),
            binary in any::<bool>(),
        ) {
            let opcode = if binary { Opcode::Binary } else { Opcode::Text };
            let wire = masked(opcode, true, &payload, key);
            let (frame, consumed) = decode_frame(&wire, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
            prop_assert_eq!(consumed, wire.len());
            prop_assert_eq!(frame.opcode, opcode);
            prop_assert_eq!(&frame.payload[..], &payload[..]);
        }

        #[test]
        fn prop_every_strict_prefix_needs_more_data(
            payload in proptest::collection::vec(any::<u8>(), 0..300),
            key in any::<[u8; 4]>(),
        ) {
            let wire = masked(Opcode::Binary, true, &payload, key);
            for cut in 0..wire.len() {
                prop_assert_eq!(decode_frame(&wire[..cut], DEFAULT_MAX_PAYLOAD), Ok(None));
            }
        }

        #[test]
        fn prop_encoded_frames_decode_back(
            payload in proptest::collection::vec(any::<u8>(), 0..70_000),
        ) {
            let frame = Frame::binary(payload.clone());
            let wire = encode_frame(&frame);
            let (decoded, consumed) = decode_frame(&wire, DEFAULT_MAX_PAYLOAD).unwrap().unwrap();
            prop_assert_eq!(consumed, wire.len());
            prop_assert_eq!(decoded, frame);
        }
    }
}
