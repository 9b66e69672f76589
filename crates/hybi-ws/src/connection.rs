//! Per-connection protocol state machine.
//!
//! [`Connection`] performs no I/O. The owning task feeds it whatever bytes
//! the socket produced through [`Connection::on_bytes_received`], acts on
//! the returned [`ConnectionEvent`]s, and drains the outbound queue to the
//! socket. This keeps every protocol decision testable without a network.
//!
//! ```text
//! Handshaking ──valid request──► Open ──close / EOF / bad frame──► Closing ──flushed──► Closed
//!      │                                                              ▲
//!      └──────────────── bad request / timeout ───────────────────────┘
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::config::WebSocketConfig;
use crate::delegate::{Failure, FailureKind};
use crate::error::{CloseCode, WsError, WsResult};
use crate::frame::{decode_frame, encode_frame, Frame, FrameError, Opcode, MAX_CONTROL_PAYLOAD};
use crate::handshake::{
    build_response_with_protocol, reject_response, select_protocol,
    try_parse_handshake_from, HandshakeError, HandshakeRequest,
};
use crate::message::{data_frame, CloseFrame, FrameData, Message};

/// A unique identifier for a WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Create a new time-ordered connection ID.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for ConnectionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl From<ConnectionId> for Uuid {
    fn from(id: ConnectionId) -> Self {
        id.0
    }
}

/// Lifecycle state of a connection. States only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    /// Waiting for a complete opening handshake.
    Handshaking = 0,
    /// Handshake done; frames flow both ways.
    Open = 1,
    /// Shutting down; only queued writes are still flushed.
    Closing = 2,
    /// Finished. Terminal.
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Handshaking,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }

    /// Handshaking or Open.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Handshaking | Self::Open)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Handshaking => "handshaking",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed => "closed",
        })
    }
}

/// Shared view of a connection's state.
///
/// The owning task is the only writer; the server reads it to pick
/// broadcast targets and count live connections.
#[derive(Debug, Clone)]
pub struct StateCell(Arc<AtomicU8>);

impl StateCell {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(ConnectionState::Handshaking as u8)))
    }

    /// Current state.
    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move to `next` if it is later than the current state.
    fn advance(&self, next: ConnectionState) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (next as u8 > current).then_some(next as u8)
            })
            .is_ok()
    }
}

/// Something the owner of a [`Connection`] has to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The handshake succeeded; the 101 response is queued.
    Accepted(HandshakeRequest),
    /// A complete data message arrived.
    Message(Message),
    /// The handshake was rejected; a 400 response is queued.
    HandshakeFailed(Failure),
    /// A frame could not be processed; a close frame is queued.
    ParseFailed(Failure),
}

#[derive(Debug)]
struct PartialMessage {
    opcode: Opcode,
    data: BytesMut,
}

/// Protocol state for one client.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    state: StateCell,
    config: Arc<WebSocketConfig>,
    inbound: BytesMut,
    handshake_scanned: usize,
    outbound: VecDeque<Bytes>,
    partial: Option<PartialMessage>,
    close_sent: bool,
    connected_at: Instant,
    last_activity: Instant,
}

impl Connection {
    /// Create a connection in the Handshaking state.
    pub fn new(config: Arc<WebSocketConfig>) -> Self {
        Self::with_id(ConnectionId::new(), config)
    }

    /// Create a connection with a specific ID.
    pub fn with_id(id: ConnectionId, config: Arc<WebSocketConfig>) -> Self {
        let now = Instant::now();
        Self {
            id,
            state: StateCell::new(),
            config,
            inbound: BytesMut::new(),
            handshake_scanned: 0,
            outbound: VecDeque::new(),
            partial: None,
            close_sent: false,
            connected_at: now,
            last_activity: now,
        }
    }

    /// Get the connection ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Get the current state.
    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    /// A shared handle to this connection's state.
    pub fn state_cell(&self) -> StateCell {
        self.state.clone()
    }

    /// Check if the connection is open.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Get the connection configuration.
    pub fn config(&self) -> &Arc<WebSocketConfig> {
        &self.config
    }

    /// Get when the socket was accepted.
    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Get how long since the last inbound frame.
    pub fn idle_duration(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Whether a close frame has been queued.
    pub fn close_sent(&self) -> bool {
        self.close_sent
    }

    /// Whether anything is waiting to be written.
    pub fn has_pending_writes(&self) -> bool {
        !self.outbound.is_empty()
    }

    /// Take the next chunk to write to the socket.
    pub fn pop_outbound(&mut self) -> Option<Bytes> {
        self.outbound.pop_front()
    }

    /// Process bytes read from the socket.
    pub fn on_bytes_received(&mut self, bytes: &[u8]) -> Vec<ConnectionEvent> {
        let mut events = Vec::new();
        match self.state() {
            ConnectionState::Handshaking => {
                self.inbound.extend_from_slice(bytes);
                self.process_handshake(&mut events);
                if self.is_open() {
                    self.process_frames(&mut events);
                }
            }
            ConnectionState::Open => {
                self.inbound.extend_from_slice(bytes);
                self.process_frames(&mut events);
            }
            ConnectionState::Closing | ConnectionState::Closed => {
                trace!(connection_id = %self.id, len = bytes.len(), "Discarding bytes after close");
            }
        }
        events
    }

    fn process_handshake(&mut self, events: &mut Vec<ConnectionEvent>) {
        let scanned = std::mem::replace(&mut self.handshake_scanned, self.inbound.len());
        match try_parse_handshake_from(&self.inbound, self.config.max_handshake_size, scanned) {
            Ok(None) => {}
            Ok(Some((request, consumed))) => {
                let protocol = select_protocol(&request, &self.config.protocols);
                self.outbound
                    .push_back(build_response_with_protocol(&request, protocol.as_deref()));
                let _ = self.inbound.split_to(consumed);
                self.state.advance(ConnectionState::Open);
                self.last_activity = Instant::now();
                debug!(connection_id = %self.id, path = %request.path(), protocol = ?protocol, "Handshake complete");
                events.push(ConnectionEvent::Accepted(request));
            }
            Err(error) => events.push(self.fail_handshake(&error)),
        }
    }

    /// Reject the handshake: queue a 400 response, move to Closing and
    /// return the failure to report. Also used when the handshake times out.
    pub fn fail_handshake(&mut self, error: &HandshakeError) -> ConnectionEvent {
        debug!(connection_id = %self.id, error = %error, "Handshake failed");
        let raw = self.inbound.split().freeze();
        self.outbound.push_back(reject_response(400, "Bad Request"));
        self.state.advance(ConnectionState::Closing);
        ConnectionEvent::HandshakeFailed(Failure {
            kind: FailureKind::Handshake,
            raw,
            diagnostic: error.to_string(),
        })
    }

    fn process_frames(&mut self, events: &mut Vec<ConnectionEvent>) {
        while self.is_open() {
            match decode_frame(&self.inbound, self.config.max_frame_size) {
                Ok(None) => break,
                Ok(Some((frame, consumed))) => {
                    let raw = self.inbound.split_to(consumed).freeze();
                    self.last_activity = Instant::now();
                    if let Err(error) = self.handle_frame(frame, events) {
                        events.push(self.fail_frame(&error, raw));
                    }
                }
                Err(error) => {
                    let raw = self.inbound.split().freeze();
                    events.push(self.fail_frame(&error, raw));
                }
            }
        }
    }

    fn handle_frame(
        &mut self,
        frame: Frame,
        events: &mut Vec<ConnectionEvent>,
    ) -> Result<(), FrameError> {
        if !frame.masked && !self.config.accept_unmasked_frames {
            return Err(FrameError::UnmaskedFrame);
        }
        trace!(connection_id = %self.id, opcode = ?frame.opcode, fin = frame.fin, len = frame.payload.len(), "Frame received");

        match frame.opcode {
            Opcode::Text | Opcode::Binary => {
                if self.partial.is_some() {
                    return Err(FrameError::ProtocolViolation(
                        "new data frame while a fragmented message is in progress",
                    ));
                }
                self.check_message_size(frame.payload.len())?;
                if frame.fin {
                    events.push(ConnectionEvent::Message(Message::from_data(
                        frame.opcode,
                        frame.payload,
                    )?));
                } else {
                    self.partial = Some(PartialMessage {
                        opcode: frame.opcode,
                        data: BytesMut::from(&frame.payload[..]),
                    });
                }
            }
            Opcode::Continuation => {
                let buffered = match &self.partial {
                    Some(partial) => partial.data.len(),
                    None => {
                        return Err(FrameError::ProtocolViolation(
                            "continuation frame without a message in progress",
                        ))
                    }
                };
                self.check_message_size(buffered + frame.payload.len())?;
                if let Some(partial) = self.partial.as_mut() {
                    partial.data.extend_from_slice(&frame.payload);
                }
                if frame.fin {
                    if let Some(partial) = self.partial.take() {
                        events.push(ConnectionEvent::Message(Message::from_data(
                            partial.opcode,
                            partial.data.freeze(),
                        )?));
                    }
                }
            }
            Opcode::Close => {
                let close = CloseFrame::parse(&frame.payload)?;
                debug!(connection_id = %self.id, code = ?close.as_ref().map(|c| c.code), "Peer sent close");
                let echo = close.map(|c| c.code).map(|code| {
                    match CloseCode::from_u16(code) {
                        Some(known) if !known.is_sendable() => CloseCode::Normal.as_u16(),
                        _ => code,
                    }
                });
                self.queue_close(&Frame::close_raw(echo, ""));
                self.state.advance(ConnectionState::Closing);
            }
            Opcode::Ping => {
                self.outbound
                    .push_back(encode_frame(&Frame::pong(frame.payload)));
            }
            Opcode::Pong => {}
        }
        Ok(())
    }

    fn check_message_size(&self, size: usize) -> Result<(), FrameError> {
        if size > self.config.max_message_size {
            return Err(FrameError::MessageTooLarge {
                size,
                max: self.config.max_message_size,
            });
        }
        Ok(())
    }

    fn fail_frame(&mut self, error: &FrameError, raw: Bytes) -> ConnectionEvent {
        debug!(connection_id = %self.id, error = %error, "Frame rejected");
        let mut remaining = raw.to_vec();
        remaining.extend_from_slice(&self.inbound.split());
        self.partial = None;
        self.queue_close(&Frame::close(Some(error.close_code()), ""));
        self.state.advance(ConnectionState::Closing);
        ConnectionEvent::ParseFailed(Failure {
            kind: FailureKind::Frame,
            raw: Bytes::from(remaining),
            diagnostic: error.to_string(),
        })
    }

    fn queue_close(&mut self, frame: &Frame) {
        if !self.close_sent {
            self.outbound.push_back(encode_frame(frame));
            self.close_sent = true;
        }
    }

    /// Queue a text or binary payload as a single frame. Control messages
    /// are refused; use [`close`](Self::close) to end the connection.
    pub fn send<T: FrameData>(&mut self, data: T) -> WsResult<()> {
        let frame = data_frame(data)?;
        self.enqueue_encoded(encode_frame(&frame))
    }

    /// Queue an already encoded frame. Fails unless the connection is open.
    pub fn enqueue_encoded(&mut self, frame: Bytes) -> WsResult<()> {
        let state = self.state();
        if state != ConnectionState::Open {
            return Err(WsError::not_open(state));
        }
        self.outbound.push_back(frame);
        Ok(())
    }

    /// Queue a ping. The payload may be at most 125 bytes.
    pub fn ping(&mut self, payload: impl Into<Bytes>) -> WsResult<()> {
        let payload = payload.into();
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(FrameError::ControlFrameTooLarge(payload.len() as u64).into());
        }
        self.enqueue_encoded(encode_frame(&Frame::ping(payload)))
    }

    /// Start closing. An open connection queues a close frame first; a
    /// connection still handshaking is simply dropped.
    ///
    /// The owning task stops once the close frame is flushed. It does not
    /// wait for the peer's answering close; the socket is shut down and
    /// dropped straight away.
    pub fn close(&mut self, code: CloseCode, reason: &str) {
        if self.state() == ConnectionState::Open {
            self.queue_close(&Frame::close(Some(code), reason));
        }
        self.state.advance(ConnectionState::Closing);
    }

    /// The peer closed its side of the socket. Queued writes may still be
    /// attempted.
    pub fn on_transport_closed(&mut self) {
        self.partial = None;
        self.state.advance(ConnectionState::Closing);
    }

    /// Reading or writing the socket failed. Queued writes are abandoned.
    pub fn on_transport_error(&mut self) {
        self.outbound.clear();
        self.on_transport_closed();
    }

    /// Closing with nothing left to write.
    pub fn is_drained(&self) -> bool {
        self.state() == ConnectionState::Closing && self.outbound.is_empty()
    }

    /// Release buffers and enter the terminal state.
    pub fn finish(&mut self) {
        self.inbound.clear();
        self.outbound.clear();
        self.partial = None;
        self.state.advance(ConnectionState::Closed);
    }
}
