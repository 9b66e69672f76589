//! Error types for the WebSocket engine.
//!
//! Codec and handshake failures have their own error types
//! ([`FrameError`](crate::frame::FrameError) and
//! [`HandshakeError`](crate::handshake::HandshakeError)). Those that come
//! from a peer end the connection and reach the delegate as a
//! [`Failure`](crate::delegate::Failure); [`WsError`] covers what a caller
//! of the server API can see.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::connection::ConnectionState;
use crate::frame::FrameError;

/// Result type for WebSocket operations.
pub type WsResult<T> = Result<T, WsError>;

/// Errors that can occur while running the WebSocket server.
#[derive(Debug, Error)]
pub enum WsError {
    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The address the server tried to bind.
        addr: SocketAddr,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// A payload could not be turned into a frame the server may send.
    #[error("invalid frame: {0}")]
    Frame(#[from] FrameError),

    /// Data was sent to a connection that is not open.
    #[error("connection is not open (state: {state})")]
    NotOpen {
        /// The state the connection was in.
        state: ConnectionState,
    },

    /// Connection not found.
    #[error("connection not found: {connection_id}")]
    ConnectionNotFound {
        /// The ID of the connection that was not found.
        connection_id: String,
    },

    /// The server is shutting down and no longer accepts work.
    #[error("server is shutting down")]
    ShuttingDown,

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl WsError {
    /// Create a new bind error.
    pub fn bind(addr: SocketAddr, source: io::Error) -> Self {
        Self::Bind { addr, source }
    }

    /// Create a new "not open" error.
    pub fn not_open(state: ConnectionState) -> Self {
        Self::NotOpen { state }
    }

    /// Create a new connection not found error.
    pub fn connection_not_found(connection_id: impl fmt::Display) -> Self {
        Self::ConnectionNotFound {
            connection_id: connection_id.to_string(),
        }
    }

    /// Create a new internal error.
    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal(reason.into())
    }
}

/// Close code carried in a close frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CloseCode {
    /// Normal closure (1000).
    Normal = 1000,
    /// Going away (1001).
    GoingAway = 1001,
    /// Protocol error (1002).
    Protocol = 1002,
    /// Unsupported data (1003).
    Unsupported = 1003,
    /// No status received (1005). Never sent on the wire.
    NoStatus = 1005,
    /// Abnormal closure (1006). Never sent on the wire.
    Abnormal = 1006,
    /// Invalid payload data (1007).
    InvalidPayload = 1007,
    /// Policy violation (1008).
    PolicyViolation = 1008,
    /// Message too big (1009).
    MessageTooBig = 1009,
    /// Internal error (1011).
    InternalError = 1011,
}

impl CloseCode {
    /// Convert from a u16 code.
    pub fn from_u16(code: u16) -> Option<Self> {
        match code {
            1000 => Some(Self::Normal),
            1001 => Some(Self::GoingAway),
            1002 => Some(Self::Protocol),
            1003 => Some(Self::Unsupported),
            1005 => Some(Self::NoStatus),
            1006 => Some(Self::Abnormal),
            1007 => Some(Self::InvalidPayload),
            1008 => Some(Self::PolicyViolation),
            1009 => Some(Self::MessageTooBig),
            1011 => Some(Self::InternalError),
            _ => None,
        }
    }

    /// Get the u16 value of this close code.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Whether this code may appear in a close frame on the wire.
    pub fn is_sendable(self) -> bool {
        !matches!(self, Self::NoStatus | Self::Abnormal)
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Normal => "Normal",
            Self::GoingAway => "GoingAway",
            Self::Protocol => "Protocol",
            Self::Unsupported => "Unsupported",
            Self::NoStatus => "NoStatus",
            Self::Abnormal => "Abnormal",
            Self::InvalidPayload => "InvalidPayload",
            Self::PolicyViolation => "PolicyViolation",
            Self::MessageTooBig => "MessageTooBig",
            Self::InternalError => "InternalError",
        };
        write!(f, "{} ({})", name, self.as_u16())
    }
}
