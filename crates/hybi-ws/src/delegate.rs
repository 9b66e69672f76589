//! Application callbacks.

use bytes::Bytes;

use crate::connection::ConnectionId;
use crate::handshake::HandshakeRequest;
use crate::message::Message;
use crate::server::WebSocketServer;

/// Which stage a connection failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The opening handshake was invalid or timed out.
    Handshake,
    /// A frame was malformed or broke the protocol.
    Frame,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Handshake => f.write_str("handshake"),
            Self::Frame => f.write_str("frame"),
        }
    }
}

/// Details of a connection that was dropped for bad input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// Stage that failed.
    pub kind: FailureKind,
    /// The unconsumed bytes that could not be processed.
    pub raw: Bytes,
    /// Human-readable reason.
    pub diagnostic: String,
}

/// Receives connection lifecycle and data events from a [`WebSocketServer`].
///
/// The server only holds a weak reference; events raised after the
/// delegate has been dropped are discarded. Callbacks for one connection
/// arrive in order on that connection's task, so implementations must be
/// `Send + Sync` and should not block.
///
/// # Example
///
/// ```ignore
/// struct Echo;
///
/// impl WebSocketDelegate for Echo {
///     fn on_data(&self, server: &WebSocketServer, id: ConnectionId, message: Message) {
///         server.send(message, Target::One(id));
///     }
/// }
/// ```
pub trait WebSocketDelegate: Send + Sync + 'static {
    /// A handshake completed and the connection is open. A returned
    /// message is queued right after the handshake response.
    fn on_accept(
        &self,
        server: &WebSocketServer,
        id: ConnectionId,
        request: &HandshakeRequest,
    ) -> Option<Message> {
        let _ = (server, id, request);
        None
    }

    /// An open connection closed. Not raised for connections that never
    /// finished the handshake.
    fn on_disconnect(&self, server: &WebSocketServer, id: ConnectionId) {
        let _ = (server, id);
    }

    /// A complete text or binary message arrived.
    fn on_data(&self, server: &WebSocketServer, id: ConnectionId, message: Message);

    /// A connection sent something it should not have and is being dropped.
    fn on_failure(&self, server: &WebSocketServer, id: ConnectionId, failure: &Failure) {
        let _ = (server, id, failure);
    }
}
