//! Delegate that relays every message to every open connection.

use hybi_ws::{
    ConnectionId, Failure, HandshakeRequest, Message, Target, WebSocketDelegate, WebSocketServer,
};
use tracing::{debug, info, warn};

/// Logs connection lifecycle and rebroadcasts each received message.
#[derive(Debug, Default)]
pub struct RelayDelegate;

impl WebSocketDelegate for RelayDelegate {
    fn on_accept(
        &self,
        server: &WebSocketServer,
        id: ConnectionId,
        request: &HandshakeRequest,
    ) -> Option<Message> {
        info!(
            connection_id = %id,
            path = %request.path(),
            origin = request.origin().unwrap_or("-"),
            connections = server.connection_count(),
            "Client connected"
        );
        None
    }

    fn on_disconnect(&self, server: &WebSocketServer, id: ConnectionId) {
        info!(connection_id = %id, connections = server.connection_count(), "Client disconnected");
    }

    fn on_data(&self, server: &WebSocketServer, id: ConnectionId, message: Message) {
        let len = message.len();
        let delivered = server.send(message, Target::All);
        debug!(connection_id = %id, len, delivered, "Relayed message");
    }

    fn on_failure(&self, _server: &WebSocketServer, id: ConnectionId, failure: &Failure) {
        warn!(
            connection_id = %id,
            kind = %failure.kind,
            diagnostic = %failure.diagnostic,
            "Dropping misbehaving client"
        );
    }
}
