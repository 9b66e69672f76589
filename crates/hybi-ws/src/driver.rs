//! Per-connection task.
//!
//! Owns the socket and the [`Connection`] state machine, feeds it bytes and
//! timer ticks, writes whatever it queues, and forwards its events to the
//! server's delegate.

use std::future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::time::{self, Interval};
use tracing::{debug, info, instrument, trace, warn};

use crate::connection::{Connection, ConnectionEvent, ConnectionId, ConnectionState};
use crate::error::CloseCode;
use crate::handshake::HandshakeError;
use crate::server::{Mailbox, WebSocketServer};

/// Removes the connection from the server exactly once, including when the
/// task unwinds.
struct Teardown {
    server: WebSocketServer,
    id: ConnectionId,
    opened: bool,
}

impl Drop for Teardown {
    fn drop(&mut self) {
        self.server.release(self.id, self.opened);
    }
}

#[instrument(name = "connection", skip_all, fields(connection_id = %connection.id(), peer = %peer))]
pub(crate) async fn run<S>(
    server: WebSocketServer,
    socket: S,
    peer: SocketAddr,
    mut connection: Connection,
    mailbox: Mailbox,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let config = Arc::clone(connection.config());
    let mut teardown = Teardown {
        server: server.clone(),
        id: connection.id(),
        opened: false,
    };

    let (mut reader, mut writer) = tokio::io::split(socket);
    let mut buf = vec![0u8; config.read_buffer_size.max(1)];

    let handshake_deadline = time::sleep(config.handshake_timeout);
    tokio::pin!(handshake_deadline);

    let mut heartbeat = config
        .heartbeat_interval
        .map(|period| time::interval_at(time::Instant::now() + period, period));

    let shutdown = server.shutdown_signal().clone();
    let stopping = shutdown.recv();
    tokio::pin!(stopping);
    let mut stop_seen = false;

    let Mailbox {
        mut outbound,
        mut close_requests,
    } = mailbox;

    loop {
        // A peer that stops reading blocks the write; shutdown abandons it
        // and the write timeout bounds it otherwise.
        let flushed = tokio::select! {
            biased;

            result = time::timeout(config.write_timeout, flush(&mut writer, &mut connection)) => Some(result),
            () = &mut stopping, if !stop_seen => {
                stop_seen = true;
                None
            }
        };
        match flushed {
            Some(Ok(Ok(()))) => {}
            Some(Ok(Err(e))) => {
                debug!(error = %e, "Write failed");
                connection.on_transport_error();
            }
            Some(Err(_)) => {
                warn!(timeout = ?config.write_timeout, "Write timed out, abandoning connection");
                connection.on_transport_error();
            }
            None => {
                debug!("Shutdown while writing, abandoning queued frames");
                connection.on_transport_error();
            }
        }
        if !connection.state().is_live() {
            break;
        }

        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    debug!("Peer closed the socket");
                    connection.on_transport_closed();
                }
                Ok(n) => {
                    for event in connection.on_bytes_received(&buf[..n]) {
                        teardown.opened |= dispatch(&server, &mut connection, event);
                    }
                }
                Err(e) => {
                    debug!(error = %e, "Read failed");
                    connection.on_transport_error();
                }
            },

            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = connection.enqueue_encoded(frame) {
                        trace!(error = %e, "Dropping queued frame");
                    }
                }
                None => connection.close(CloseCode::GoingAway, ""),
            },

            changed = close_requests.changed() => {
                let code = match changed {
                    Ok(()) => {
                        let requested = *close_requests.borrow_and_update();
                        requested.unwrap_or(CloseCode::Normal)
                    }
                    Err(_) => CloseCode::GoingAway,
                };
                debug!(code = %code, "Close requested");
                connection.close(code, "");
            }

            () = &mut handshake_deadline, if connection.state() == ConnectionState::Handshaking => {
                let event = connection.fail_handshake(&HandshakeError::TimedOut(config.handshake_timeout));
                dispatch(&server, &mut connection, event);
            }

            () = next_tick(&mut heartbeat), if connection.is_open() => {
                if connection.idle_duration() >= config.connection_timeout {
                    info!(idle = ?connection.idle_duration(), "Closing idle connection");
                    connection.close(CloseCode::GoingAway, "idle timeout");
                } else if let Err(e) = connection.ping(Bytes::new()) {
                    trace!(error = %e, "Heartbeat skipped");
                }
            }

            () = &mut stopping, if !stop_seen => {
                stop_seen = true;
                connection.close(CloseCode::GoingAway, "server shutting down");
            }
        }
    }

    match time::timeout(config.write_timeout, writer.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => trace!(error = %e, "Socket shutdown failed"),
        Err(_) => trace!("Socket shutdown timed out"),
    }
    connection.finish();
    debug!(opened = teardown.opened, "Connection finished");
}

/// Write every queued chunk.
async fn flush<S: AsyncWrite>(
    writer: &mut WriteHalf<S>,
    connection: &mut Connection,
) -> std::io::Result<()> {
    let mut wrote = false;
    while let Some(chunk) = connection.pop_outbound() {
        writer.write_all(&chunk).await?;
        wrote = true;
    }
    if wrote {
        writer.flush().await?;
    }
    Ok(())
}

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending().await,
    }
}

/// Forward one event to the server. Returns `true` when the event opened
/// the connection.
fn dispatch(server: &WebSocketServer, connection: &mut Connection, event: ConnectionEvent) -> bool {
    let id = connection.id();
    match event {
        ConnectionEvent::Accepted(request) => {
            info!(path = %request.path(), origin = ?request.origin(), "WebSocket connection opened");
            if let Some(greeting) = server.notify_accept(id, &request) {
                if let Err(e) = connection.send(greeting) {
                    debug!(error = %e, "Greeting not sent");
                }
            }
            true
        }
        ConnectionEvent::Message(message) => {
            trace!(len = message.len(), text = message.is_text(), "Message received");
            server.notify_data(id, message);
            false
        }
        ConnectionEvent::HandshakeFailed(failure) | ConnectionEvent::ParseFailed(failure) => {
            warn!(kind = %failure.kind, diagnostic = %failure.diagnostic, raw_len = failure.raw.len(), "Connection failed");
            server.notify_failure(id, &failure);
            false
        }
    }
}
