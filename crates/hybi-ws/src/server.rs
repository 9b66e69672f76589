//! The WebSocket server and its connection set.
//!
//! [`WebSocketServer`] owns the listener and a [`DashMap`] of live
//! connections. Each accepted socket gets its own task (see the driver
//! module) that owns the socket and the protocol state; the server only
//! keeps a handle with a command channel and a shared view of the state.
//! Sending therefore never touches a connection directly: the frame is
//! encoded once and the bytes are posted to each target's queue.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use hybi_ws::{ConnectionId, Message, Target, WebSocketDelegate, WebSocketServer};
//!
//! struct Echo;
//!
//! impl WebSocketDelegate for Echo {
//!     fn on_data(&self, server: &WebSocketServer, id: ConnectionId, message: Message) {
//!         server.send(message, Target::One(id));
//!     }
//! }
//!
//! let delegate = Arc::new(Echo);
//! let server = WebSocketServer::start(9000, &delegate).await?;
//! server.send("hello everyone", Target::All);
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::{ServerConfig, WebSocketConfig};
use crate::connection::{Connection, ConnectionId, ConnectionState, StateCell};
use crate::delegate::{Failure, FailureKind, WebSocketDelegate};
use crate::driver;
use crate::error::{CloseCode, WsError, WsResult};
use crate::frame::encode_frame;
use crate::handshake::HandshakeRequest;
use crate::message::{data_frame, FrameData, Message};
use crate::metrics;
use crate::shutdown::{ConnectionTracker, ShutdownSignal};
use crate::transport::{is_transient_accept_error, Listener};

/// Consecutive non-transient accept errors tolerated before the accept
/// loop gives up.
const MAX_ACCEPT_FAILURES: u32 = 10;

/// Pause after a non-transient accept error.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Which connections a send goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Every open connection.
    All,
    /// A single connection.
    One(ConnectionId),
}

/// A snapshot of one connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// The unique connection ID.
    pub id: ConnectionId,
    /// The client's address.
    pub peer_addr: SocketAddr,
    /// State at the time of the snapshot.
    pub state: ConnectionState,
    /// When the socket was accepted.
    pub connected_at: Instant,
}

impl ConnectionInfo {
    /// Get the connection duration.
    pub fn duration(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

/// Counters describing the server's history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Connections in the set (handshaking or open).
    pub active_connections: usize,
    /// Connections that completed the handshake and are still open.
    pub open_connections: usize,
    /// Sockets accepted and registered.
    pub total_accepted: usize,
    /// Sockets dropped because of the connection limit or shutdown.
    pub total_rejected: usize,
    /// Connections removed from the set.
    pub total_closed: usize,
    /// Connections dropped for an invalid or late handshake.
    pub handshake_failures: usize,
    /// Connections dropped for a malformed frame.
    pub frame_failures: usize,
}

/// The receiving ends a connection task drains.
pub(crate) struct Mailbox {
    /// Encoded frames to write, in order.
    pub(crate) outbound: mpsc::Receiver<Bytes>,
    /// Latest close request, if any.
    pub(crate) close_requests: watch::Receiver<Option<CloseCode>>,
}

/// The server's view of a connection owned by a driver task.
struct ConnectionHandle {
    peer_addr: SocketAddr,
    state: StateCell,
    connected_at: Instant,
    outbound: mpsc::Sender<Bytes>,
    close_requests: watch::Sender<Option<CloseCode>>,
}

impl ConnectionHandle {
    fn new(peer_addr: SocketAddr, connection: &Connection, capacity: usize) -> (Self, Mailbox) {
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity.max(1));
        let (close_tx, close_rx) = watch::channel(None);
        let handle = Self {
            peer_addr,
            state: connection.state_cell(),
            connected_at: connection.connected_at(),
            outbound: outbound_tx,
            close_requests: close_tx,
        };
        let mailbox = Mailbox {
            outbound: outbound_rx,
            close_requests: close_rx,
        };
        (handle, mailbox)
    }

    /// Queue an encoded frame. Never waits: a connection whose queue is
    /// full is asked to close instead.
    fn post(&self, id: ConnectionId, frame: &Bytes) -> WsResult<()> {
        let state = self.state.get();
        if state != ConnectionState::Open {
            return Err(WsError::not_open(state));
        }
        match self.outbound.try_send(frame.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(connection_id = %id, peer = %self.peer_addr, "Send queue full, closing slow connection");
                self.request_close(CloseCode::PolicyViolation);
                Err(WsError::not_open(ConnectionState::Closing))
            }
            Err(TrySendError::Closed(_)) => Err(WsError::not_open(ConnectionState::Closed)),
        }
    }

    fn request_close(&self, code: CloseCode) {
        self.close_requests.send_replace(Some(code));
    }
}

struct Inner {
    config: ServerConfig,
    websocket: Arc<WebSocketConfig>,
    local_addr: SocketAddr,
    connections: DashMap<ConnectionId, ConnectionHandle>,
    delegate: RwLock<Weak<dyn WebSocketDelegate>>,
    shutdown: ShutdownSignal,
    tracker: ConnectionTracker,
    accept_task: Mutex<Option<JoinHandle<WsResult<()>>>>,
    total_accepted: AtomicUsize,
    total_rejected: AtomicUsize,
    total_closed: AtomicUsize,
    handshake_failures: AtomicUsize,
    frame_failures: AtomicUsize,
}

/// A running WebSocket server.
///
/// Cheap to clone; every clone refers to the same server. The server keeps
/// running until [`shutdown`](Self::shutdown) is called or the accept loop
/// fails.
#[derive(Clone)]
pub struct WebSocketServer {
    inner: Arc<Inner>,
}

impl fmt::Debug for WebSocketServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketServer")
            .field("local_addr", &self.inner.local_addr)
            .field("connections", &self.inner.connections.len())
            .field("shutdown", &self.inner.shutdown.is_shutdown())
            .finish_non_exhaustive()
    }
}

impl WebSocketServer {
    /// Listen on `port` on all interfaces with default settings.
    pub async fn start<D: WebSocketDelegate>(port: u16, delegate: &Arc<D>) -> WsResult<Self> {
        Self::start_with_config(ServerConfig::default().port(port), delegate).await
    }

    /// Bind the configured address and start accepting.
    pub async fn start_with_config<D: WebSocketDelegate>(
        config: ServerConfig,
        delegate: &Arc<D>,
    ) -> WsResult<Self> {
        let addr = config.socket_addr();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| WsError::bind(addr, e))?;
        Self::serve(listener, config, delegate)
    }

    /// Start accepting on an existing listener.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn serve<L: Listener, D: WebSocketDelegate>(
        listener: L,
        config: ServerConfig,
        delegate: &Arc<D>,
    ) -> WsResult<Self> {
        let local_addr = listener.local_addr()?;
        let weak = Arc::downgrade(delegate) as Weak<dyn WebSocketDelegate>;
        let server = Self {
            inner: Arc::new(Inner {
                websocket: Arc::new(config.websocket.clone()),
                config,
                local_addr,
                connections: DashMap::new(),
                delegate: RwLock::new(weak),
                shutdown: ShutdownSignal::new(),
                tracker: ConnectionTracker::new(),
                accept_task: Mutex::new(None),
                total_accepted: AtomicUsize::new(0),
                total_rejected: AtomicUsize::new(0),
                total_closed: AtomicUsize::new(0),
                handshake_failures: AtomicUsize::new(0),
                frame_failures: AtomicUsize::new(0),
            }),
        };

        info!(addr = %local_addr, max_connections = server.inner.config.max_connections, "WebSocket server listening");
        let task = tokio::spawn(accept_loop(server.clone(), listener));
        *server.inner.accept_task.lock() = Some(task);
        Ok(server)
    }

    /// The address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// The port the server is bound to.
    pub fn port(&self) -> u16 {
        self.inner.local_addr.port()
    }

    /// Get the configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Replace the delegate. Only a weak reference is kept.
    pub fn set_delegate<D: WebSocketDelegate>(&self, delegate: &Arc<D>) {
        let weak = Arc::downgrade(delegate) as Weak<dyn WebSocketDelegate>;
        *self.inner.delegate.write() = weak;
    }

    /// Encode `data` once and queue it on every targeted open connection.
    ///
    /// Returns the number of connections the frame was queued on. Targets
    /// that are not open are skipped. Control messages are not sent at all;
    /// use [`close_connection`](Self::close_connection) to close.
    pub fn send<T: FrameData>(&self, data: T, target: Target) -> usize {
        let frame = match data_frame(data) {
            Ok(frame) => encode_frame(&frame),
            Err(e) => {
                warn!(error = %e, "Refusing to send control message");
                return 0;
            }
        };
        let delivered = match target {
            Target::All => self
                .inner
                .connections
                .iter()
                .filter(|entry| entry.post(*entry.key(), &frame).is_ok())
                .count(),
            Target::One(id) => self
                .inner
                .connections
                .get(&id)
                .map_or(0, |entry| usize::from(entry.post(id, &frame).is_ok())),
        };
        trace!(target = ?target, delivered, len = frame.len(), "Frame queued");
        if delivered > 0 {
            metrics::record_messages_sent(delivered);
        }
        delivered
    }

    /// Queue `data` on one connection, reporting why it could not be.
    pub fn send_to<T: FrameData>(&self, id: ConnectionId, data: T) -> WsResult<()> {
        if self.is_shutdown() {
            return Err(WsError::ShuttingDown);
        }
        let entry = self
            .inner
            .connections
            .get(&id)
            .ok_or_else(|| WsError::connection_not_found(id))?;
        let frame = encode_frame(&data_frame(data)?);
        entry.post(id, &frame)?;
        metrics::record_messages_sent(1);
        Ok(())
    }

    /// Ask one connection to close.
    pub fn close_connection(&self, id: ConnectionId, code: CloseCode) -> WsResult<()> {
        let entry = self
            .inner
            .connections
            .get(&id)
            .ok_or_else(|| WsError::connection_not_found(id))?;
        entry.request_close(code);
        Ok(())
    }

    /// Connections that are handshaking or open.
    pub fn connection_count(&self) -> usize {
        self.inner
            .connections
            .iter()
            .filter(|entry| entry.state.get().is_live())
            .count()
    }

    /// Whether at least one connection is open.
    pub fn is_connected(&self) -> bool {
        self.inner
            .connections
            .iter()
            .any(|entry| entry.state.get() == ConnectionState::Open)
    }

    /// IDs of all connections in the set.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.inner.connections.iter().map(|e| *e.key()).collect()
    }

    /// Snapshot of one connection.
    pub fn connection_info(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.inner.connections.get(&id).map(|entry| ConnectionInfo {
            id,
            peer_addr: entry.peer_addr,
            state: entry.state.get(),
            connected_at: entry.connected_at,
        })
    }

    /// Get statistics about the server.
    pub fn stats(&self) -> ConnectionStats {
        let mut open = 0;
        for entry in self.inner.connections.iter() {
            if entry.state.get() == ConnectionState::Open {
                open += 1;
            }
        }

        ConnectionStats {
            active_connections: self.inner.connections.len(),
            open_connections: open,
            total_accepted: self.inner.total_accepted.load(Ordering::Relaxed),
            total_rejected: self.inner.total_rejected.load(Ordering::Relaxed),
            total_closed: self.inner.total_closed.load(Ordering::Relaxed),
            handshake_failures: self.inner.handshake_failures.load(Ordering::Relaxed),
            frame_failures: self.inner.frame_failures.load(Ordering::Relaxed),
        }
    }

    /// Check if shutdown has been triggered.
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.is_shutdown()
    }

    /// Stop accepting, close every connection with `GoingAway`, and wait
    /// up to the configured shutdown timeout for connection tasks to end.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.trigger() {
            info!(
                connections = self.inner.connections.len(),
                "Shutting down WebSocket server"
            );
        }

        let timeout = self.inner.config.shutdown_timeout;
        if tokio::time::timeout(timeout, self.inner.tracker.wait_for_shutdown())
            .await
            .is_ok()
        {
            info!("All connections closed");
        } else {
            warn!(
                remaining = self.inner.tracker.active_connections(),
                timeout = ?timeout,
                "Shutdown timeout elapsed with connections still running"
            );
        }
    }

    /// Wait for the accept loop to end. Returns the error that stopped it,
    /// if any. Only the first caller observes the outcome; later calls
    /// return `Ok(())` immediately.
    pub async fn wait(&self) -> WsResult<()> {
        let task = self.inner.accept_task.lock().take();
        let Some(task) = task else {
            return Ok(());
        };
        task.await
            .map_err(|e| WsError::internal(format!("accept loop panicked: {e}")))?
    }

    pub(crate) fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.inner.shutdown
    }

    fn delegate(&self) -> Option<Arc<dyn WebSocketDelegate>> {
        let delegate = self.inner.delegate.read().upgrade();
        if delegate.is_none() {
            trace!("Delegate dropped, event discarded");
        }
        delegate
    }

    fn register<S>(&self, socket: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let inner = &self.inner;

        if inner.shutdown.is_shutdown() {
            inner.total_rejected.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let current = inner.connections.len();
        if current >= inner.config.max_connections {
            inner.total_rejected.fetch_add(1, Ordering::Relaxed);
            metrics::record_rejected();
            warn!(
                peer = %peer,
                current = current,
                max = inner.config.max_connections,
                "Connection limit reached, dropping socket"
            );
            return;
        }

        let connection = Connection::new(Arc::clone(&inner.websocket));
        let id = connection.id();
        let (handle, mailbox) =
            ConnectionHandle::new(peer, &connection, inner.websocket.send_queue_capacity);
        inner.connections.insert(id, handle);
        inner.total_accepted.fetch_add(1, Ordering::Relaxed);
        metrics::record_accepted();
        debug!(connection_id = %id, peer = %peer, total = inner.connections.len(), "Connection accepted");

        let token = inner.tracker.acquire();
        let server = self.clone();
        tokio::spawn(async move {
            driver::run(server, socket, peer, connection, mailbox).await;
            drop(token);
        });
    }

    pub(crate) fn notify_accept(
        &self,
        id: ConnectionId,
        request: &HandshakeRequest,
    ) -> Option<Message> {
        self.delegate()
            .and_then(|delegate| delegate.on_accept(self, id, request))
    }

    pub(crate) fn notify_data(&self, id: ConnectionId, message: Message) {
        metrics::record_message_received(&message);
        if let Some(delegate) = self.delegate() {
            delegate.on_data(self, id, message);
        }
    }

    pub(crate) fn notify_failure(&self, id: ConnectionId, failure: &Failure) {
        match failure.kind {
            FailureKind::Handshake => {
                self.inner.handshake_failures.fetch_add(1, Ordering::Relaxed);
                metrics::record_handshake_failure();
            }
            FailureKind::Frame => {
                self.inner.frame_failures.fetch_add(1, Ordering::Relaxed);
                metrics::record_frame_failure();
            }
        }
        if let Some(delegate) = self.delegate() {
            delegate.on_failure(self, id, failure);
        }
    }

    /// Remove a connection from the set. Safe to call more than once; only
    /// the first call has any effect. The disconnect callback is raised
    /// only for connections that had opened.
    pub(crate) fn release(&self, id: ConnectionId, opened: bool) {
        let Some((_, handle)) = self.inner.connections.remove(&id) else {
            return;
        };
        self.inner.total_closed.fetch_add(1, Ordering::Relaxed);
        metrics::record_removed();
        debug!(
            connection_id = %id,
            peer = %handle.peer_addr,
            remaining = self.inner.connections.len(),
            "Connection removed"
        );
        drop(handle);

        if opened && !std::thread::panicking() {
            if let Some(delegate) = self.delegate() {
                delegate.on_disconnect(self, id);
            }
        }
    }
}

async fn accept_loop<L: Listener>(server: WebSocketServer, mut listener: L) -> WsResult<()> {
    let shutdown = server.shutdown_signal().clone();
    let stopped = shutdown.recv();
    tokio::pin!(stopped);
    let mut failures = 0u32;

    loop {
        tokio::select! {
            biased;

            () = &mut stopped => {
                info!("Accept loop stopped");
                return Ok(());
            }

            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    failures = 0;
                    server.register(socket, peer);
                }
                Err(e) if is_transient_accept_error(&e) => {
                    debug!(error = %e, "Transient accept error");
                }
                Err(e) => {
                    failures += 1;
                    if failures >= MAX_ACCEPT_FAILURES {
                        error!(error = %e, failures = failures, "Accept keeps failing, stopping listener");
                        return Err(WsError::Io(e));
                    }
                    warn!(error = %e, failures = failures, "Accept failed, backing off");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    struct Silent;

    impl WebSocketDelegate for Silent {
        fn on_data(&self, _server: &WebSocketServer, _id: ConnectionId, _message: Message) {}
    }

    fn local_config() -> ServerConfig {
        ServerConfig::default()
            .bind_addr(IpAddr::V4(Ipv4Addr::LOCALHOST))
            .port(0)
            .shutdown_timeout(Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_start_binds_ephemeral_port() {
        let delegate = Arc::new(Silent);
        let server = WebSocketServer::start_with_config(local_config(), &delegate)
            .await
            .unwrap();

        assert_ne!(server.port(), 0);
        assert_eq!(server.local_addr().ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(server.connection_count(), 0);
        assert!(!server.is_connected());
        assert_eq!(server.stats(), ConnectionStats::default());

        server.shutdown().await;
        assert!(server.is_shutdown());
        server.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_is_returned() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let delegate = Arc::new(Silent);
        let result =
            WebSocketServer::start_with_config(local_config().port(port), &delegate).await;
        assert!(matches!(result, Err(WsError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_send_without_connections() {
        let delegate = Arc::new(Silent);
        let server = WebSocketServer::start_with_config(local_config(), &delegate)
            .await
            .unwrap();

        assert_eq!(server.send("hello", Target::All), 0);
        assert_eq!(server.send("hello", Target::One(ConnectionId::new())), 0);
        assert!(matches!(
            server.send_to(ConnectionId::new(), "hello"),
            Err(WsError::ConnectionNotFound { .. })
        ));
        assert!(matches!(
            server.close_connection(ConnectionId::new(), CloseCode::Normal),
            Err(WsError::ConnectionNotFound { .. })
        ));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let delegate = Arc::new(Silent);
        let server = WebSocketServer::start_with_config(local_config(), &delegate)
            .await
            .unwrap();

        let connection = Connection::new(Arc::new(WebSocketConfig::default()));
        let id = connection.id();
        let (handle, _mailbox) = ConnectionHandle::new(server.local_addr(), &connection, 1);
        server.inner.connections.insert(id, handle);
        assert_eq!(server.connection_count(), 1);

        server.release(id, false);
        server.release(id, false);
        assert_eq!(server.connection_count(), 0);
        assert_eq!(server.stats().total_closed, 1);

        server.shutdown().await;
    }

    #[test]
    fn test_full_send_queue_requests_close() {
        let mut connection = Connection::new(Arc::new(WebSocketConfig::default()));
        let events = connection.on_bytes_received(
            b"GET / HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\n\
              Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 8\r\n\r\n",
        );
        assert_eq!(events.len(), 1);
        assert!(connection.is_open());

        let id = connection.id();
        let peer = SocketAddr::from((Ipv4Addr::LOCALHOST, 9000));
        let (handle, mut mailbox) = ConnectionHandle::new(peer, &connection, 1);
        let frame = Bytes::from_static(&[0x81, 0x02, b'h', b'i']);

        handle.post(id, &frame).unwrap();
        assert!(mailbox.close_requests.borrow().is_none());

        let err = handle.post(id, &frame).unwrap_err();
        assert!(matches!(
            err,
            WsError::NotOpen {
                state: ConnectionState::Closing
            }
        ));
        assert_eq!(
            *mailbox.close_requests.borrow(),
            Some(CloseCode::PolicyViolation)
        );

        assert_eq!(mailbox.outbound.try_recv().unwrap(), frame);
        assert!(mailbox.outbound.try_recv().is_err());
    }

    #[test]
    fn test_post_refused_before_open() {
        let connection = Connection::new(Arc::new(WebSocketConfig::default()));
        let peer = SocketAddr::from((Ipv4Addr::LOCALHOST, 9000));
        let (handle, mut mailbox) = ConnectionHandle::new(peer, &connection, 4);

        let err = handle
            .post(connection.id(), &Bytes::from_static(b"x"))
            .unwrap_err();
        assert!(matches!(
            err,
            WsError::NotOpen {
                state: ConnectionState::Handshaking
            }
        ));
        assert!(mailbox.outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_wait_second_call_returns_immediately() {
        let delegate = Arc::new(Silent);
        let server = WebSocketServer::start_with_config(local_config(), &delegate)
            .await
            .unwrap();
        server.shutdown().await;
        assert!(matches!(
            server.send_to(ConnectionId::new(), "late"),
            Err(WsError::ShuttingDown)
        ));
        server.wait().await.unwrap();
        server.wait().await.unwrap();
    }
}
