//! WebSocket configuration.
//!
//! [`WebSocketConfig`] holds the per-connection limits and timers;
//! [`ServerConfig`] holds the listener and connection-set settings.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::handshake::DEFAULT_MAX_HANDSHAKE_SIZE;

/// Configuration for a single WebSocket connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketConfig {
    /// Maximum reassembled message size in bytes (default: 64 MB).
    pub max_message_size: usize,
    /// Maximum single frame payload in bytes (default: 16 MB).
    pub max_frame_size: usize,
    /// Maximum size of the opening handshake in bytes (default: 8 KB).
    pub max_handshake_size: usize,
    /// Time allowed for the opening handshake to complete (default: 10 seconds).
    pub handshake_timeout: Duration,
    /// Interval between server pings; `None` disables heartbeats (default: 30 seconds).
    pub heartbeat_interval: Option<Duration>,
    /// Close an open connection after this long without inbound traffic
    /// (default: 60 seconds). Only checked when heartbeats are enabled.
    pub connection_timeout: Duration,
    /// Read buffer size (default: 16 KB).
    pub read_buffer_size: usize,
    /// Longest a single flush of queued frames may block before the peer
    /// is treated as dead (default: 10 seconds).
    pub write_timeout: Duration,
    /// Frames that may wait in a connection's send queue. A connection
    /// whose queue is full is closed (default: 1024).
    pub send_queue_capacity: usize,
    /// Whether to accept unmasked frames from clients (default: false).
    pub accept_unmasked_frames: bool,
    /// Subprotocols the server is willing to speak, in preference order.
    pub protocols: Vec<String>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_message_size: 64 * 1024 * 1024, // 64 MB
            max_frame_size: 16 * 1024 * 1024,   // 16 MB
            max_handshake_size: DEFAULT_MAX_HANDSHAKE_SIZE,
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Some(Duration::from_secs(30)),
            connection_timeout: Duration::from_secs(60),
            read_buffer_size: 16 * 1024, // 16 KB
            write_timeout: Duration::from_secs(10),
            send_queue_capacity: 1024,
            accept_unmasked_frames: false,
            protocols: Vec::new(),
        }
    }
}

impl WebSocketConfig {
    /// Create a new default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum message size.
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Set the maximum frame size.
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Set the maximum handshake size.
    pub fn max_handshake_size(mut self, size: usize) -> Self {
        self.max_handshake_size = size;
        self
    }

    /// Set the handshake timeout.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the heartbeat interval. `None` disables pings and idle checks.
    pub fn heartbeat_interval(mut self, interval: Option<Duration>) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the idle connection timeout.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the read buffer size.
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Set the write timeout.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Set the send queue capacity.
    pub fn send_queue_capacity(mut self, capacity: usize) -> Self {
        self.send_queue_capacity = capacity;
        self
    }

    /// Set whether to accept unmasked frames from clients.
    pub fn accept_unmasked_frames(mut self, accept: bool) -> Self {
        self.accept_unmasked_frames = accept;
        self
    }

    /// Add a supported subprotocol.
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocols.push(protocol.into());
        self
    }
}

/// Configuration for the server and its connection set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind (default: 0.0.0.0).
    pub bind_addr: IpAddr,
    /// Port to listen on; 0 picks an ephemeral port (default: 9000).
    pub port: u16,
    /// Maximum simultaneous connections (default: 10000).
    pub max_connections: usize,
    /// Time to wait for connections to drain on shutdown (default: 30 seconds).
    pub shutdown_timeout: Duration,
    /// Per-connection settings.
    pub websocket: WebSocketConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 9000,
            max_connections: 10_000,
            shutdown_timeout: Duration::from_secs(30),
            websocket: WebSocketConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create a new default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bind address.
    pub fn bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the port.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the maximum number of simultaneous connections.
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the shutdown drain timeout.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Set the per-connection configuration.
    pub fn websocket(mut self, config: WebSocketConfig) -> Self {
        self.websocket = config;
        self
    }

    /// The socket address the server binds.
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }
}
