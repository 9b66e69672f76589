//! Configuration schema types.
//!
//! Every section rejects unknown fields and fills missing ones with
//! defaults, so a file only needs the values it changes.

use serde::{Deserialize, Serialize};

/// Listener and connection-set settings.
///
/// # Example
///
/// ```
/// use hybi_config::ServerSection;
///
/// let section: ServerSection = toml::from_str("port = 8080").unwrap();
/// assert_eq!(section.port, 8080);
/// assert_eq!(section.bind_addr, "0.0.0.0");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ServerSection {
    /// IP address to bind.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// TCP port. 0 picks an ephemeral port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum number of simultaneous connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: default_port(),
            max_connections: default_max_connections(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9000
}

fn default_max_connections() -> usize {
    10_000
}

fn default_shutdown_timeout() -> u64 {
    30
}

/// Per-connection protocol settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct WebSocketSection {
    /// Largest reassembled message in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Largest single frame payload in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Largest handshake request in bytes.
    #[serde(default = "default_max_handshake_size")]
    pub max_handshake_size: usize,

    /// Time allowed to complete the handshake, in milliseconds.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,

    /// Ping interval in seconds. None disables heartbeats.
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: Option<u64>,

    /// Idle time in seconds after which an open connection is closed.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,

    /// Socket read buffer size in bytes.
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,

    /// Time allowed for one write to the socket, in milliseconds.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,

    /// Encoded frames that may wait for a connection before it is closed
    /// as too slow.
    #[serde(default = "default_send_queue_capacity")]
    pub send_queue_capacity: usize,

    /// Accept client frames without a mask.
    #[serde(default)]
    pub accept_unmasked_frames: bool,

    /// Subprotocols the server offers, in preference order.
    #[serde(default)]
    pub protocols: Vec<String>,
}

impl Default for WebSocketSection {
    fn default() -> Self {
        Self {
            max_message_size: default_max_message_size(),
            max_frame_size: default_max_frame_size(),
            max_handshake_size: default_max_handshake_size(),
            handshake_timeout_ms: default_handshake_timeout(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            connection_timeout_secs: default_connection_timeout(),
            read_buffer_size: default_read_buffer_size(),
            write_timeout_ms: default_write_timeout(),
            send_queue_capacity: default_send_queue_capacity(),
            accept_unmasked_frames: false,
            protocols: Vec::new(),
        }
    }
}

fn default_max_message_size() -> usize {
    64 * 1024 * 1024
}

fn default_max_frame_size() -> usize {
    16 * 1024 * 1024
}

fn default_max_handshake_size() -> usize {
    hybi_ws::handshake::DEFAULT_MAX_HANDSHAKE_SIZE
}

fn default_handshake_timeout() -> u64 {
    10_000
}

#[allow(clippy::unnecessary_wraps)]
fn default_heartbeat_interval() -> Option<u64> {
    Some(30)
}

fn default_connection_timeout() -> u64 {
    60
}

fn default_read_buffer_size() -> usize {
    16 * 1024
}

fn default_write_timeout() -> u64 {
    10_000
}

fn default_send_queue_capacity() -> usize {
    1024
}

/// Log output format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format (production).
    #[default]
    Json,
    /// Human-readable format (development).
    Pretty,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct LoggingSection {
    /// Enable logging.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Filter directive (e.g. "info" or "hybi_ws=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format.
    #[serde(default)]
    pub format: LogFormat,

    /// Log span open and close events.
    #[serde(default)]
    pub span_events: bool,

    /// Include file and line numbers.
    #[serde(default)]
    pub file_line_info: bool,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            enabled: true,
            level: default_log_level(),
            format: LogFormat::default(),
            span_events: false,
            file_line_info: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MetricsSection {
    /// Enable metrics collection.
    #[serde(default)]
    pub enabled: bool,

    /// Prometheus endpoint address. Omit to record without serving.
    #[serde(default = "default_metrics_addr")]
    pub addr: Option<String>,
}

impl Default for MetricsSection {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: default_metrics_addr(),
        }
    }
}

#[allow(clippy::unnecessary_wraps)]
fn default_metrics_addr() -> Option<String> {
    Some("0.0.0.0:9090".to_string())
}
