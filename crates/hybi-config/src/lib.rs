//! Typed configuration for hybi servers.
//!
//! - TOML and JSON configuration files
//! - Environment variable overrides (`HYBI__SECTION__KEY`)
//! - Strict validation (fails on unknown fields)
//! - Layered configuration (defaults → file → env)
//!
//! The root [`HybiConfig`] converts into the runtime types of the other
//! crates: [`hybi_ws::ServerConfig`] and [`hybi_telemetry::TelemetryConfig`].
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! bind_addr = "0.0.0.0"
//! port = 9000
//! max_connections = 10000
//! shutdown_timeout_secs = 30
//!
//! [websocket]
//! max_message_size = 67108864
//! max_frame_size = 16777216
//! handshake_timeout_ms = 10000
//! heartbeat_interval_secs = 30
//! connection_timeout_secs = 60
//! write_timeout_ms = 10000
//! send_queue_capacity = 1024
//! protocols = ["chat"]
//!
//! [logging]
//! level = "info"
//! format = "json"
//!
//! [metrics]
//! enabled = true
//! addr = "0.0.0.0:9090"
//! ```

#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod config;
mod error;
mod loader;
mod schema;

pub use config::HybiConfig;
pub use error::ConfigError;
pub use loader::{ConfigLoader, DEFAULT_ENV_PREFIX};
pub use schema::{LogFormat, LoggingSection, MetricsSection, ServerSection, WebSocketSection};
