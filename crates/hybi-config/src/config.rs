//! Top-level configuration.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use hybi_telemetry::{LogConfig, MetricsConfig, TelemetryConfig};
use hybi_ws::{ServerConfig, WebSocketConfig};
use serde::{Deserialize, Serialize};

use crate::{ConfigError, LogFormat, LoggingSection, MetricsSection, ServerSection, WebSocketSection};

/// Complete hybi server configuration.
///
/// Use [`ConfigLoader`](crate::ConfigLoader) to load it from files and
/// environment variables.
///
/// # Example
///
/// ```
/// use hybi_config::HybiConfig;
///
/// let config = HybiConfig::default();
/// assert_eq!(config.server.port, 9000);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields)]
pub struct HybiConfig {
    /// Listener and connection-set settings.
    #[serde(default)]
    pub server: ServerSection,

    /// Per-connection protocol settings.
    #[serde(default)]
    pub websocket: WebSocketSection,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingSection,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsSection,
}

impl HybiConfig {
    /// Debug logging in pretty format.
    #[must_use]
    pub fn development() -> Self {
        Self {
            logging: LoggingSection {
                level: "debug".to_string(),
                format: LogFormat::Pretty,
                span_events: true,
                file_line_info: true,
                ..LoggingSection::default()
            },
            ..Self::default()
        }
    }

    /// JSON logging and metrics enabled.
    #[must_use]
    pub fn production() -> Self {
        Self {
            metrics: MetricsSection {
                enabled: true,
                ..MetricsSection::default()
            },
            ..Self::default()
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bind_ip()?;

        if self.server.max_connections == 0 {
            return Err(ConfigError::invalid_value(
                "server.max_connections",
                "must be greater than 0",
            ));
        }

        let ws = &self.websocket;
        for (field, value) in [
            ("websocket.max_message_size", ws.max_message_size),
            ("websocket.max_frame_size", ws.max_frame_size),
            ("websocket.max_handshake_size", ws.max_handshake_size),
            ("websocket.read_buffer_size", ws.read_buffer_size),
            ("websocket.send_queue_capacity", ws.send_queue_capacity),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid_value(field, "must be greater than 0"));
            }
        }
        if ws.handshake_timeout_ms == 0 {
            return Err(ConfigError::invalid_value(
                "websocket.handshake_timeout_ms",
                "must be greater than 0",
            ));
        }
        if ws.write_timeout_ms == 0 {
            return Err(ConfigError::invalid_value(
                "websocket.write_timeout_ms",
                "must be greater than 0",
            ));
        }
        if ws.heartbeat_interval_secs == Some(0) {
            return Err(ConfigError::invalid_value(
                "websocket.heartbeat_interval_secs",
                "must be greater than 0; omit it to disable heartbeats",
            ));
        }

        if self.logging.enabled {
            hybi_telemetry::logging::create_env_filter(&self.logging.level)
                .map_err(|e| ConfigError::invalid_value("logging.level", e.to_string()))?;
        }

        if self.metrics.enabled {
            if let Some(addr) = &self.metrics.addr {
                addr.parse::<SocketAddr>().map_err(|_| {
                    ConfigError::invalid_value(
                        "metrics.addr",
                        format!("invalid socket address: {addr}"),
                    )
                })?;
            }
        }

        Ok(())
    }

    /// Build the server settings.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if the bind address is not an IP.
    pub fn to_server_config(&self) -> Result<ServerConfig, ConfigError> {
        Ok(ServerConfig::default()
            .bind_addr(self.bind_ip()?)
            .port(self.server.port)
            .max_connections(self.server.max_connections)
            .shutdown_timeout(Duration::from_secs(self.server.shutdown_timeout_secs))
            .websocket(self.to_websocket_config()))
    }

    /// Build the per-connection settings.
    pub fn to_websocket_config(&self) -> WebSocketConfig {
        let ws = &self.websocket;
        let mut config = WebSocketConfig::default()
            .max_message_size(ws.max_message_size)
            .max_frame_size(ws.max_frame_size)
            .max_handshake_size(ws.max_handshake_size)
            .handshake_timeout(Duration::from_millis(ws.handshake_timeout_ms))
            .heartbeat_interval(ws.heartbeat_interval_secs.map(Duration::from_secs))
            .connection_timeout(Duration::from_secs(ws.connection_timeout_secs))
            .read_buffer_size(ws.read_buffer_size)
            .write_timeout(Duration::from_millis(ws.write_timeout_ms))
            .send_queue_capacity(ws.send_queue_capacity)
            .accept_unmasked_frames(ws.accept_unmasked_frames);
        for protocol in &ws.protocols {
            config = config.protocol(protocol.clone());
        }
        config
    }

    /// Build the logging and metrics settings.
    pub fn to_telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            logging: LogConfig {
                enabled: self.logging.enabled,
                level: self.logging.level.clone(),
                json_format: self.logging.format == LogFormat::Json,
                span_events: self.logging.span_events,
                file_line_info: self.logging.file_line_info,
                include_target: true,
            },
            metrics: MetricsConfig {
                enabled: self.metrics.enabled,
                addr: self.metrics.addr.clone(),
            },
        }
    }

    fn bind_ip(&self) -> Result<IpAddr, ConfigError> {
        self.server.bind_addr.parse().map_err(|_| {
            ConfigError::invalid_value(
                "server.bind_addr",
                format!("invalid IP address: {}", self.server.bind_addr),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_validates() {
        assert!(HybiConfig::default().validate().is_ok());
        assert!(HybiConfig::development().validate().is_ok());
        assert!(HybiConfig::production().validate().is_ok());
    }

    #[test]
    fn test_invalid_bind_addr() {
        let mut config = HybiConfig::default();
        config.server.bind_addr = "localhost:80".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("server.bind_addr"));
        assert!(config.to_server_config().is_err());
    }

    #[test]
    fn test_zero_limits_rejected() {
        let mut config = HybiConfig::default();
        config.server.max_connections = 0;
        assert!(config.validate().is_err());

        let mut config = HybiConfig::default();
        config.websocket.max_frame_size = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("websocket.max_frame_size"));

        let mut config = HybiConfig::default();
        config.websocket.heartbeat_interval_secs = Some(0);
        assert!(config.validate().is_err());

        let mut config = HybiConfig::default();
        config.websocket.write_timeout_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("websocket.write_timeout_ms"));

        let mut config = HybiConfig::default();
        config.websocket.send_queue_capacity = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("websocket.send_queue_capacity"));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = HybiConfig::default();
        config.logging.level = "hybi_ws=loud".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("logging.level"));
    }

    #[test]
    fn test_metrics_addr_checked_only_when_enabled() {
        let mut config = HybiConfig::default();
        config.metrics.addr = Some("nowhere".to_string());
        assert!(config.validate().is_ok());

        config.metrics.enabled = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_to_server_config() {
        let mut config = HybiConfig::default();
        config.server.bind_addr = "127.0.0.1".to_string();
        config.server.port = 0;
        config.server.max_connections = 3;
        config.websocket.handshake_timeout_ms = 250;
        config.websocket.heartbeat_interval_secs = None;
        config.websocket.protocols = vec!["chat".to_string()];
        config.websocket.write_timeout_ms = 750;
        config.websocket.send_queue_capacity = 8;

        let server = config.to_server_config().unwrap();
        assert_eq!(server.socket_addr(), "127.0.0.1:0".parse::<SocketAddr>().unwrap());
        assert_eq!(server.max_connections, 3);
        assert_eq!(server.websocket.handshake_timeout, Duration::from_millis(250));
        assert_eq!(server.websocket.heartbeat_interval, None);
        assert_eq!(server.websocket.protocols, vec!["chat".to_string()]);
        assert_eq!(server.websocket.write_timeout, Duration::from_millis(750));
        assert_eq!(server.websocket.send_queue_capacity, 8);
    }

    #[test]
    fn test_to_telemetry_config() {
        let telemetry = HybiConfig::development().to_telemetry_config();
        assert!(!telemetry.logging.json_format);
        assert_eq!(telemetry.logging.level, "debug");
        assert!(!telemetry.metrics.enabled);

        let telemetry = HybiConfig::production().to_telemetry_config();
        assert!(telemetry.logging.json_format);
        assert!(telemetry.metrics.enabled);
    }
}
