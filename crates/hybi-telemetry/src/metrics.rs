//! Prometheus metrics export.
//!
//! `hybi-ws` records through the `metrics` facade; this module installs the
//! Prometheus recorder those calls land in and, optionally, an HTTP
//! listener serving the text exposition format.
//!
//! # Standard Metrics
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `hybi_connections_accepted_total` | Counter | - | Sockets accepted |
//! | `hybi_connections_rejected_total` | Counter | - | Sockets dropped at the connection limit |
//! | `hybi_connections_active` | Gauge | - | Connections in the set |
//! | `hybi_handshake_failures_total` | Counter | - | Invalid or late handshakes |
//! | `hybi_frame_failures_total` | Counter | - | Connections dropped for bad frames |
//! | `hybi_messages_received_total` | Counter | `type` | Messages delivered to the delegate |
//! | `hybi_messages_sent_total` | Counter | - | Frames queued for sending |

use crate::error::TelemetryError;
use crate::TelemetryResult;
use hybi_ws::metrics as names;
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;

/// Global metrics handle for rendering.
static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metrics configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsConfig {
    /// Whether metrics are recorded at all.
    pub enabled: bool,

    /// Address to serve `/metrics` on. `None` records without serving;
    /// use [`render_metrics`] to read the values.
    pub addr: Option<String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            addr: Some("0.0.0.0:9090".to_string()),
        }
    }
}

/// Installs the global Prometheus recorder.
///
/// With an address configured the exporter task is spawned on the current
/// Tokio runtime, so this must then be called from within one.
///
/// # Errors
///
/// Returns `TelemetryError::InvalidAddress` for an unparsable address and
/// `TelemetryError::MetricsInit` if a recorder is already installed.
pub fn init_metrics(config: &MetricsConfig) -> TelemetryResult<()> {
    if !config.enabled {
        return Ok(());
    }

    let handle = match &config.addr {
        Some(addr) => {
            let addr: SocketAddr = addr
                .parse()
                .map_err(|e| TelemetryError::InvalidAddress(format!("{addr}: {e}")))?;

            let (recorder, exporter) = PrometheusBuilder::new()
                .with_http_listener(addr)
                .build()
                .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
            let handle = recorder.handle();
            metrics::set_global_recorder(recorder)
                .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;

            tokio::spawn(async move {
                if let Err(e) = exporter.await {
                    tracing::error!(error = ?e, "Metrics exporter stopped");
                }
            });
            tracing::info!(addr = %addr, "Serving Prometheus metrics");
            handle
        }
        None => PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?,
    };

    let _ = METRICS_HANDLE.set(handle);
    register_metric_descriptions();

    Ok(())
}

/// Renders metrics in Prometheus format.
///
/// Returns `None` if metrics are not initialized.
#[must_use]
pub fn render_metrics() -> Option<String> {
    METRICS_HANDLE.get().map(PrometheusHandle::render)
}

fn register_metric_descriptions() {
    describe_counter!(
        names::CONNECTIONS_ACCEPTED,
        "Sockets accepted by the WebSocket listener"
    );
    describe_counter!(
        names::CONNECTIONS_REJECTED,
        "Sockets dropped because the connection limit was reached"
    );
    describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Connections currently handshaking or open"
    );
    describe_counter!(
        names::HANDSHAKE_FAILURES,
        "Connections dropped for an invalid or late handshake"
    );
    describe_counter!(
        names::FRAME_FAILURES,
        "Connections dropped for a malformed frame"
    );
    describe_counter!(
        names::MESSAGES_RECEIVED,
        "Complete messages delivered to the delegate"
    );
    describe_counter!(names::MESSAGES_SENT, "Frames queued for sending");
}
