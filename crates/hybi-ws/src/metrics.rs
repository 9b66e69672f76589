//! Metric names and recording helpers.
//!
//! Recording goes through the `metrics` facade and is a no-op until a
//! recorder is installed (see `hybi-telemetry`).
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `hybi_connections_accepted_total` | Counter | - |
//! | `hybi_connections_rejected_total` | Counter | - |
//! | `hybi_connections_active` | Gauge | - |
//! | `hybi_handshake_failures_total` | Counter | - |
//! | `hybi_frame_failures_total` | Counter | - |
//! | `hybi_messages_received_total` | Counter | `type` |
//! | `hybi_messages_sent_total` | Counter | - |

use metrics::{counter, gauge};

use crate::message::Message;

/// Sockets accepted by the listener.
pub const CONNECTIONS_ACCEPTED: &str = "hybi_connections_accepted_total";
/// Sockets closed on arrival because the connection limit was reached.
pub const CONNECTIONS_REJECTED: &str = "hybi_connections_rejected_total";
/// Connections currently in the connection set.
pub const CONNECTIONS_ACTIVE: &str = "hybi_connections_active";
/// Handshakes that were invalid or timed out.
pub const HANDSHAKE_FAILURES: &str = "hybi_handshake_failures_total";
/// Connections dropped for malformed frames.
pub const FRAME_FAILURES: &str = "hybi_frame_failures_total";
/// Data messages delivered to the delegate.
pub const MESSAGES_RECEIVED: &str = "hybi_messages_received_total";
/// Frames queued by `send`.
pub const MESSAGES_SENT: &str = "hybi_messages_sent_total";

pub(crate) fn record_accepted() {
    counter!(CONNECTIONS_ACCEPTED).increment(1);
    gauge!(CONNECTIONS_ACTIVE).increment(1.0);
}

pub(crate) fn record_rejected() {
    counter!(CONNECTIONS_REJECTED).increment(1);
}

pub(crate) fn record_removed() {
    gauge!(CONNECTIONS_ACTIVE).decrement(1.0);
}

pub(crate) fn record_handshake_failure() {
    counter!(HANDSHAKE_FAILURES).increment(1);
}

pub(crate) fn record_frame_failure() {
    counter!(FRAME_FAILURES).increment(1);
}

pub(crate) fn record_message_received(message: &Message) {
    let kind = if message.is_text() { "text" } else { "binary" };
    counter!(MESSAGES_RECEIVED, "type" => kind).increment(1);
}

pub(crate) fn record_messages_sent(count: usize) {
    counter!(MESSAGES_SENT).increment(count as u64);
}
