//! A hybi-10 WebSocket server engine.
//!
//! This crate accepts TCP clients, performs the draft-10 opening handshake,
//! parses and produces frames, and delivers complete messages to a
//! [`WebSocketDelegate`]. Any number of clients can be connected at once;
//! the server can send to one of them or broadcast to all.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use hybi_ws::{ConnectionId, HandshakeRequest, Message, Target, WebSocketDelegate, WebSocketServer};
//!
//! struct Greeter;
//!
//! impl WebSocketDelegate for Greeter {
//!     fn on_accept(&self, _: &WebSocketServer, _: ConnectionId, _: &HandshakeRequest) -> Option<Message> {
//!         Some(Message::text("hello"))
//!     }
//!
//!     fn on_data(&self, server: &WebSocketServer, id: ConnectionId, message: Message) {
//!         server.send(message, Target::One(id));
//!     }
//! }
//!
//! let delegate = Arc::new(Greeter);
//! let server = WebSocketServer::start(9000, &delegate).await?;
//! server.wait().await?;
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ WebSocketServer                                              │
//! │                                                              │
//! │  Listener ──► accept loop ──► register ──► connection set    │
//! │                                   │        (DashMap)         │
//! │                                   ▼                          │
//! │                           connection task                    │
//! │      socket bytes ──► Connection (state machine) ──► events  │
//! │      mailbox  ◄── send / close_connection / shutdown         │
//! │                                   │                          │
//! │                                   ▼                          │
//! │                          WebSocketDelegate                   │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Layers
//!
//! - [`frame`]: pure frame codec ([`decode_frame`], [`encode_frame`])
//! - [`handshake`]: request parsing and the 101 response
//! - [`connection`]: the per-client state machine, free of I/O
//! - [`server`]: listener, connection set, send and broadcast

pub mod config;
pub mod connection;
pub mod delegate;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod message;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod transport;

mod driver;

pub use config::{ServerConfig, WebSocketConfig};
pub use connection::{Connection, ConnectionEvent, ConnectionId, ConnectionState, StateCell};
pub use delegate::{Failure, FailureKind, WebSocketDelegate};
pub use error::{CloseCode, WsError, WsResult};
pub use frame::{apply_mask, decode_frame, encode_frame, Frame, FrameError, Opcode};
pub use handshake::{
    build_response, compute_accept_key, select_protocol, try_parse_handshake, HandshakeError,
    HandshakeRequest,
};
pub use message::{CloseFrame, FrameData, Message};
pub use server::{ConnectionInfo, ConnectionStats, Target, WebSocketServer};
pub use transport::Listener;
