//! # Hybi Test
//!
//! Test utilities for hybi WebSocket servers.
//!
//! ## Key Features
//!
//! - **Raw client**: [`TestClient`] writes exact bytes and decodes server
//!   frames, so malformed input is as easy to send as valid input
//! - **In-memory transport**: [`memory_listener`] runs a server over duplex
//!   streams without binding a port
//! - **Recording delegate**: [`RecordingDelegate`] captures callbacks and
//!   lets tests wait for them
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use hybi_test::{RecordingDelegate, TestClient};
//! use hybi_ws::{ServerConfig, WebSocketServer};
//!
//! #[tokio::test]
//! async fn test_greeting() {
//!     let delegate = Arc::new(RecordingDelegate::new().with_greeting("hello"));
//!     let server = WebSocketServer::start_with_config(ServerConfig::default().port(0), &delegate)
//!         .await
//!         .unwrap();
//!
//!     let mut client = TestClient::connect(server.local_addr()).await.unwrap();
//!     assert!(client.handshake("/").await.unwrap().is_switching_protocols());
//!
//!     let frame = client.recv_frame().await.unwrap();
//!     assert_eq!(&frame.payload[..], b"hello");
//! }
//! ```

#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod client;
mod error;
mod memory;
mod recorder;

pub use client::{
    encode_client_frame, handshake_request, TestClient, TestHandshakeResponse, TEST_ACCEPT,
    TEST_KEY, TEST_MASK,
};
pub use error::TestError;
pub use memory::{memory_listener, MemoryConnector, MemoryListener};
pub use recorder::{Recorded, RecordingDelegate};
