//! A raw WebSocket client for driving a server under test.
//!
//! The client writes bytes exactly as told and decodes whatever comes back,
//! so tests can send malformed handshakes and frames as easily as valid
//! ones.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use hybi_ws::frame::DEFAULT_MAX_PAYLOAD;
use hybi_ws::{decode_frame, CloseCode, Frame, Opcode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::TestError;

/// The sample nonce from the hybi drafts.
pub const TEST_KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

/// The accept key the server must answer [`TEST_KEY`] with.
pub const TEST_ACCEPT: &str = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";

/// Mask key used for every client frame.
pub const TEST_MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Build a well-formed handshake request for `path` with `key`.
pub fn handshake_request(path: &str, key: &str) -> String {
    format!(
        "GET {path} HTTP/1.1\r\n\
         Host: localhost\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Origin: http://localhost\r\n\
         Sec-WebSocket-Version: 8\r\n\
         \r\n"
    )
}

/// Encode a client frame. Unlike the server encoder this always masks and
/// takes the opcode as a raw byte, so invalid opcodes can be produced.
pub fn encode_client_frame(opcode: u8, fin: bool, payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 14);
    out.push((if fin { 0x80 } else { 0x00 }) | (opcode & 0x0f));

    let len = payload.len();
    if len < 126 {
        out.push(0x80 | len as u8);
    } else if len <= usize::from(u16::MAX) {
        out.push(0x80 | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(0x80 | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    out.extend_from_slice(&mask);
    out.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
    out
}

/// The status line and headers of a handshake response.
#[derive(Debug, Clone)]
pub struct TestHandshakeResponse {
    status: u16,
    reason: String,
    headers: HashMap<String, String>,
}

impl TestHandshakeResponse {
    fn parse(head: &str) -> Result<Self, TestError> {
        let mut lines = head.split("\r\n");
        let status_line = lines.next().unwrap_or_default();
        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/") {
            return Err(TestError::InvalidResponse(status_line.to_string()));
        }
        let status = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| TestError::InvalidResponse(status_line.to_string()))?;
        let reason = parts.next().unwrap_or_default().to_string();

        let mut headers = HashMap::new();
        for line in lines.filter(|l| !l.is_empty()) {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| TestError::InvalidResponse(line.to_string()))?;
            headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
        }

        Ok(Self {
            status,
            reason,
            headers,
        })
    }

    /// Returns the status code.
    #[must_use]
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Returns the reason phrase.
    #[must_use]
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Looks up a header, case-insensitively.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Returns true for `101 Switching Protocols`.
    #[must_use]
    pub fn is_switching_protocols(&self) -> bool {
        self.status == 101
    }
}

/// A WebSocket client speaking raw bytes over any stream.
///
/// # Example
///
/// ```ignore
/// use hybi_test::TestClient;
///
/// let mut client = TestClient::connect(server.local_addr()).await?;
/// let response = client.handshake("/").await?;
/// assert!(response.is_switching_protocols());
///
/// client.send_text("hello").await?;
/// let frame = client.recv_frame().await?;
/// ```
pub struct TestClient<S = TcpStream> {
    stream: S,
    buffer: BytesMut,
    timeout: Duration,
}

impl TestClient<TcpStream> {
    /// Opens a TCP connection to `addr`.
    pub async fn connect(addr: SocketAddr) -> Result<Self, TestError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

impl<S> TestClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps an already connected stream.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(4096),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Sets how long reads wait before failing.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sends a valid handshake for `path` and reads the response.
    pub async fn handshake(&mut self, path: &str) -> Result<TestHandshakeResponse, TestError> {
        self.send_raw(handshake_request(path, TEST_KEY).as_bytes())
            .await?;
        self.read_response().await
    }

    /// Reads one HTTP response head. Bytes after the blank line stay
    /// buffered for [`recv_frame`](Self::recv_frame).
    pub async fn read_response(&mut self) -> Result<TestHandshakeResponse, TestError> {
        loop {
            if let Some(end) = self
                .buffer
                .windows(4)
                .position(|w| w == b"\r\n\r\n")
            {
                let head = self.buffer.split_to(end + 4);
                let text = String::from_utf8_lossy(&head[..end]).into_owned();
                return TestHandshakeResponse::parse(&text);
            }
            if self.fill().await? == 0 {
                return Err(TestError::Closed);
            }
        }
    }

    /// Writes bytes as-is.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), TestError> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Sends a masked frame.
    pub async fn send_frame(
        &mut self,
        opcode: Opcode,
        fin: bool,
        payload: &[u8],
    ) -> Result<(), TestError> {
        let frame = encode_client_frame(opcode.as_u8(), fin, payload, TEST_MASK);
        self.send_raw(&frame).await
    }

    /// Sends a single-frame text message.
    pub async fn send_text(&mut self, text: &str) -> Result<(), TestError> {
        self.send_frame(Opcode::Text, true, text.as_bytes()).await
    }

    /// Sends a single-frame binary message.
    pub async fn send_binary(&mut self, data: &[u8]) -> Result<(), TestError> {
        self.send_frame(Opcode::Binary, true, data).await
    }

    /// Sends a close frame with `code`.
    pub async fn close(&mut self, code: CloseCode) -> Result<(), TestError> {
        self.send_frame(Opcode::Close, true, &code.as_u16().to_be_bytes())
            .await
    }

    /// Reads the next frame from the server.
    pub async fn recv_frame(&mut self) -> Result<Frame, TestError> {
        loop {
            if let Some((frame, consumed)) = decode_frame(&self.buffer, DEFAULT_MAX_PAYLOAD)? {
                self.buffer.advance(consumed);
                return Ok(frame);
            }
            if self.fill().await? == 0 {
                return Err(TestError::Closed);
            }
        }
    }

    /// Reads until the server closes the socket, discarding any frames.
    pub async fn expect_closed(&mut self) -> Result<(), TestError> {
        loop {
            match self.fill().await {
                Ok(0) => return Ok(()),
                Ok(_) => self.buffer.clear(),
                Err(TestError::Io(_)) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Returns the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }

    async fn fill(&mut self) -> Result<usize, TestError> {
        let read = tokio::time::timeout(self.timeout, self.stream.read_buf(&mut self.buffer))
            .await
            .map_err(|_| TestError::Timeout(self.timeout))?;
        Ok(read?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_client_frame_short() {
        let frame = encode_client_frame(0x1, true, b"Hi", [1, 2, 3, 4]);
        assert_eq!(frame, vec![0x81, 0x82, 1, 2, 3, 4, b'H' ^ 1, b'i' ^ 2]);
    }

    #[test]
    fn test_encode_client_frame_extended_lengths() {
        let medium = encode_client_frame(0x2, true, &[0u8; 200], TEST_MASK);
        assert_eq!(medium[1], 0x80 | 126);
        assert_eq!(u16::from_be_bytes([medium[2], medium[3]]), 200);

        let large = encode_client_frame(0x2, false, &vec![0u8; 70_000], TEST_MASK);
        assert_eq!(large[0], 0x02);
        assert_eq!(large[1], 0x80 | 127);
        assert_eq!(large.len(), 2 + 8 + 4 + 70_000);
    }

    #[test]
    fn test_parse_response_head() {
        let response = TestHandshakeResponse::parse(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nSec-WebSocket-Accept: abc",
        )
        .unwrap();
        assert!(response.is_switching_protocols());
        assert_eq!(response.reason(), "Switching Protocols");
        assert_eq!(response.header("sec-websocket-accept"), Some("abc"));
        assert_eq!(response.header("UPGRADE"), Some("websocket"));
    }

    #[test]
    fn test_parse_response_rejects_garbage() {
        assert!(TestHandshakeResponse::parse("garbage").is_err());
    }

    #[tokio::test]
    async fn test_client_reads_frames_after_response() {
        let (client_side, mut server_side) = tokio::io::duplex(1024);
        let mut client = TestClient::new(client_side);

        let mut reply = b"HTTP/1.1 101 Switching Protocols\r\n\r\n".to_vec();
        reply.extend_from_slice(&[0x81, 0x02, b'h', b'i']);
        server_side.write_all(&reply).await.unwrap();

        let response = client.read_response().await.unwrap();
        assert_eq!(response.status(), 101);

        let frame = client.recv_frame().await.unwrap();
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(&frame.payload[..], b"hi");
    }

    #[tokio::test]
    async fn test_handshake_and_close_against_scripted_peer() {
        let response =
            format!("HTTP/1.1 101 Switching Protocols\r\nSec-WebSocket-Accept: {TEST_ACCEPT}\r\n\r\n");
        let close = encode_client_frame(0x8, true, &1000u16.to_be_bytes(), TEST_MASK);
        let stream = tokio_test::io::Builder::new()
            .write(handshake_request("/chat", TEST_KEY).as_bytes())
            .read(response.as_bytes())
            .read(&[0x82, 0x03, 1, 2, 3])
            .write(&close)
            .build();
        let mut client = TestClient::new(stream);

        let response = client.handshake("/chat").await.unwrap();
        assert!(response.is_switching_protocols());
        assert_eq!(response.header("Sec-WebSocket-Accept"), Some(TEST_ACCEPT));

        let frame = client.recv_frame().await.unwrap();
        assert_eq!(frame.opcode, Opcode::Binary);
        assert_eq!(&frame.payload[..], &[1, 2, 3]);

        client.close(CloseCode::Normal).await.unwrap();
    }

    #[tokio::test]
    async fn test_expect_closed_on_eof() {
        let (client_side, server_side) = tokio::io::duplex(64);
        let mut client = TestClient::new(client_side);
        drop(server_side);
        client.expect_closed().await.unwrap();
    }
}
