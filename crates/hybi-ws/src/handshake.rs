//! Opening handshake.
//!
//! The server reads an HTTP/1.1 upgrade request terminated by an empty line,
//! validates the headers the hybi drafts require, and answers with
//! `101 Switching Protocols` carrying the computed `Sec-WebSocket-Accept`.
//!
//! ```http
//! GET /chat HTTP/1.1
//! Host: server.example.com
//! Upgrade: websocket
//! Connection: Upgrade
//! Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==
//! Sec-WebSocket-Version: 8
//! ```

use std::collections::HashMap;
use std::time::Duration;

use base64::Engine;
use bytes::Bytes;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::{debug, instrument};

/// The GUID appended to the client key before hashing.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Default bound on the size of the request header block (8 KB).
pub const DEFAULT_MAX_HANDSHAKE_SIZE: usize = 8 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Reasons a handshake is rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// Request line is not `METHOD PATH HTTP/x.y`.
    #[error("malformed request line: {0:?}")]
    MalformedRequestLine(String),

    /// Header line without a colon or with an empty name.
    #[error("malformed header line: {0:?}")]
    MalformedHeader(String),

    /// Method other than GET.
    #[error("method must be GET, got '{0}'")]
    InvalidMethod(String),

    /// A required header is absent.
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),

    /// A required header has an unacceptable value.
    #[error("invalid {name} header: {value:?}")]
    InvalidHeader {
        /// Header name.
        name: &'static str,
        /// Value the client sent.
        value: String,
    },

    /// Header block is not valid UTF-8.
    #[error("request headers are not valid UTF-8")]
    InvalidEncoding,

    /// Header block grew past the configured bound.
    #[error("handshake exceeds {max} bytes")]
    TooLarge {
        /// Configured bound.
        max: usize,
    },

    /// The client did not finish the handshake in time.
    #[error("handshake not completed within {0:?}")]
    TimedOut(Duration),
}

/// A parsed and validated upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    method: String,
    path: String,
    version: String,
    /// Lowercased names; a repeated header keeps its last value.
    headers: HashMap<String, String>,
}

impl HandshakeRequest {
    /// Parse a header block (without the terminating blank line).
    fn parse(block: &[u8]) -> Result<Self, HandshakeError> {
        let text = std::str::from_utf8(block).map_err(|_| HandshakeError::InvalidEncoding)?;
        let mut lines = text.split("\r\n");

        let request_line = lines.next().unwrap_or_default();
        let mut parts = request_line.split(' ');
        let (Some(method), Some(path), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(HandshakeError::MalformedRequestLine(request_line.to_string()));
        };
        if method.is_empty() || path.is_empty() || !version.starts_with("HTTP/") {
            return Err(HandshakeError::MalformedRequestLine(request_line.to_string()));
        }

        let mut headers = HashMap::new();
        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                return Err(HandshakeError::MalformedHeader(line.to_string()));
            };
            let name = name.trim();
            if name.is_empty() {
                return Err(HandshakeError::MalformedHeader(line.to_string()));
            }
            headers.insert(name.to_ascii_lowercase(), value.trim().to_string());
        }

        Ok(Self {
            method: method.to_string(),
            path: path.to_string(),
            version: version.to_string(),
            headers,
        })
    }

    fn validate(&self) -> Result<(), HandshakeError> {
        if self.method != "GET" {
            return Err(HandshakeError::InvalidMethod(self.method.clone()));
        }

        self.required("host", "Host")?;

        let upgrade = self.required("upgrade", "Upgrade")?;
        if !upgrade.eq_ignore_ascii_case("websocket") {
            return Err(HandshakeError::InvalidHeader {
                name: "Upgrade",
                value: upgrade.to_string(),
            });
        }

        let connection = self.required("connection", "Connection")?;
        if !connection
            .split(',')
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        {
            return Err(HandshakeError::InvalidHeader {
                name: "Connection",
                value: connection.to_string(),
            });
        }

        self.required("sec-websocket-key", "Sec-WebSocket-Key")?;
        Ok(())
    }

    fn required(&self, key: &str, name: &'static str) -> Result<&str, HandshakeError> {
        match self.headers.get(key) {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(HandshakeError::MissingHeader(name)),
        }
    }

    /// The request method.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The request target, e.g. `/chat`.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The HTTP version token, e.g. `HTTP/1.1`.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Get a header value by name (case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Iterate over all headers as `(lowercased name, value)`.
    pub fn headers(&self) -> impl Iterator<Item = (&str, &str)> {
        self.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The client's `Sec-WebSocket-Key`.
    pub fn key(&self) -> &str {
        self.header("sec-websocket-key").unwrap_or_default()
    }

    /// The `Origin` (or draft-era `Sec-WebSocket-Origin`) header, if sent.
    pub fn origin(&self) -> Option<&str> {
        self.header("origin")
            .or_else(|| self.header("sec-websocket-origin"))
    }

    /// Subprotocols the client asked for, in the client's order.
    pub fn requested_protocols(&self) -> Vec<&str> {
        self.header("sec-websocket-protocol")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Try to parse a complete handshake from the front of `buf` using the
/// default size bound.
pub fn try_parse_handshake(buf: &[u8]) -> Result<Option<(HandshakeRequest, usize)>, HandshakeError> {
    try_parse_handshake_with_limit(buf, DEFAULT_MAX_HANDSHAKE_SIZE)
}

/// Try to parse a complete handshake from the front of `buf`.
///
/// Returns `Ok(None)` until the blank line ending the header block has
/// arrived. On success the second element is the number of bytes the
/// request occupied; anything after it belongs to the frame stream.
pub fn try_parse_handshake_with_limit(
    buf: &[u8],
    max_size: usize,
) -> Result<Option<(HandshakeRequest, usize)>, HandshakeError> {
    try_parse_handshake_from(buf, max_size, 0)
}

/// Like [`try_parse_handshake_with_limit`], for a buffer that grows between
/// calls. `scanned` is the buffer length at the previous call: the search
/// for the blank line resumes just before it instead of starting over.
#[instrument(level = "debug", skip(buf), fields(buffered = buf.len()))]
pub fn try_parse_handshake_from(
    buf: &[u8],
    max_size: usize,
    scanned: usize,
) -> Result<Option<(HandshakeRequest, usize)>, HandshakeError> {
    let Some(end) = find_terminator(buf, scanned) else {
        if buf.len() > max_size {
            return Err(HandshakeError::TooLarge { max: max_size });
        }
        return Ok(None);
    };

    let consumed = end + HEADER_TERMINATOR.len();
    if consumed > max_size {
        return Err(HandshakeError::TooLarge { max: max_size });
    }

    let request = HandshakeRequest::parse(&buf[..end])?;
    request.validate()?;
    debug!(path = %request.path, "Parsed WebSocket handshake");
    Ok(Some((request, consumed)))
}

/// Find the blank line, looking no earlier than where a terminator
/// straddling offset `from` could begin.
fn find_terminator(buf: &[u8], from: usize) -> Option<usize> {
    let start = from
        .saturating_sub(HEADER_TERMINATOR.len() - 1)
        .min(buf.len());
    buf[start..]
        .windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
        .map(|offset| start + offset)
}

/// Compute the `Sec-WebSocket-Accept` value for a client key.
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Pick the first protocol the client requested that the server supports.
pub fn select_protocol(request: &HandshakeRequest, supported: &[String]) -> Option<String> {
    request
        .requested_protocols()
        .into_iter()
        .find(|requested| supported.iter().any(|s| s == requested))
        .map(str::to_string)
}

/// Build the `101 Switching Protocols` response.
pub fn build_response(request: &HandshakeRequest) -> Bytes {
    build_response_with_protocol(request, None)
}

/// Build the `101 Switching Protocols` response, naming the negotiated
/// subprotocol when there is one.
pub fn build_response_with_protocol(request: &HandshakeRequest, protocol: Option<&str>) -> Bytes {
    let mut response = String::from(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n",
    );
    response.push_str("Sec-WebSocket-Accept: ");
    response.push_str(&compute_accept_key(request.key()));
    response.push_str("\r\n");
    if let Some(protocol) = protocol {
        response.push_str("Sec-WebSocket-Protocol: ");
        response.push_str(protocol);
        response.push_str("\r\n");
    }
    response.push_str("\r\n");
    Bytes::from(response)
}

/// Build a minimal error response sent before dropping a failed handshake.
pub fn reject_response(status: u16, reason: &str) -> Bytes {
    Bytes::from(format!(
        "HTTP/1.1 {status} {reason}\r\n\
         Connection: close\r\n\
         Content-Length: 0\r\n\
         \r\n"
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "GET /chat HTTP/1.1\r\n\
                          Host: server.example.com\r\n\
                          Upgrade: websocket\r\n\
                          Connection: Upgrade\r\n\
                          Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                          Sec-WebSocket-Origin: http://example.com\r\n\
                          Sec-WebSocket-Protocol: chat, superchat\r\n\
                          Sec-WebSocket-Version: 8\r\n\
                          \r\n";

    fn parse(raw: &str) -> Result<Option<(HandshakeRequest, usize)>, HandshakeError> {
        try_parse_handshake(raw.as_bytes())
    }

    fn without(header: &str) -> String {
        SAMPLE
            .split("\r\n")
            .filter(|line| !line.starts_with(header))
            .collect::<Vec<_>>()
            .join("\r\n")
    }

    #[test]
    fn test_compute_accept_key_vector() {
        assert_eq!(
            compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_parse_complete_request() {
        let (request, consumed) = parse(SAMPLE).unwrap().unwrap();
        assert_eq!(consumed, SAMPLE.len());
        assert_eq!(request.method(), "GET");
        assert_eq!(request.path(), "/chat");
        assert_eq!(request.version(), "HTTP/1.1");
        assert_eq!(request.key(), "dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(request.header("HOST"), Some("server.example.com"));
        assert_eq!(request.origin(), Some("http://example.com"));
        assert_eq!(request.requested_protocols(), vec!["chat", "superchat"]);
    }

    #[test]
    fn test_parse_incomplete_until_terminator() {
        for cut in 0..SAMPLE.len() {
            assert_eq!(parse(&SAMPLE[..cut]), Ok(None), "cut at {cut}");
        }
    }

    #[test]
    fn test_parse_reports_consumed_with_trailing_frame_bytes() {
        let mut raw = SAMPLE.as_bytes().to_vec();
        raw.extend_from_slice(&[0x81, 0x80, 1, 2, 3, 4]);
        let (_, consumed) = try_parse_handshake(&raw).unwrap().unwrap();
        assert_eq!(consumed, SAMPLE.len());
    }

    #[test]
    fn test_header_names_case_insensitive_last_wins() {
        let raw = SAMPLE.replace(
            "Host: server.example.com\r\n",
            "host: first.example.com\r\nHOST: second.example.com\r\n",
        );
        let (request, _) = parse(&raw).unwrap().unwrap();
        assert_eq!(request.header("Host"), Some("second.example.com"));
    }

    #[test]
    fn test_missing_key_is_rejected() {
        assert_eq!(
            parse(&without("Sec-WebSocket-Key")),
            Err(HandshakeError::MissingHeader("Sec-WebSocket-Key"))
        );
    }

    #[test]
    fn test_missing_host_is_rejected() {
        assert_eq!(
            parse(&without("Host")),
            Err(HandshakeError::MissingHeader("Host"))
        );
    }

    #[test]
    fn test_wrong_upgrade_is_rejected() {
        let raw = SAMPLE.replace("Upgrade: websocket", "Upgrade: h2c");
        assert!(matches!(
            parse(&raw),
            Err(HandshakeError::InvalidHeader { name: "Upgrade", .. })
        ));
    }

    #[test]
    fn test_connection_header_token_list() {
        let raw = SAMPLE.replace("Connection: Upgrade", "Connection: keep-alive, Upgrade");
        assert!(parse(&raw).unwrap().is_some());

        let raw = SAMPLE.replace("Connection: Upgrade", "Connection: keep-alive");
        assert!(matches!(
            parse(&raw),
            Err(HandshakeError::InvalidHeader { name: "Connection", .. })
        ));
    }

    #[test]
    fn test_non_get_method_is_rejected() {
        let raw = SAMPLE.replace("GET /chat", "POST /chat");
        assert_eq!(parse(&raw), Err(HandshakeError::InvalidMethod("POST".into())));
    }

    #[test]
    fn test_malformed_request_line() {
        let raw = SAMPLE.replace("GET /chat HTTP/1.1", "GET /chat");
        assert!(matches!(parse(&raw), Err(HandshakeError::MalformedRequestLine(_))));

        let raw = SAMPLE.replace("GET /chat HTTP/1.1", "GET /chat FTP/1.0");
        assert!(matches!(parse(&raw), Err(HandshakeError::MalformedRequestLine(_))));
    }

    #[test]
    fn test_malformed_header_line() {
        let raw = SAMPLE.replace("Upgrade: websocket\r\n", "Upgrade websocket\r\n");
        assert!(matches!(parse(&raw), Err(HandshakeError::MalformedHeader(_))));
    }

    #[test]
    fn test_non_utf8_headers() {
        let raw = b"GET / HTTP/1.1\r\nHost: \xff\r\n\r\n";
        assert_eq!(try_parse_handshake(raw), Err(HandshakeError::InvalidEncoding));
    }

    #[test]
    fn test_oversized_handshake_without_terminator() {
        let raw = format!("GET / HTTP/1.1\r\nX-Padding: {}", "a".repeat(64));
        assert_eq!(
            try_parse_handshake_with_limit(raw.as_bytes(), 32),
            Err(HandshakeError::TooLarge { max: 32 })
        );
    }

    #[test]
    fn test_oversized_handshake_with_terminator() {
        assert_eq!(
            try_parse_handshake_with_limit(SAMPLE.as_bytes(), 64),
            Err(HandshakeError::TooLarge { max: 64 })
        );
    }

    #[test]
    fn test_find_terminator_resumes_near_previous_length() {
        let raw = b"GET / HTTP/1.1\r\nHost: a\r\n\r\n";
        let end = raw.len() - HEADER_TERMINATOR.len();
        assert_eq!(find_terminator(raw, 0), Some(end));
        // Any shorter earlier read cannot have held the whole terminator.
        for from in 0..raw.len() {
            assert_eq!(find_terminator(raw, from), Some(end));
        }
        assert_eq!(find_terminator(&raw[..end + 2], end + 1), None);
        assert_eq!(find_terminator(raw, raw.len() + 10), None);
    }

    #[test]
    fn test_handshake_parsed_across_reads() {
        let bytes = SAMPLE.as_bytes();
        let mut scanned = 0;
        let mut parsed = None;
        for len in (1..=bytes.len()).step_by(7).chain([bytes.len()]) {
            if let Some(result) = try_parse_handshake_from(&bytes[..len], 4096, scanned).unwrap() {
                parsed = Some(result);
                break;
            }
            scanned = len;
        }
        let (request, consumed) = parsed.unwrap();
        assert_eq!(request.path(), "/chat");
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn test_build_response() {
        let (request, _) = parse(SAMPLE).unwrap().unwrap();
        let response = build_response(&request);
        assert_eq!(
            &response[..],
            b"HTTP/1.1 101 Switching Protocols\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\
              \r\n"
        );
    }

    #[test]
    fn test_build_response_is_deterministic() {
        let (request, _) = parse(SAMPLE).unwrap().unwrap();
        assert_eq!(build_response(&request), build_response(&request));
    }

    #[test]
    fn test_select_protocol() {
        let (request, _) = parse(SAMPLE).unwrap().unwrap();
        let supported = vec!["superchat".to_string(), "chat".to_string()];
        // client order wins
        assert_eq!(select_protocol(&request, &supported), Some("chat".into()));
        assert_eq!(select_protocol(&request, &["mqtt".to_string()]), None);
        assert_eq!(select_protocol(&request, &[]), None);
    }

    #[test]
    fn test_build_response_with_protocol() {
        let (request, _) = parse(SAMPLE).unwrap().unwrap();
        let response = build_response_with_protocol(&request, Some("chat"));
        let text = std::str::from_utf8(&response).unwrap();
        assert!(text.contains("Sec-WebSocket-Protocol: chat\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_reject_response() {
        let response = reject_response(400, "Bad Request");
        let text = std::str::from_utf8(&response).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("Connection: close\r\n"));
    }
}
