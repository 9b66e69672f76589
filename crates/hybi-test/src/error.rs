//! Test error types.

use std::fmt;
use std::io;
use std::time::Duration;

use hybi_ws::FrameError;

/// Errors that can occur while driving a test client.
#[derive(Debug)]
pub enum TestError {
    /// Socket I/O failed
    Io(io::Error),
    /// Nothing arrived in time
    Timeout(Duration),
    /// The server closed the socket
    Closed,
    /// The server sent a frame the client could not decode
    Frame(FrameError),
    /// The server's handshake response was not valid HTTP
    InvalidResponse(String),
}

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Timeout(after) => write!(f, "Timed out after {after:?}"),
            Self::Closed => write!(f, "Connection closed by server"),
            Self::Frame(e) => write!(f, "Frame error: {e}"),
            Self::InvalidResponse(msg) => write!(f, "Invalid handshake response: {msg}"),
        }
    }
}

impl std::error::Error for TestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Frame(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for TestError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<FrameError> for TestError {
    fn from(e: FrameError) -> Self {
        Self::Frame(e)
    }
}
