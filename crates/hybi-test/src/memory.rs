//! In-memory listener for running a server without binding a port.

use std::future::{self, Future};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use hybi_ws::Listener;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

const LISTENER_PORT: u16 = 9000;
const BUFFER_SIZE: usize = 64 * 1024;

/// Creates a connected listener/connector pair.
///
/// # Example
///
/// ```ignore
/// let (listener, connector) = hybi_test::memory_listener();
/// let server = WebSocketServer::serve(listener, ServerConfig::default(), &delegate)?;
/// let mut client = TestClient::new(connector.connect()?);
/// ```
pub fn memory_listener() -> (MemoryListener, MemoryConnector) {
    let (sender, incoming) = mpsc::unbounded_channel();
    let listener = MemoryListener {
        incoming,
        addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), LISTENER_PORT),
    };
    let connector = MemoryConnector {
        sender,
        next_port: Arc::new(AtomicU16::new(40_000)),
    };
    (listener, connector)
}

/// The server half: yields one duplex stream per `connect` call.
#[derive(Debug)]
pub struct MemoryListener {
    incoming: mpsc::UnboundedReceiver<(DuplexStream, SocketAddr)>,
    addr: SocketAddr,
}

impl Listener for MemoryListener {
    type Socket = DuplexStream;

    fn accept(&mut self) -> impl Future<Output = io::Result<(DuplexStream, SocketAddr)>> + Send {
        async move {
            match self.incoming.recv().await {
                Some(accepted) => Ok(accepted),
                // Every connector is gone; behave like an idle socket.
                None => future::pending().await,
            }
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

/// The client half. Cloneable.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    sender: mpsc::UnboundedSender<(DuplexStream, SocketAddr)>,
    next_port: Arc<AtomicU16>,
}

impl MemoryConnector {
    /// Opens a new in-memory connection to the listener.
    pub fn connect(&self) -> io::Result<DuplexStream> {
        let (client, server) = tokio::io::duplex(BUFFER_SIZE);
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        self.sender
            .send((server, peer))
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "listener dropped"))?;
        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_connect_and_accept() {
        let (mut listener, connector) = memory_listener();
        let mut client = connector.connect().unwrap();
        let (mut server, peer) = listener.accept().await.unwrap();
        assert_eq!(peer.ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_peers_get_distinct_addresses() {
        let (mut listener, connector) = memory_listener();
        let _a = connector.connect().unwrap();
        let _b = connector.clone().connect().unwrap();
        let (_, first) = listener.accept().await.unwrap();
        let (_, second) = listener.accept().await.unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_connect_after_listener_dropped() {
        let (listener, connector) = memory_listener();
        drop(listener);
        let err = connector.connect().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn test_accept_pends_without_connectors() {
        let (mut listener, connector) = memory_listener();
        drop(connector);
        let result =
            tokio::time::timeout(std::time::Duration::from_millis(20), listener.accept()).await;
        assert!(result.is_err());
    }
}
