//! WebSocket server for peers that dial in.
//!
//! Some setups invert the connection: the browser (or a bridge extension)
//! connects to us. [`PendingServer`] binds first so the URL can be handed to
//! the browser, then accepts exactly one peer.
//!
//! # Connection Flow
//!
//! 1. Bind to `localhost:0` (random port)
//! 2. Hand [`PendingServer::ws_url`] to the browser
//! 3. [`PendingServer::accept`] waits for the peer and upgrades the socket
//! 4. Wrap the result in a [`Connection`](crate::Connection)

// ============================================================================
// Imports
// ============================================================================

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::{Error, Result};

use super::TransportReceiver;
use super::websocket::WebSocketTransport;

// ============================================================================
// PendingServer
// ============================================================================

/// A WebSocket server that is bound but not yet connected.
///
/// # Example
///
/// ```ignore
/// use std::net::{IpAddr, Ipv4Addr};
/// use std::time::Duration;
/// use browser_session::transport::PendingServer;
///
/// let server = PendingServer::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0).await?;
/// let ws_url = server.ws_url();
///
/// // Hand ws_url to the browser...
///
/// let (transport, inbound) = server.accept(Duration::from_secs(30)).await?;
/// ```
pub struct PendingServer {
    /// TCP listener for incoming connections.
    listener: TcpListener,
    /// Address the server is bound to.
    addr: SocketAddr,
}

impl PendingServer {
    /// Binds to the given address. Port 0 lets the OS choose.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if binding fails.
    pub async fn bind(ip: IpAddr, port: u16) -> Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(ip, port)).await?;
        let addr = listener.local_addr()?;

        debug!(port = addr.port(), "WebSocket server bound");

        Ok(Self { listener, addr })
    }

    /// Returns the bound port.
    #[inline]
    #[must_use]
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Returns the local socket address.
    #[inline]
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the URL peers should dial.
    #[inline]
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Accepts one peer and upgrades it to WebSocket.
    ///
    /// # Errors
    ///
    /// - [`Error::ConnectionTimeout`] if nobody connects within `accept_timeout`
    /// - [`Error::Connection`] if the WebSocket upgrade fails
    pub async fn accept(self, accept_timeout: Duration) -> Result<(WebSocketTransport, TransportReceiver)> {
        let (stream, peer) = timeout(accept_timeout, self.listener.accept())
            .await
            .map_err(|_| Error::connection_timeout(accept_timeout.as_millis() as u64))??;

        debug!(?peer, "TCP connection accepted");

        let ws_stream = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| Error::connection(format!("WebSocket upgrade failed: {e}")))?;

        info!(port = self.addr.port(), "WebSocket connection established");

        let url = self.ws_url();
        Ok(WebSocketTransport::from_stream(ws_stream, url))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::Ipv4Addr;

    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::tungstenite::Message;

    use crate::transport::{Transport, TransportEvent};

    #[tokio::test]
    async fn test_server_bind_random_port() {
        let server = PendingServer::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
            .await
            .expect("bind should succeed");

        assert!(server.port() > 0);
        assert_eq!(server.ws_url(), format!("ws://127.0.0.1:{}", server.port()));
        assert_eq!(server.local_addr().ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[tokio::test]
    async fn test_accept_times_out() {
        let server = PendingServer::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
            .await
            .expect("bind should succeed");

        let err = server
            .accept(Duration::from_millis(20))
            .await
            .err()
            .expect("nobody connects");
        assert!(matches!(err, Error::ConnectionTimeout { .. }));
    }

    #[tokio::test]
    async fn test_accept_and_exchange_frames() {
        let server = PendingServer::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
            .await
            .expect("bind should succeed");
        let url = server.ws_url();

        let client = tokio::spawn(async move {
            let (mut ws, _) = tokio_tungstenite::connect_async(url.as_str())
                .await
                .expect("client connect");
            ws.send(Message::Text(r#"{"method":"Hello.world"}"#.into()))
                .await
                .expect("client send");
            let echoed = ws.next().await.expect("frame").expect("ok");
            assert_eq!(echoed.into_text().expect("text").as_str(), r#"{"id":1}"#);
            ws.close(None).await.expect("close");
        });

        let (transport, mut inbound) = server
            .accept(Duration::from_secs(5))
            .await
            .expect("accept");

        let first = inbound.recv().await.expect("message");
        assert_eq!(first, TransportEvent::Message(r#"{"method":"Hello.world"}"#.to_string()));

        transport.send(r#"{"id":1}"#.to_string()).expect("send");

        let closed = inbound.recv().await.expect("closed event");
        assert!(matches!(closed, TransportEvent::Closed(_)));
        client.await.expect("client task");
    }
}
