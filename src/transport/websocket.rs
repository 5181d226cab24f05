//! WebSocket transport and pump loop.
//!
//! The transport spawns one tokio task per socket that handles:
//!
//! - Outgoing text frames queued by [`Transport::send`]
//! - Incoming text (and UTF-8 binary) frames forwarded as
//!   [`TransportEvent::Message`]
//! - A single [`TransportEvent::Closed`] when the socket ends for any reason

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};
use url::Url;

use crate::error::{Error, Result};

use super::{Transport, TransportEvent, TransportReceiver};

// ============================================================================
// Types
// ============================================================================

/// Instructions for the pump task.
enum Outgoing {
    /// Write one text frame.
    Text(String),
    /// Send a close frame and stop.
    Close,
}

// ============================================================================
// WebSocketTransport
// ============================================================================

/// WebSocket-backed [`Transport`].
///
/// Cloning is not supported; share it behind an `Arc` instead.
pub struct WebSocketTransport {
    /// Channel to the pump task.
    outgoing: mpsc::UnboundedSender<Outgoing>,
    /// Endpoint the socket is connected to.
    url: String,
}

impl WebSocketTransport {
    /// Dials a WebSocket endpoint.
    ///
    /// # Errors
    ///
    /// - [`Error::Connection`] if the URL is not `ws://` / `wss://` or the
    ///   handshake fails
    /// - [`Error::ConnectionTimeout`] if the handshake does not finish in time
    pub async fn connect(url: &str, connect_timeout: Duration) -> Result<(Self, TransportReceiver)> {
        let parsed = Url::parse(url).map_err(|e| Error::connection(format!("invalid url '{url}': {e}")))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(Error::connection(format!(
                "unsupported scheme '{}' (expected ws or wss)",
                parsed.scheme()
            )));
        }

        let (stream, _response) = timeout(connect_timeout, tokio_tungstenite::connect_async(url))
            .await
            .map_err(|_| Error::connection_timeout(connect_timeout.as_millis() as u64))?
            .map_err(|e| Error::connection(format!("WebSocket handshake failed: {e}")))?;

        info!(url, "WebSocket connection established");

        Ok(Self::from_stream(stream, url))
    }

    /// Wraps an already upgraded stream.
    ///
    /// Spawns the pump task internally.
    pub fn from_stream<S>(stream: WebSocketStream<S>, url: impl Into<String>) -> (Self, TransportReceiver)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let url = url.into();

        tokio::spawn(run_pump(stream, outgoing_rx, inbound_tx, url.clone()));

        (
            Self {
                outgoing: outgoing_tx,
                url,
            },
            inbound_rx,
        )
    }

    /// Returns the endpoint URL.
    #[inline]
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for WebSocketTransport {
    fn send(&self, message: String) -> Result<()> {
        self.outgoing
            .send(Outgoing::Text(message))
            .map_err(|_| Error::transport_closed("WebSocket pump stopped"))
    }

    fn close(&self) {
        let _ = self.outgoing.send(Outgoing::Close);
    }
}

// ============================================================================
// Pump Loop
// ============================================================================

/// Moves frames between the socket and the channels until either side ends.
async fn run_pump<S>(
    stream: WebSocketStream<S>,
    mut outgoing_rx: mpsc::UnboundedReceiver<Outgoing>,
    inbound_tx: mpsc::UnboundedSender<TransportEvent>,
    url: String,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_write, mut ws_read) = stream.split();

    let reason = loop {
        tokio::select! {
            // Incoming frames from the browser
            message = ws_read.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        trace!(len = text.len(), "Frame received");
                        if inbound_tx.send(TransportEvent::Message(text.to_string())).is_err() {
                            break "receiver dropped".to_string();
                        }
                    }

                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                        Ok(text) => {
                            if inbound_tx.send(TransportEvent::Message(text)).is_err() {
                                break "receiver dropped".to_string();
                            }
                        }
                        Err(e) => warn!(error = %e, "Dropping non UTF-8 binary frame"),
                    },

                    Some(Ok(Message::Close(frame))) => {
                        debug!("WebSocket closed by remote");
                        break frame
                            .map(|f| f.reason.to_string())
                            .filter(|r| !r.is_empty())
                            .unwrap_or_else(|| "WebSocket closed by remote".to_string());
                    }

                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break format!("WebSocket error: {e}");
                    }

                    None => {
                        debug!("WebSocket stream ended");
                        break "WebSocket stream ended".to_string();
                    }

                    // Ignore Ping, Pong, Frame
                    _ => {}
                }
            }

            // Frames queued by the connection
            command = outgoing_rx.recv() => {
                match command {
                    Some(Outgoing::Text(text)) => {
                        if let Err(e) = ws_write.send(Message::Text(text.into())).await {
                            warn!(error = %e, "Failed to write frame");
                            break format!("WebSocket write failed: {e}");
                        }
                    }

                    Some(Outgoing::Close) | None => {
                        debug!("Closing WebSocket");
                        let _ = ws_write.close().await;
                        break "closed locally".to_string();
                    }
                }
            }
        }
    };

    debug!(url = %url, reason = %reason, "WebSocket pump terminated");
    let _ = inbound_tx.send(TransportEvent::Closed(reason));
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_rejects_http_scheme() {
        let err = WebSocketTransport::connect("http://127.0.0.1:1", Duration::from_millis(50))
            .await
            .err()
            .expect("should reject");
        assert!(matches!(err, Error::Connection { .. }));
    }

    #[tokio::test]
    async fn test_connect_rejects_garbage_url() {
        let err = WebSocketTransport::connect("not a url", Duration::from_millis(50))
            .await
            .err()
            .expect("should reject");
        assert!(err.to_string().contains("invalid url"));
    }
}
