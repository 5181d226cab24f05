//! In-memory transport pair.
//!
//! [`MemoryTransport`] is handed to a [`Connection`](crate::Connection);
//! the matching [`MemoryPeer`] plays the browser: it reads what the
//! connection sent and delivers scripted responses and events.
//!
//! ```ignore
//! let (transport, inbound, peer) = MemoryTransport::pair();
//! let connection = Connection::new("memory://", transport, inbound, Protocol::Cdp, options);
//!
//! let request = peer.recv_json().await.unwrap();
//! peer.deliver_json(&json!({"id": request["id"], "result": {}}));
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::sync::{Mutex, mpsc};

use crate::error::{Error, Result};

use super::{Transport, TransportEvent, TransportReceiver};

// ============================================================================
// MemoryTransport
// ============================================================================

/// Connection-side half of an in-memory channel.
pub struct MemoryTransport {
    /// Messages sent by the connection.
    outbox: mpsc::UnboundedSender<String>,
    /// Inbound channel, used to report the local close.
    inbound: mpsc::UnboundedSender<TransportEvent>,
    /// Set once either side closed.
    closed: Arc<AtomicBool>,
}

impl MemoryTransport {
    /// Creates a connected transport, its inbound receiver, and the peer.
    #[must_use]
    pub fn pair() -> (Self, TransportReceiver, MemoryPeer) {
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let transport = Self {
            outbox: outbox_tx,
            inbound: inbound_tx.clone(),
            closed: Arc::clone(&closed),
        };
        let peer = MemoryPeer {
            outbox: Mutex::new(outbox_rx),
            inbound: inbound_tx,
            closed,
        };

        (transport, inbound_rx, peer)
    }
}

impl Transport for MemoryTransport {
    fn send(&self, message: String) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::transport_closed("memory transport closed"));
        }
        self.outbox
            .send(message)
            .map_err(|_| Error::transport_closed("memory peer dropped"))
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self
                .inbound
                .send(TransportEvent::Closed("closed locally".to_string()));
        }
    }
}

// ============================================================================
// MemoryPeer
// ============================================================================

/// Scripted remote end of a [`MemoryTransport`].
///
/// All methods take `&self`; share it behind an `Arc` to answer from a
/// background task while the test keeps delivering events.
pub struct MemoryPeer {
    outbox: Mutex<mpsc::UnboundedReceiver<String>>,
    inbound: mpsc::UnboundedSender<TransportEvent>,
    closed: Arc<AtomicBool>,
}

impl MemoryPeer {
    /// Waits for the next message the connection sent.
    ///
    /// Returns `None` once the transport is dropped and drained.
    pub async fn recv(&self) -> Option<String> {
        self.outbox.lock().await.recv().await
    }

    /// Waits for the next message and parses it as JSON.
    pub async fn recv_json(&self) -> Option<Value> {
        let text = self.recv().await?;
        serde_json::from_str(&text).ok()
    }

    /// Returns a sent message if one is already queued.
    pub fn try_recv(&self) -> Option<String> {
        self.outbox.try_lock().ok()?.try_recv().ok()
    }

    /// Delivers one raw message to the connection.
    pub fn deliver(&self, text: impl Into<String>) {
        let _ = self.inbound.send(TransportEvent::Message(text.into()));
    }

    /// Delivers one JSON message to the connection.
    pub fn deliver_json(&self, message: &Value) {
        self.deliver(message.to_string());
    }

    /// Ends the channel from the remote side.
    pub fn close(&self, reason: impl Into<String>) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let _ = self.inbound.send(TransportEvent::Closed(reason.into()));
        }
    }

    /// Returns `true` once either side closed the channel.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

// ============================================================================
// Tests
// ============================================================================
