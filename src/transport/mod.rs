//! Duplex message transports.
//!
//! A transport moves whole protocol envelopes as text. Outgoing sends are
//! non-blocking; inbound messages and the final close notification arrive
//! in order on a [`TransportReceiver`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   send(text)    ┌──────────────┐     frames     ┌──────────┐
//! │    Connection    │ ──────────────► │  Transport   │ ◄────────────► │  Browser │
//! │ (dispatch queue) │ ◄────────────── │  (pump task) │                │          │
//! └──────────────────┘ TransportEvent  └──────────────┘                └──────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `memory` | In-process scripted peer for tests |
//! | `server` | Listener for peers that dial in |
//! | `websocket` | WebSocket client / stream transport |

// ============================================================================
// Submodules
// ============================================================================

/// In-memory transport pair.
pub mod memory;

/// WebSocket server binding and acceptance.
pub mod server;

/// WebSocket transport and pump loop.
pub mod websocket;

// ============================================================================
// Imports
// ============================================================================

use tokio::sync::mpsc;

use crate::error::Result;

// ============================================================================
// Re-exports
// ============================================================================

pub use memory::{MemoryPeer, MemoryTransport};
pub use server::PendingServer;
pub use websocket::WebSocketTransport;

// ============================================================================
// Transport
// ============================================================================

/// Inbound notification from a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// One complete protocol message.
    Message(String),
    /// The channel ended; no further messages follow.
    Closed(String),
}

/// Receiving half of a transport.
pub type TransportReceiver = mpsc::UnboundedReceiver<TransportEvent>;

/// Sending half of a duplex message channel.
pub trait Transport: Send + Sync + 'static {
    /// Queues one message for delivery without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransportClosed`](crate::Error::TransportClosed) if
    /// the channel already ended.
    fn send(&self, message: String) -> Result<()>;

    /// Releases the channel. Idempotent.
    fn close(&self);
}
