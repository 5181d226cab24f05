//! Browser Session - connection, session and realm core for browser automation.
//!
//! This library multiplexes many logical sessions over one transport to a
//! browser speaking either the Chrome DevTools Protocol (CDP) or WebDriver
//! BiDi, and tracks the JavaScript execution contexts (realms) living in
//! those sessions.
//!
//! # Architecture
//!
//! Every connection runs a single dispatcher task fed by one ordered queue:
//!
//! - **Transport**: moves text envelopes; reports one final close
//! - **Dispatcher**: correlates responses, routes events, applies lifecycle
//! - **Handles**: [`Connection`], [`Session`], [`Realm`], [`Handle`] are
//!   cheap clones that submit work to the queue
//!
//! Key guarantees:
//!
//! - Each call resolves exactly once (response, timeout, or close)
//! - A close fails every pending call with the same reason, then emits
//!   [`ConnectionEvent::Disconnected`] once
//! - Sessions close children first; their calls fail with
//!   [`Error::SessionClosed`]
//! - A destroyed realm fails locally; its id is never reused
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use browser_session::{Connection, ConnectionOptions, Protocol, Result, SessionId};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let connection = Connection::connect(
//!         "ws://127.0.0.1:9222/devtools/browser/abc",
//!         Protocol::Cdp,
//!         ConnectionOptions::from_env()?,
//!     )
//!     .await?;
//!
//!     let attached = connection
//!         .send_and_wait("Target.attachToTarget", json!({"targetId": "T1", "flatten": true}), None)
//!         .await?;
//!     let id = SessionId::from(attached["sessionId"].as_str().unwrap_or_default());
//!
//!     let session = connection.wait_for_session(&id, Duration::from_secs(5)).await?;
//!     session.send_and_wait("Runtime.enable", json!({})).await?;
//!
//!     let realm = session
//!         .wait_for_realm(&session.main_frame(), None, Duration::from_secs(5))
//!         .await?;
//!     println!("{}", realm.evaluate("document.title").await?);
//!
//!     connection.close("done").await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`connection`] | [`Connection`], events and options |
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Type-safe ID wrappers |
//! | [`protocol`] | Envelope codec and CDP / BiDi dialects |
//! | [`realm`] | [`Realm`], [`Handle`], wait-operations |
//! | [`session`] | [`Session`] and the session tree |
//! | [`transport`] | WebSocket and in-memory transports |

// ============================================================================
// Modules
// ============================================================================

/// Connection handle, dispatcher and events.
///
/// - [`Connection`] - one transport, many sessions
/// - [`ConnectionEvent`] - lifecycle and protocol notifications
pub mod connection;

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Type-safe identifiers.
///
/// Newtype wrappers prevent mixing incompatible IDs at compile time.
pub mod identifiers;

/// Wire protocol message types and dialects.
pub mod protocol;

/// Realms, handles and wait-operations.
pub mod realm;

/// Sessions and the session tree.
pub mod session;

/// Duplex message transports.
pub mod transport;

// ============================================================================
// Re-exports
// ============================================================================

// Connection types
pub use connection::{
    Connection, ConnectionEvent, ConnectionOptions, DispatchStats, EventSignal, EventStream,
    WaitOptions,
};

// Error types
pub use error::{Error, ErrorKind, Result};

// Identifier types
pub use identifiers::{CallId, RealmId, RemoteContextId, SessionId, WaitId};

// Protocol types
pub use protocol::{Event, Protocol, RealmOwner, TargetInfo};

// Realm types
pub use realm::{Argument, Handle, Realm, RealmInfo, WaitHandle, WaitState};

// Session types
pub use session::{Session, SessionEvents};

// Transport types
pub use transport::{
    MemoryPeer, MemoryTransport, PendingServer, Transport, TransportEvent, TransportReceiver,
    WebSocketTransport,
};
