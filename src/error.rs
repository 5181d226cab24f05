//! Error types for the session core.
//!
//! This module defines all error types used throughout the crate.
//!
//! # Usage
//!
//! All fallible operations return [`Result<T>`] which uses [`Error`]:
//!
//! ```ignore
//! use browser_session::{Error, ErrorKind, Result};
//!
//! async fn example(realm: &Realm) -> Result<()> {
//!     match realm.evaluate("document.title").await {
//!         Ok(title) => println!("{title}"),
//!         Err(e) if e.kind() == ErrorKind::RealmDestroyed => println!("navigated away"),
//!         Err(e) => return Err(e),
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Error Categories
//!
//! | Category | Variants |
//! |----------|----------|
//! | Configuration | [`Error::Config`] |
//! | Connection | [`Error::Connection`], [`Error::ConnectionTimeout`], [`Error::TransportClosed`] |
//! | Session | [`Error::SessionClosed`] |
//! | Protocol | [`Error::Protocol`], [`Error::MalformedMessage`], [`Error::InvalidArgument`] |
//! | Execution | [`Error::Timeout`], [`Error::Evaluation`], [`Error::Cancelled`] |
//! | Realm | [`Error::RealmDestroyed`], [`Error::HandleDisposed`] |
//! | External | [`Error::Io`], [`Error::Json`], [`Error::WebSocket`] |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::io::Error as IoError;
use std::result::Result as StdResult;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::identifiers::{CallId, RealmId, SessionId};

// ============================================================================
// Result Alias
// ============================================================================

/// Result type alias using crate [`enum@Error`].
///
/// All fallible operations in this crate return this type.
pub type Result<T> = StdResult<T, Error>;

// ============================================================================
// Error Enum
// ============================================================================

/// Main error type for the crate.
///
/// Each variant includes the reason string relevant to its kind.
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Configuration Errors
    // ========================================================================
    /// Configuration error.
    ///
    /// Returned when connection options or environment overrides are invalid.
    #[error("Configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },

    // ========================================================================
    // Connection Errors
    // ========================================================================
    /// Transport could not be established.
    #[error("Connection failed: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
    },

    /// Transport was not established within the connect timeout.
    #[error("Connection timeout after {timeout_ms}ms")]
    ConnectionTimeout {
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// The connection is closed.
    ///
    /// Broadcast to every outstanding call when the transport ends or the
    /// connection is closed, and returned by any send issued afterwards.
    #[error("Target closed: {reason}")]
    TransportClosed {
        /// Close reason shared by the whole cascade.
        reason: String,
    },

    // ========================================================================
    // Session Errors
    // ========================================================================
    /// The session a call was issued on is closed.
    #[error("Session {session_id} closed: {reason}")]
    SessionClosed {
        /// The closed session.
        session_id: SessionId,
        /// Close reason.
        reason: String,
    },

    // ========================================================================
    // Protocol Errors
    // ========================================================================
    /// Peer answered a call with an error object.
    #[error("Protocol error ({method}): {message}")]
    Protocol {
        /// Method of the failed call.
        method: String,
        /// Numeric error code (CDP) if present.
        code: Option<i64>,
        /// Peer-reported message.
        message: String,
    },

    /// Inbound message could not be decoded into a known envelope.
    #[error("Malformed message: {message}")]
    MalformedMessage {
        /// Description of the decoding failure.
        message: String,
    },

    /// Invalid argument detected before reaching the peer.
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// Description of the invalid argument.
        message: String,
    },

    // ========================================================================
    // Execution Errors
    // ========================================================================
    /// Operation timeout.
    ///
    /// Caller-local: other pending calls are unaffected.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
        /// Call id, when the operation was a protocol call.
        call_id: Option<CallId>,
        /// Milliseconds waited before timeout.
        timeout_ms: u64,
    },

    /// Script threw while evaluating in the remote realm.
    #[error("Evaluation failed: {message}")]
    Evaluation {
        /// Exception text reported by the peer.
        message: String,
    },

    /// Wait-operation was cancelled by its caller.
    #[error("Cancelled: {operation}")]
    Cancelled {
        /// Description of the cancelled operation.
        operation: String,
    },

    // ========================================================================
    // Realm Errors
    // ========================================================================
    /// Execution context no longer exists.
    ///
    /// Detected locally, without a round trip.
    #[error("Execution context destroyed: realm {realm_id} of {owner} ({reason})")]
    RealmDestroyed {
        /// The destroyed realm.
        realm_id: RealmId,
        /// Owning frame or worker.
        owner: String,
        /// Why the realm went away.
        reason: String,
    },

    /// Handle was disposed before use.
    #[error("Handle {handle} is disposed")]
    HandleDisposed {
        /// Remote reference of the handle.
        handle: String,
    },

    // ========================================================================
    // External Errors
    // ========================================================================
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] IoError),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),
}

// ============================================================================
// ErrorKind
// ============================================================================

/// Stable category of an [`enum@Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Invalid configuration.
    Config,
    /// Transport could not be established.
    Connection,
    /// Connection closed (close cascade).
    TransportClosed,
    /// Session closed.
    SessionClosed,
    /// Peer-reported protocol error.
    Protocol,
    /// Undecodable inbound message.
    MalformedMessage,
    /// Locally rejected argument.
    InvalidArgument,
    /// Call or wait timed out.
    Timeout,
    /// Script exception.
    Evaluation,
    /// Caller cancelled.
    Cancelled,
    /// Realm destroyed.
    RealmDestroyed,
    /// Handle disposed.
    HandleDisposed,
    /// IO, JSON or WebSocket failure.
    External,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Config => "config",
            Self::Connection => "connection",
            Self::TransportClosed => "transport-closed",
            Self::SessionClosed => "session-closed",
            Self::Protocol => "protocol",
            Self::MalformedMessage => "malformed-message",
            Self::InvalidArgument => "invalid-argument",
            Self::Timeout => "timeout",
            Self::Evaluation => "evaluation",
            Self::Cancelled => "cancelled",
            Self::RealmDestroyed => "realm-destroyed",
            Self::HandleDisposed => "handle-disposed",
            Self::External => "external",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Error Constructors
// ============================================================================

impl Error {
    /// Creates a configuration error.
    #[inline]
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Creates a connection error.
    #[inline]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Creates a connection timeout error.
    #[inline]
    pub fn connection_timeout(timeout_ms: u64) -> Self {
        Self::ConnectionTimeout { timeout_ms }
    }

    /// Creates a transport closed error.
    #[inline]
    pub fn transport_closed(reason: impl Into<String>) -> Self {
        Self::TransportClosed {
            reason: reason.into(),
        }
    }

    /// Creates a session closed error.
    #[inline]
    pub fn session_closed(session_id: SessionId, reason: impl Into<String>) -> Self {
        Self::SessionClosed {
            session_id,
            reason: reason.into(),
        }
    }

    /// Creates a peer-reported protocol error.
    #[inline]
    pub fn protocol(method: impl Into<String>, code: Option<i64>, message: impl Into<String>) -> Self {
        Self::Protocol {
            method: method.into(),
            code,
            message: message.into(),
        }
    }

    /// Creates a malformed message error.
    #[inline]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedMessage {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    #[inline]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a call timeout error.
    #[inline]
    pub fn call_timeout(method: impl Into<String>, call_id: CallId, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: method.into(),
            call_id: Some(call_id),
            timeout_ms,
        }
    }

    /// Creates a generic operation timeout error.
    #[inline]
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            call_id: None,
            timeout_ms,
        }
    }

    /// Creates an evaluation error.
    #[inline]
    pub fn evaluation(message: impl Into<String>) -> Self {
        Self::Evaluation {
            message: message.into(),
        }
    }

    /// Creates a cancellation error.
    #[inline]
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// Creates a realm destroyed error.
    #[inline]
    pub fn realm_destroyed(
        realm_id: RealmId,
        owner: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::RealmDestroyed {
            realm_id,
            owner: owner.into(),
            reason: reason.into(),
        }
    }

    /// Creates a handle disposed error.
    #[inline]
    pub fn handle_disposed(handle: impl Into<String>) -> Self {
        Self::HandleDisposed {
            handle: handle.into(),
        }
    }
}

// ============================================================================
// Error Accessors
// ============================================================================

impl Error {
    /// Returns the stable category of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config { .. } => ErrorKind::Config,
            Self::Connection { .. } | Self::ConnectionTimeout { .. } => ErrorKind::Connection,
            Self::TransportClosed { .. } => ErrorKind::TransportClosed,
            Self::SessionClosed { .. } => ErrorKind::SessionClosed,
            Self::Protocol { .. } => ErrorKind::Protocol,
            Self::MalformedMessage { .. } => ErrorKind::MalformedMessage,
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Evaluation { .. } => ErrorKind::Evaluation,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::RealmDestroyed { .. } => ErrorKind::RealmDestroyed,
            Self::HandleDisposed { .. } => ErrorKind::HandleDisposed,
            Self::Io(_) | Self::Json(_) | Self::WebSocket(_) => ErrorKind::External,
        }
    }

    /// Returns the reason string relevant to this error's kind.
    ///
    /// Close reason for closures, peer message for protocol errors,
    /// operation for timeouts.
    #[must_use]
    pub fn reason(&self) -> String {
        match self {
            Self::TransportClosed { reason }
            | Self::SessionClosed { reason, .. }
            | Self::RealmDestroyed { reason, .. } => reason.clone(),
            Self::Protocol { message, .. }
            | Self::Config { message }
            | Self::Connection { message }
            | Self::MalformedMessage { message }
            | Self::InvalidArgument { message }
            | Self::Evaluation { message } => message.clone(),
            Self::Timeout { operation, .. } | Self::Cancelled { operation } => operation.clone(),
            other => other.to_string(),
        }
    }
}

// ============================================================================
// Error Predicates
// ============================================================================

/// Peer messages meaning the evaluation target vanished mid-flight.
const CONTEXT_LOST_MESSAGES: &[&str] = &[
    "Execution context was destroyed",
    "Cannot find context with specified id",
    "Inspected target navigated or closed",
    "no such frame",
    "no such handle",
    "no such node",
];

impl Error {
    /// Returns `true` if this is a timeout error.
    #[inline]
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectionTimeout { .. } | Self::Timeout { .. }
        )
    }

    /// Returns `true` if this error ends the connection or session.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(
            self,
            Self::TransportClosed { .. } | Self::SessionClosed { .. }
        )
    }

    /// Returns `true` if this is a connection error.
    #[inline]
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::ConnectionTimeout { .. }
                | Self::TransportClosed { .. }
                | Self::WebSocket(_)
        )
    }

    /// Returns `true` if the failure means the execution context went away.
    ///
    /// Wait-operations keep waiting for the next context on these.
    #[must_use]
    pub fn is_context_lost(&self) -> bool {
        match self {
            Self::RealmDestroyed { .. } => true,
            Self::Timeout { call_id, .. } => call_id.is_some(),
            Self::Protocol { message, .. } => CONTEXT_LOST_MESSAGES
                .iter()
                .any(|needle| message.contains(needle)),
            _ => false,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
