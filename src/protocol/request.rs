//! Request and Response message types.
//!
//! Defines the envelope for calls and their responses between the local
//! end (this crate) and the remote end (browser).

// ============================================================================
// Imports
// ============================================================================

use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::identifiers::{CallId, SessionId};

// ============================================================================
// Request
// ============================================================================

/// A call from local end to remote end.
///
/// # Format
///
/// ```json
/// {
///   "id": 1,
///   "method": "Runtime.evaluate",
///   "params": { ... },
///   "sessionId": "ABC"
/// }
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct Request {
    /// Unique identifier for request/response correlation.
    pub id: CallId,

    /// Method in `Domain.method` / `module.command` format.
    pub method: String,

    /// Call parameters (always an object on the wire).
    pub params: Value,

    /// Session tag (CDP only).
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
}

impl Request {
    /// Creates a root-scoped request.
    ///
    /// `null` params are sent as an empty object.
    #[must_use]
    pub fn new(id: CallId, method: impl Into<String>, params: Value) -> Self {
        let params = match params {
            Value::Null => Value::Object(Default::default()),
            other => other,
        };
        Self {
            id,
            method: method.into(),
            params,
            session_id: None,
        }
    }

    /// Tags the request with a session.
    #[inline]
    #[must_use]
    pub fn with_session(mut self, session_id: Option<SessionId>) -> Self {
        self.session_id = session_id;
        self
    }
}

// ============================================================================
// Response
// ============================================================================

/// A decoded response from remote end to local end.
///
/// # Format
///
/// CDP:
/// ```json
/// { "id": 1, "result": { ... } }
/// { "id": 1, "error": { "code": -32000, "message": "..." } }
/// ```
///
/// BiDi:
/// ```json
/// { "type": "success", "id": 1, "result": { ... } }
/// { "type": "error", "id": 1, "error": "no such frame", "message": "..." }
/// ```
#[derive(Debug, Clone)]
pub struct Response {
    /// Matches the request `id`.
    pub id: CallId,

    /// Session tag, if the peer sent one.
    pub session_id: Option<SessionId>,

    /// Result value or peer error.
    pub outcome: std::result::Result<Value, RemoteError>,
}

impl Response {
    /// Returns `true` if this is a success response.
    #[inline]
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Extracts the result value, labelling a peer error with `method`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Protocol`] if the response was an error.
    pub fn into_result(self, method: &str) -> Result<Value> {
        self.outcome.map_err(|e| e.into_error(method))
    }
}

// ============================================================================
// RemoteError
// ============================================================================

/// Error object reported by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    /// Numeric code (CDP).
    pub code: Option<i64>,
    /// Error code string (BiDi, e.g. `"no such frame"`).
    pub error: Option<String>,
    /// Human-readable message.
    pub message: String,
}

impl RemoteError {
    /// Builds a remote error from the wire `error` field and optional
    /// top-level `message`.
    #[must_use]
    pub fn from_wire(error: Option<Value>, message: Option<String>) -> Self {
        match error {
            Some(Value::Object(map)) => {
                let code = map.get("code").and_then(Value::as_i64);
                let mut text = map
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or(message)
                    .unwrap_or_else(|| "unknown error".to_string());
                if let Some(data) = map.get("data").and_then(Value::as_str) {
                    text = format!("{text} ({data})");
                }
                Self {
                    code,
                    error: None,
                    message: text,
                }
            }
            Some(Value::String(code)) => Self {
                code: None,
                message: message.unwrap_or_else(|| code.clone()),
                error: Some(code),
            },
            Some(other) => Self {
                code: None,
                error: None,
                message: message.unwrap_or_else(|| other.to_string()),
            },
            None => Self {
                code: None,
                error: None,
                message: message.unwrap_or_else(|| "unknown error".to_string()),
            },
        }
    }

    /// Converts into a crate error attributed to `method`.
    #[must_use]
    pub fn into_error(self, method: &str) -> Error {
        let message = match self.error {
            Some(code) if code != self.message => format!("{code}: {}", self.message),
            _ => self.message,
        };
        Error::protocol(method, self.code, message)
    }
}

// ============================================================================
// Tests
// ============================================================================
