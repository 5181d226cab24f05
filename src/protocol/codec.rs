//! Envelope encode/decode.
//!
//! Both dialects share one JSON envelope. Decoding classifies a message
//! exactly once into an [`Incoming`] variant:
//!
//! | `id` | `method` | Result |
//! |------|----------|--------|
//! | yes | no | [`Incoming::Response`] |
//! | no | yes | [`Incoming::Event`] |
//! | yes | yes | malformed |
//! | no | no | malformed |
//!
//! BiDi's `type` discriminator (`success` / `error` / `event`) is honoured
//! when present.

// ============================================================================
// Imports
// ============================================================================

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::identifiers::{CallId, SessionId};

use super::event::Event;
use super::request::{RemoteError, Request, Response};

// ============================================================================
// Incoming
// ============================================================================

/// A decoded inbound message.
#[derive(Debug, Clone)]
pub enum Incoming {
    /// Response to a prior call.
    Response(Response),
    /// Unsolicited event.
    Event(Event),
}

// ============================================================================
// Envelope
// ============================================================================

/// Raw inbound envelope, every field optional.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default, rename = "sessionId")]
    session_id: Option<SessionId>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

// ============================================================================
// Encode / Decode
// ============================================================================

/// Serializes a request into its wire text.
///
/// # Errors
///
/// Returns [`Error::Json`] if serialization fails.
pub fn encode(request: &Request) -> Result<String> {
    Ok(serde_json::to_string(request)?)
}

/// Decodes one wire message.
///
/// # Errors
///
/// Returns [`Error::MalformedMessage`] if the text is not a valid envelope
/// or cannot be classified.
pub fn decode(text: &str) -> Result<Incoming> {
    let envelope: Envelope = serde_json::from_str(text)
        .map_err(|e| Error::malformed(format!("invalid envelope: {e}")))?;

    if let Some(kind) = envelope.kind.as_deref()
        && !matches!(kind, "success" | "error" | "event")
    {
        return Err(Error::malformed(format!("unknown message type '{kind}'")));
    }

    match (envelope.id, envelope.method) {
        (Some(id), None) => {
            let is_error = envelope.error.is_some() || envelope.kind.as_deref() == Some("error");
            let outcome = if is_error {
                Err(RemoteError::from_wire(envelope.error, envelope.message))
            } else {
                Ok(envelope.result.unwrap_or(Value::Null))
            };

            Ok(Incoming::Response(Response {
                id: CallId::new(id),
                session_id: envelope.session_id,
                outcome,
            }))
        }

        (None, Some(method)) => Ok(Incoming::Event(Event {
            method,
            params: envelope.params.unwrap_or(Value::Null),
            session_id: envelope.session_id,
        })),

        (Some(id), Some(method)) => Err(Error::malformed(format!(
            "message {id} carries both id and method '{method}'"
        ))),

        (None, None) => {
            if envelope.error.is_some() {
                let err = RemoteError::from_wire(envelope.error, envelope.message);
                Err(Error::malformed(format!(
                    "error without call id: {}",
                    err.message
                )))
            } else {
                Err(Error::malformed("message has neither id nor method"))
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
