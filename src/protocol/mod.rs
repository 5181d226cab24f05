//! Wire protocol message types and dialects.
//!
//! This module defines the generic envelope shared by CDP and WebDriver
//! BiDi, and the dialect-specific pieces layered on top of it.
//!
//! # Protocol Overview
//!
//! | Message Type | Direction | Shape |
//! |--------------|-----------|-------|
//! | `Request` | Local → Remote | `{id, method, params, sessionId?}` |
//! | `Response` | Remote → Local | `{id, result}` / `{id, error}` |
//! | `Event` | Remote → Local | `{method, params, sessionId?}` |
//!
//! A message with `id` and no `method` is a response; a message with
//! `method` and no `id` is an event. Decoding produces an [`Incoming`]
//! variant once, and routing matches on it exhaustively.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `codec` | Envelope encode/decode |
//! | `dialect` | CDP vs BiDi specifics ([`Protocol`]) |
//! | `event` | Event and lifecycle types |
//! | `request` | Request and Response types |
//! | `value` | Remote object / value conversion |

// ============================================================================
// Submodules
// ============================================================================

/// Envelope encode/decode.
pub mod codec;

/// Protocol dialects.
pub mod dialect;

/// Event message types.
pub mod event;

/// Request and Response message types.
pub mod request;

/// Remote object and value conversion.
pub mod value;

// ============================================================================
// Re-exports
// ============================================================================

pub use codec::Incoming;
pub use dialect::Protocol;
pub use event::{ContextDescriptor, Event, Lifecycle, RealmOwner, TargetInfo};
pub use request::{RemoteError, Request, Response};
pub use value::{RemoteObject, RemoteRef};
