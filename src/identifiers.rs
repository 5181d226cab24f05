//! Type-safe identifiers for protocol entities.
//!
//! Newtype wrappers prevent mixing incompatible IDs at compile time.
//!
//! | Type | Minted by | Wire form |
//! |------|-----------|-----------|
//! | [`CallId`] | connection (monotonic) | integer `id` |
//! | [`SessionId`] | remote peer | string `sessionId` / browsing context |
//! | [`RealmId`] | realm registry (monotonic) | local only |
//! | [`WaitId`] | connection (monotonic) | local only |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

// ============================================================================
// CallId
// ============================================================================

/// Identifier correlating a call with its response.
///
/// Unique for the lifetime of a connection; never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(u64);

impl CallId {
    /// Creates a call ID from its wire value.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the wire value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// SessionId
// ============================================================================

/// Opaque session identifier issued by the remote peer.
///
/// CDP: the `sessionId` from `Target.attachedToTarget`.
/// BiDi: the browsing context id.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct SessionId(Arc<str>);

impl SessionId {
    /// Returns the identifier as a string slice.
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for SessionId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::from(s))
    }
}

// ============================================================================
// RealmId
// ============================================================================

/// Local identity of one execution-context generation.
///
/// A new id is minted whenever the remote context is recreated; a
/// destroyed id is never handed out again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RealmId(u64);

impl RealmId {
    /// Creates a realm ID.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RealmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// WaitId
// ============================================================================

/// Identifier of a registered wait-operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WaitId(u64);

impl WaitId {
    /// Creates a wait ID.
    #[inline]
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }
}

impl fmt::Display for WaitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wait-{}", self.0)
    }
}

// ============================================================================
// RemoteContextId
// ============================================================================

/// Peer-side execution context identifier.
///
/// CDP uses numeric `executionContextId`s scoped to a session; BiDi uses
/// globally unique realm strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RemoteContextId {
    /// CDP `executionContextId`.
    Numeric(i64),
    /// BiDi realm id.
    Named(Arc<str>),
}

impl fmt::Display for RemoteContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(id) => write!(f, "{id}"),
            Self::Named(id) => f.write_str(id),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_id_serializes_as_integer() {
        let json = serde_json::to_string(&CallId::new(42)).expect("serialize");
        assert_eq!(json, "42");
    }

    #[test]
    fn test_session_id_round_trip_as_string() {
        let id = SessionId::from("ABC");
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, "\"ABC\"");

        let back: SessionId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, id);
    }

    #[test]
    fn test_display_formats() {
        assert_eq!(RealmId::new(3).to_string(), "3");
        assert_eq!(WaitId::new(9).to_string(), "wait-9");
        assert_eq!(RemoteContextId::Numeric(5).to_string(), "5");
        assert_eq!(RemoteContextId::Named(Arc::from("r-1")).to_string(), "r-1");
    }
}
