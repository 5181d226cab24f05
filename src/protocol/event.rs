//! Event message types.
//!
//! Events are unsolicited notifications from the remote end. A subset of
//! them drive the session tree and realm registry; those are interpreted
//! into [`Lifecycle`] values by the active [`Protocol`](super::Protocol).
//!
//! # Lifecycle Events
//!
//! | Lifecycle | CDP | BiDi |
//! |-----------|-----|------|
//! | `Attached` | `Target.attachedToTarget` | `browsingContext.contextCreated` |
//! | `Detached` | `Target.detachedFromTarget` | `browsingContext.contextDestroyed` |
//! | `ContextCreated` | `Runtime.executionContextCreated` | `script.realmCreated` |
//! | `ContextDestroyed` | `Runtime.executionContextDestroyed` | `script.realmDestroyed` |
//! | `ContextsCleared` | `Runtime.executionContextsCleared` | - |
//! | `OwnerGone` | `Page.frameDetached` | - |

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::identifiers::{RemoteContextId, SessionId};

// ============================================================================
// Event
// ============================================================================

/// An event notification from remote end to local end.
///
/// # Format
///
/// ```json
/// {
///   "method": "Page.loadEventFired",
///   "params": { ... },
///   "sessionId": "ABC"
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Event {
    /// Event name in `Domain.event` / `module.event` format.
    pub method: String,

    /// Event-specific data.
    pub params: Value,

    /// Session the event is scoped to (`None` = connection root).
    pub session_id: Option<SessionId>,
}

impl Event {
    /// Returns the domain/module name from the method.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let event = Event { method: "Page.loadEventFired".into(), .. };
    /// assert_eq!(event.module(), "Page");
    /// ```
    #[inline]
    #[must_use]
    pub fn module(&self) -> &str {
        self.method.split('.').next().unwrap_or_default()
    }

    /// Returns the event name from the method.
    #[inline]
    #[must_use]
    pub fn event_name(&self) -> &str {
        self.method.split('.').nth(1).unwrap_or_default()
    }

    /// Gets a string parameter.
    #[inline]
    #[must_use]
    pub fn str_param(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(Value::as_str)
    }
}

// ============================================================================
// TargetInfo
// ============================================================================

/// Metadata describing what a session is attached to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetInfo {
    /// Target or browsing context id.
    pub target_id: String,
    /// Target type (`page`, `iframe`, `worker`, `browsingContext`, ...).
    pub kind: String,
    /// Current URL.
    pub url: String,
    /// Title, if reported.
    pub title: String,
}

impl TargetInfo {
    /// Creates target info with id and type.
    #[must_use]
    pub fn new(target_id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            kind: kind.into(),
            ..Default::default()
        }
    }

    /// Parses a CDP `TargetInfo` object.
    pub(crate) fn from_cdp(info: &Value) -> Self {
        let field = |key: &str| {
            info.get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Self {
            target_id: field("targetId"),
            kind: field("type"),
            url: field("url"),
            title: field("title"),
        }
    }
}

// ============================================================================
// RealmOwner
// ============================================================================

/// The frame or worker an execution context belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RealmOwner {
    /// Frame / browsing context id.
    Frame(Arc<str>),
    /// Worker (CDP: worker session, BiDi: worker realm id).
    Worker(Arc<str>),
}

impl RealmOwner {
    /// Creates a frame owner.
    #[must_use]
    pub fn frame(id: impl AsRef<str>) -> Self {
        Self::Frame(Arc::from(id.as_ref()))
    }

    /// Creates a worker owner.
    #[must_use]
    pub fn worker(id: impl AsRef<str>) -> Self {
        Self::Worker(Arc::from(id.as_ref()))
    }

    /// Returns the owner id.
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Frame(id) | Self::Worker(id) => id,
        }
    }
}

impl fmt::Display for RealmOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Frame(id) => write!(f, "frame {id}"),
            Self::Worker(id) => write!(f, "worker {id}"),
        }
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Description of a newly reported execution context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextDescriptor {
    /// Peer-side context id.
    pub remote: RemoteContextId,
    /// Owning frame or worker.
    pub owner: RealmOwner,
    /// Sandbox / isolated world name (`None` = main world).
    pub sandbox: Option<String>,
    /// Security origin.
    pub origin: String,
}

/// Lifecycle events that mutate the session tree or realm registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lifecycle {
    /// A session attached under `parent` (`None` = root).
    Attached {
        /// Parent session.
        parent: Option<SessionId>,
        /// New session.
        session: SessionId,
        /// Target metadata.
        target: TargetInfo,
    },

    /// A session detached.
    Detached {
        /// Detached session.
        session: SessionId,
        /// Reason carried by the cascade.
        reason: String,
    },

    /// A new execution context exists.
    ContextCreated {
        /// Session the context lives in.
        session: Option<SessionId>,
        /// Context details.
        context: ContextDescriptor,
    },

    /// An execution context was torn down (owner may come back).
    ContextDestroyed {
        /// Session scope of the id, if the dialect scopes ids per session.
        session: Option<SessionId>,
        /// Peer-side context id.
        remote: RemoteContextId,
    },

    /// Every execution context of a session was torn down.
    ContextsCleared {
        /// Affected session.
        session: Option<SessionId>,
    },

    /// A frame or worker went away for good.
    OwnerGone {
        /// Session the owner lived in.
        session: Option<SessionId>,
        /// Departed owner.
        owner: RealmOwner,
        /// Reason carried to terminated wait-operations.
        reason: String,
    },
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_module_and_name() {
        let event = Event {
            method: "Runtime.executionContextCreated".to_string(),
            params: json!({}),
            session_id: None,
        };
        assert_eq!(event.module(), "Runtime");
        assert_eq!(event.event_name(), "executionContextCreated");
    }

    #[test]
    fn test_target_info_from_cdp() {
        let info = TargetInfo::from_cdp(&json!({
            "targetId": "T1",
            "type": "iframe",
            "url": "https://example.com/frame",
            "title": "frame"
        }));
        assert_eq!(info.target_id, "T1");
        assert_eq!(info.kind, "iframe");
        assert_eq!(info.url, "https://example.com/frame");
    }

    #[test]
    fn test_realm_owner_display() {
        assert_eq!(RealmOwner::frame("F1").to_string(), "frame F1");
        assert_eq!(RealmOwner::worker("W1").to_string(), "worker W1");
        assert_eq!(RealmOwner::worker("W1").id(), "W1");
    }
}
