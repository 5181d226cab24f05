//! Session handle and shared state.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::debug;

use crate::connection::queue::Job;
use crate::connection::{Connection, ConnectionEvent, EventSignal, EventStream};
use crate::error::{Error, Result};
use crate::identifiers::{CallId, SessionId};
use crate::protocol::{Event, RealmOwner, TargetInfo};
use crate::realm::Realm;

// ============================================================================
// SessionShared
// ============================================================================

/// State shared between the session tree and every [`Session`] handle.
pub(crate) struct SessionShared {
    id: SessionId,
    parent: Option<SessionId>,
    target: TargetInfo,
    closed: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl SessionShared {
    pub(crate) fn new(id: SessionId, parent: Option<SessionId>, target: TargetInfo) -> Self {
        Self {
            id,
            parent,
            target,
            closed: AtomicBool::new(false),
            reason: Mutex::new(None),
        }
    }

    #[inline]
    pub(crate) fn id(&self) -> &SessionId {
        &self.id
    }

    #[inline]
    pub(crate) fn parent(&self) -> Option<&SessionId> {
        self.parent.as_ref()
    }

    #[inline]
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn close_reason(&self) -> Option<String> {
        self.reason.lock().clone()
    }

    /// Marks the session closed. Returns `false` if it already was.
    pub(crate) fn mark_closed(&self, reason: &str) -> bool {
        let mut guard = self.reason.lock();
        if guard.is_some() {
            return false;
        }
        *guard = Some(reason.to_string());
        self.closed.store(true, Ordering::Release);
        true
    }

    pub(crate) fn closed_error(&self) -> Error {
        let reason = self
            .close_reason()
            .unwrap_or_else(|| "session closed".to_string());
        Error::session_closed(self.id.clone(), reason)
    }
}

// ============================================================================
// Session
// ============================================================================

/// A logical channel to one target or browsing context.
///
/// Shares the connection's call id space; CDP envelopes are tagged with
/// the session id, BiDi commands name their context in params.
///
/// # Thread Safety
///
/// `Session` is `Clone + Send + Sync`; clones refer to the same session.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
    connection: Connection,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("parent", &self.shared.parent)
            .field("target", &self.shared.target)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Session {
    pub(crate) fn from_shared(shared: Arc<SessionShared>, connection: Connection) -> Self {
        Self { shared, connection }
    }
}

// ============================================================================
// Session - Accessors
// ============================================================================

impl Session {
    /// Returns the session id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.shared.id
    }

    /// Returns the parent session id (`None` = attached at the root).
    #[inline]
    #[must_use]
    pub fn parent_id(&self) -> Option<&SessionId> {
        self.shared.parent()
    }

    /// Returns the target metadata.
    #[inline]
    #[must_use]
    pub fn target(&self) -> &TargetInfo {
        &self.shared.target
    }

    /// Returns the owning connection.
    #[inline]
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Returns `true` once the session is closed.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Returns the close reason, if closed.
    #[must_use]
    pub fn close_reason(&self) -> Option<String> {
        self.shared.close_reason()
    }

    /// Returns the frame that owns the session's main realm.
    #[must_use]
    pub fn main_frame(&self) -> RealmOwner {
        RealmOwner::frame(&self.shared.target.target_id)
    }

    fn ensure_open(&self) -> Result<()> {
        if let Some(reason) = self.connection.close_reason() {
            return Err(Error::transport_closed(reason));
        }
        if self.shared.is_closed() {
            return Err(self.shared.closed_error());
        }
        Ok(())
    }
}

// ============================================================================
// Session - Calls
// ============================================================================

impl Session {
    /// Sends a session-scoped call without waiting for its response.
    ///
    /// # Errors
    ///
    /// - [`Error::SessionClosed`] if the session is closed
    /// - [`Error::TransportClosed`] if the connection is closed
    pub fn send(&self, method: &str, params: Value) -> Result<CallId> {
        self.ensure_open()?;
        self.connection.send(method, params, Some(self.id()))
    }

    /// Sends a session-scoped call and waits with the default timeout.
    ///
    /// # Errors
    ///
    /// - [`Error::SessionClosed`] if the session is (or becomes) closed
    /// - [`Error::Protocol`] if the peer answered with an error
    /// - [`Error::Timeout`] if no response arrived in time
    pub async fn send_and_wait(&self, method: &str, params: Value) -> Result<Value> {
        self.ensure_open()?;
        self.connection
            .send_and_wait(method, params, Some(self.id()))
            .await
    }

    /// Sends a session-scoped call and waits up to `timeout`.
    ///
    /// # Errors
    ///
    /// Same as [`send_and_wait`](Self::send_and_wait).
    pub async fn send_and_wait_with_timeout(
        &self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Value> {
        self.ensure_open()?;
        self.connection
            .send_and_wait_with_timeout(method, params, Some(self.id()), timeout)
            .await
    }
}

// ============================================================================
// Session - Lifecycle
// ============================================================================

impl Session {
    /// Closes this session and its descendants locally. Idempotent.
    ///
    /// Pending calls on the closed sessions fail with
    /// [`Error::SessionClosed`], their realms are destroyed, and a
    /// [`ConnectionEvent::SessionDetached`] is emitted per session,
    /// children first.
    pub async fn close(&self, reason: &str) {
        let (done, rx) = oneshot::channel();
        let pushed = self.connection.queue().push(Job::CloseSession {
            session: self.id().clone(),
            reason: reason.to_string(),
            done,
        });
        if pushed {
            let _ = rx.await;
        }
    }

    /// Asks the peer to detach, then closes locally.
    ///
    /// # Errors
    ///
    /// Returns the peer's error if the detach call fails; the session is
    /// closed locally regardless.
    pub async fn detach(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }

        let result = match self.connection.protocol().detach_call(self.id()) {
            Some(call) => self
                .connection
                .send_and_wait(call.method, call.params, self.parent_id())
                .await
                .map(|_| ()),
            None => Ok(()),
        };

        if let Err(ref e) = result {
            debug!(session = %self.id(), error = %e, "Detach call failed");
        }
        self.close("detached").await;
        result
    }

    /// Returns the attached child sessions.
    pub async fn children(&self) -> Vec<Session> {
        let id = self.id().clone();
        let connection = self.connection.clone();
        self.connection
            .query(move |state| state.sessions.children(Some(&id)))
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|shared| Session::from_shared(shared, connection.clone()))
            .collect()
    }
}

// ============================================================================
// Session - Events
// ============================================================================

impl Session {
    /// Subscribes to protocol events scoped to this session.
    #[must_use]
    pub fn events(&self) -> SessionEvents {
        SessionEvents {
            stream: self.connection.subscribe(),
            session: self.id().clone(),
        }
    }

    /// Waits for the next event named `method` scoped to this session.
    ///
    /// The subscription starts now; fails if the session closes first.
    #[must_use]
    pub fn wait_for_event(&self, method: &str) -> EventSignal<Event> {
        let session = self.id().clone();
        let method = method.to_string();
        let shared = Arc::clone(&self.shared);

        self.connection.signal(method.clone(), move |event| match event {
            ConnectionEvent::Protocol { scope, event } if scope.as_ref() == Some(&session) && event.method == method => {
                Some(Ok(event.clone()))
            }
            ConnectionEvent::SessionDetached { session: gone, .. } if gone == &session => {
                Some(Err(shared.closed_error()))
            }
            _ => None,
        })
    }
}

// ============================================================================
// Session - Realms
// ============================================================================

impl Session {
    /// Returns the live realms of this session.
    pub async fn realms(&self) -> Vec<Realm> {
        let id = self.id().clone();
        let connection = self.connection.clone();
        self.connection
            .query(move |state| state.realms.in_session(&id))
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|shared| Realm::from_shared(shared, connection.clone()))
            .collect()
    }

    /// Returns the live realm for `owner` / `sandbox`, if any.
    pub async fn current_realm(&self, owner: &RealmOwner, sandbox: Option<&str>) -> Option<Realm> {
        let id = self.id().clone();
        let owner = owner.clone();
        let sandbox = sandbox.map(str::to_string);
        let shared = self
            .connection
            .query(move |state| state.realms.current(Some(&id), &owner, sandbox.as_deref()))
            .await
            .ok()
            .flatten()?;
        Some(Realm::from_shared(shared, self.connection.clone()))
    }

    /// Returns the live realm for `owner` / `sandbox`, waiting for it to
    /// appear if needed.
    ///
    /// # Errors
    ///
    /// - [`Error::Timeout`] if no such realm appeared in time
    /// - [`Error::SessionClosed`] if the session closed first
    pub async fn wait_for_realm(
        &self,
        owner: &RealmOwner,
        sandbox: Option<&str>,
        timeout: Duration,
    ) -> Result<Realm> {
        self.ensure_open()?;

        // Subscribe before looking so a realm created in between is seen.
        let session = self.id().clone();
        let wanted_owner = owner.clone();
        let wanted_sandbox = sandbox.map(str::to_string);
        let shared = Arc::clone(&self.shared);
        let signal = self.connection.signal(
            format!("realm of {owner} in session {session}"),
            move |event| {
                let info = match event {
                    ConnectionEvent::RealmCreated(info) => info,
                    ConnectionEvent::RealmUpdated { current, .. } => current,
                    ConnectionEvent::SessionDetached { session: gone, .. } if gone == &session => {
                        return Some(Err(shared.closed_error()));
                    }
                    _ => return None,
                };
                (info.session.as_ref() == Some(&session)
                    && info.owner == wanted_owner
                    && info.sandbox == wanted_sandbox)
                    .then(|| Ok(info.id))
            },
        );

        if let Some(realm) = self.current_realm(owner, sandbox).await {
            return Ok(realm);
        }

        let realm_id = signal.wait(timeout).await?;
        self.connection
            .realm(realm_id)
            .await
            .ok_or_else(|| Error::realm_destroyed(realm_id, owner.to_string(), "destroyed before use"))
    }
}

// ============================================================================
// SessionEvents
// ============================================================================

/// Protocol events scoped to one session.
///
/// Ends when the session detaches or the connection closes.
pub struct SessionEvents {
    stream: EventStream,
    session: SessionId,
}

impl SessionEvents {
    /// Waits for the next event of this session.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.stream.recv().await? {
                ConnectionEvent::Protocol { scope, event } if scope.as_ref() == Some(&self.session) => {
                    return Some(event);
                }
                ConnectionEvent::SessionDetached { session, .. } if session == self.session => {
                    return None;
                }
                ConnectionEvent::Disconnected { .. } => return None,
                _ => {}
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionOptions;
    use crate::protocol::Protocol;
    use crate::transport::{MemoryPeer, MemoryTransport};
    use serde_json::json;

    fn connection() -> (Connection, MemoryPeer) {
        let (transport, inbound, peer) = MemoryTransport::pair();
        let connection = Connection::new(
            "memory://session",
            transport,
            inbound,
            Protocol::Cdp,
            ConnectionOptions::new(),
        )
        .expect("connection");
        (connection, peer)
    }

    async fn attach(connection: &Connection, parent: Option<&str>, id: &str) -> Session {
        connection
            .attach_session(
                parent.map(SessionId::from).as_ref(),
                SessionId::from(id),
                TargetInfo::new(id, "page"),
            )
            .await
            .expect("attach")
    }

    #[tokio::test]
    async fn test_calls_carry_session_id() {
        let (connection, peer) = connection();
        let session = attach(&connection, None, "S").await;

        session.send("Page.enable", json!({})).expect("send");

        let wire = peer.recv_json().await.expect("request");
        assert_eq!(wire["method"], "Page.enable");
        assert_eq!(wire["sessionId"], "S");
    }

    #[tokio::test]
    async fn test_detach_asks_peer_then_closes_subtree() {
        let (connection, peer) = connection();
        let parent = attach(&connection, None, "P").await;
        let child = attach(&connection, Some("P"), "C").await;
        assert_eq!(parent.children().await.len(), 1);

        let detaching = tokio::spawn({
            let parent = parent.clone();
            async move { parent.detach().await }
        });
        let wire = peer.recv_json().await.expect("request");
        assert_eq!(wire["method"], "Target.detachFromTarget");
        assert_eq!(wire["params"]["sessionId"], "P");
        assert!(wire.get("sessionId").is_none());
        peer.deliver_json(&json!({"id": wire["id"], "result": {}}));

        detaching.await.expect("join").expect("detach");
        assert!(parent.is_closed());
        assert!(child.is_closed());
        assert_eq!(child.close_reason().as_deref(), Some("detached"));

        let err = child.send("Page.reload", json!({})).expect_err("closed");
        assert_eq!(err.kind(), crate::ErrorKind::SessionClosed);
        assert!(peer.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_events_are_scoped_to_the_session() {
        let (connection, peer) = connection();
        let session = attach(&connection, None, "S").await;
        let _other = attach(&connection, None, "T").await;
        let mut events = session.events();

        peer.deliver_json(&json!({"method": "Page.loadEventFired", "sessionId": "T", "params": {}}));
        peer.deliver_json(&json!({"method": "Page.frameNavigated", "params": {}}));
        peer.deliver_json(&json!({"method": "Page.domContentEventFired", "sessionId": "S", "params": {}}));

        let event = events.recv().await.expect("event");
        assert_eq!(event.method, "Page.domContentEventFired");

        session.close("done").await;
        assert!(events.recv().await.is_none());
    }
}
